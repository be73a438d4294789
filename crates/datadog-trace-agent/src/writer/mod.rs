// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Trace writer: batches sampled traces and ships them to the intake.
//!
//! Sampled traces accumulate in a payload buffer that is flushed periodically
//! and whenever adding a package would exceed `max_spans_per_payload`. A
//! flush protobuf-encodes the buffer into a `TracePayload`, gzips it at
//! best-speed (falling back to identity encoding when compression fails) and
//! hands it to the sender on a detached task. Writer statistics are atomics,
//! snapshot-and-swapped onto the metrics client every update period.

pub mod sender;

pub use sender::{ApiSender, Payload, PayloadSender, SendError, SendOutcome};

use std::io::Write as _;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use datadog_trace_protos::pb;
use flate2::write::GzEncoder;
use flate2::Compression;
use prost::Message;
use tokio::sync::mpsc;
use tokio::time::{interval_at, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::TraceWriterSettings;
use crate::model::{Span, Trace};
use crate::telemetry::{names, MetricsClient};

/// The result of a sampling decision handed to the writer. A package with no
/// trace can still carry analyzed transaction spans.
#[derive(Debug, Default)]
pub struct TracePackage {
    pub trace: Option<Trace>,
    pub events: Vec<Span>,
}

impl TracePackage {
    pub fn is_empty(&self) -> bool {
        self.trace.as_ref().map_or(true, Vec::is_empty) && self.events.is_empty()
    }

    fn span_count(&self) -> usize {
        self.trace.as_ref().map_or(0, Vec::len) + self.events.len()
    }
}

/// Writer counters, swapped to zero on every report.
#[derive(Default)]
pub struct TraceWriterStats {
    pub payloads: AtomicI64,
    pub traces: AtomicI64,
    pub events: AtomicI64,
    pub spans: AtomicI64,
    pub bytes: AtomicI64,
    pub retries: AtomicI64,
    pub errors: AtomicI64,
    pub single_max_spans: AtomicI64,
}

pub struct TraceWriter {
    conf: TraceWriterSettings,
    hostname: String,
    env: String,
    rx: mpsc::Receiver<TracePackage>,

    traces: Vec<pb::ApiTrace>,
    transactions: Vec<Span>,
    spans_in_buffer: usize,

    sender: Arc<dyn PayloadSender>,
    stats: Arc<TraceWriterStats>,
    metrics: Arc<dyn MetricsClient>,
}

impl TraceWriter {
    pub fn new(
        conf: TraceWriterSettings,
        hostname: String,
        env: String,
        rx: mpsc::Receiver<TracePackage>,
        sender: Arc<dyn PayloadSender>,
        metrics: Arc<dyn MetricsClient>,
    ) -> Self {
        TraceWriter {
            conf,
            hostname,
            env,
            rx,
            traces: Vec::new(),
            transactions: Vec::new(),
            spans_in_buffer: 0,
            sender,
            stats: Arc::new(TraceWriterStats::default()),
            metrics,
        }
    }

    /// Main writer loop. On shutdown, flushes whatever is buffered and
    /// reports a final round of statistics before returning.
    pub async fn run(mut self, shutdown: CancellationToken) {
        debug!("starting trace writer");
        let start = tokio::time::Instant::now();
        let mut flush_ticker = interval_at(start + self.conf.flush_period, self.conf.flush_period);
        flush_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut info_ticker = interval_at(
            start + self.conf.update_info_period,
            self.conf.update_info_period,
        );
        info_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("exiting trace writer, flushing all remaining traces");
                    self.flush();
                    self.update_info();
                    return;
                }
                Some(package) = self.rx.recv() => {
                    self.handle_package(package);
                }
                _ = flush_ticker.tick() => {
                    self.flush();
                }
                _ = info_ticker.tick() => {
                    self.update_info();
                }
            }
        }
    }

    fn handle_package(&mut self, package: TracePackage) {
        if package.is_empty() {
            debug!("ignoring empty trace package");
            return;
        }

        let n = package.span_count();
        if self.spans_in_buffer > 0 && self.spans_in_buffer + n > self.conf.max_spans_per_payload {
            debug!("flushing because the max spans per payload limit was reached");
            self.flush();
        }

        if let Some(trace) = package.trace {
            if !trace.is_empty() {
                self.spans_in_buffer += trace.len();
                self.traces.push(api_trace(trace));
            }
        }
        self.spans_in_buffer += package.events.len();
        self.transactions.extend(package.events);

        if n > self.conf.max_spans_per_payload {
            // A single package beyond the limit still ships, but is counted.
            self.stats.single_max_spans.fetch_add(1, Ordering::Relaxed);
            self.flush();
        }
    }

    fn flush(&mut self) {
        let num_traces = self.traces.len();
        let num_events = self.transactions.len();
        if num_traces == 0 && num_events == 0 {
            return;
        }

        self.stats
            .traces
            .fetch_add(num_traces as i64, Ordering::Relaxed);
        self.stats
            .events
            .fetch_add(num_events as i64, Ordering::Relaxed);
        self.stats
            .spans
            .fetch_add(self.spans_in_buffer as i64, Ordering::Relaxed);

        let payload = pb::TracePayload {
            host_name: self.hostname.clone(),
            env: self.env.clone(),
            traces: std::mem::take(&mut self.traces),
            transactions: std::mem::take(&mut self.transactions),
        };
        self.spans_in_buffer = 0;

        let serialized = payload.encode_to_vec();

        let mut encoding: &'static str = "identity";
        let mut gz = GzEncoder::new(
            Vec::with_capacity(serialized.len() / 2),
            Compression::fast(),
        );
        let body = match gz.write_all(&serialized).and_then(|()| gz.finish()) {
            Ok(compressed) => {
                encoding = "gzip";
                compressed
            }
            Err(e) => {
                error!(error = %e, "failed to compress payload, sending uncompressed");
                serialized
            }
        };

        self.stats
            .bytes
            .fetch_add(body.len() as i64, Ordering::Relaxed);

        debug!(
            traces = num_traces,
            events = num_events,
            bytes = body.len(),
            encoding,
            "flushing trace payload"
        );

        let sender = self.sender.clone();
        let stats = self.stats.clone();
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            let start = Instant::now();
            match sender.send(Payload { body, encoding }).await {
                Ok(outcome) => {
                    stats.payloads.fetch_add(1, Ordering::Relaxed);
                    stats
                        .retries
                        .fetch_add(outcome.retries as i64, Ordering::Relaxed);
                    metrics.gauge(
                        names::TRACE_WRITER_FLUSH_DURATION,
                        start.elapsed().as_secs_f64(),
                        &[],
                    );
                }
                Err(err) => {
                    stats.errors.fetch_add(1, Ordering::Relaxed);
                    stats
                        .retries
                        .fetch_add(err.retries as i64, Ordering::Relaxed);
                    error!(error = %err, "failed to flush trace payload");
                }
            }
        });
    }

    /// Snapshots and resets all counters, reporting them downstream.
    fn update_info(&self) {
        let report = [
            (names::TRACE_WRITER_PAYLOADS, &self.stats.payloads),
            (names::TRACE_WRITER_TRACES, &self.stats.traces),
            (names::TRACE_WRITER_EVENTS, &self.stats.events),
            (names::TRACE_WRITER_SPANS, &self.stats.spans),
            (names::TRACE_WRITER_BYTES, &self.stats.bytes),
            (names::TRACE_WRITER_RETRIES, &self.stats.retries),
            (names::TRACE_WRITER_ERRORS, &self.stats.errors),
            (
                names::TRACE_WRITER_SINGLE_MAX_SPANS,
                &self.stats.single_max_spans,
            ),
        ];
        for (name, counter) in report {
            self.metrics.count(name, counter.swap(0, Ordering::Relaxed), &[]);
        }
    }
}

/// Converts a trace into its intake representation, bracketing the span
/// start/end range.
fn api_trace(trace: Trace) -> pb::ApiTrace {
    let trace_id = trace.first().map(|s| s.trace_id).unwrap_or_default();
    let start_time = trace.iter().map(|s| s.start).min().unwrap_or_default();
    let end_time = trace
        .iter()
        .map(|s| s.start + s.duration)
        .max()
        .unwrap_or_default();
    pb::ApiTrace {
        trace_id,
        spans: trace,
        start_time,
        end_time,
    }
}

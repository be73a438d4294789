// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Stratified reservoir sampling.
//!
//! Traces are partitioned into strata by structural signature; each stratum
//! keeps one candidate and the flush scheduler emits candidates at the
//! configured rate, round-robin across strata. [`ReservoirSampler`] is the
//! facade the pipeline talks to: it computes signatures, admits traces and
//! nudges the scheduler when traces have waited long enough.

pub mod flusher;
pub mod reservoir;
pub mod signature;

pub use flusher::{Flusher, FlusherHandle};
pub use reservoir::{trace_approximate_size, Reservoir, StratifiedReservoir};
pub use signature::{compute_signature_with_root_and_env, Signature};

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::model::ProcessedTrace;
use crate::telemetry::{names, MetricsClient};

/// Capacity of the new-signature queue between reservoir and scheduler.
const NEW_SIGNATURE_QUEUE_SIZE: usize = 50;
/// A stratum with no successful flush for this long is evicted.
const MAX_NO_FLUSH_INTERVAL: Duration = Duration::from_secs(30);
/// Cadence of reservoir gauge reporting.
const STATS_REPORT_INTERVAL: Duration = Duration::from_secs(15);

/// Receives every sampling decision: the trace and whether it was kept.
pub type DecisionCallback = Arc<dyn Fn(ProcessedTrace, bool) + Send + Sync>;

/// Facade wiring the stratified reservoir to its flush scheduler.
pub struct ReservoirSampler {
    reservoir: Arc<StratifiedReservoir>,
    handle: FlusherHandle,
    flusher: Option<Flusher>,
    min_fps: f64,
    metrics: Arc<dyn MetricsClient>,
}

impl ReservoirSampler {
    /// `max_tps` is the overall target emission rate; half is served by the
    /// steady flush tick and the other half funds the ticket pool used to
    /// shorten tail latency.
    pub fn new(
        max_tps: f64,
        memory_limit: u64,
        decision_cb: DecisionCallback,
        metrics: Arc<dyn MetricsClient>,
    ) -> Self {
        let min_fps = max_tps / 2.0;
        let target_fps = max_tps - min_fps;
        let num_tickets = min_fps.round() as usize;

        let (sig_tx, sig_rx) = mpsc::channel(NEW_SIGNATURE_QUEUE_SIZE);

        let drop_cb = decision_cb.clone();
        let reservoir = Arc::new(StratifiedReservoir::new(
            memory_limit,
            sig_tx,
            Box::new(move |t| drop_cb(t, false)),
        ));

        let flush_cb = decision_cb;
        let (flusher, handle) = Flusher::new(
            target_fps,
            MAX_NO_FLUSH_INTERVAL,
            num_tickets,
            reservoir.clone(),
            sig_rx,
            Box::new(move |t| flush_cb(t, true)),
        );

        ReservoirSampler {
            reservoir,
            handle,
            flusher: Some(flusher),
            min_fps,
            metrics,
        }
    }

    /// Spawns the scheduler loop and the gauge reporter.
    pub fn start(&mut self, shutdown: &CancellationToken) {
        if let Some(flusher) = self.flusher.take() {
            tokio::spawn(flusher.run(shutdown.clone()));
        }
        tokio::spawn(report_stats(
            self.reservoir.clone(),
            self.metrics.clone(),
            shutdown.clone(),
        ));
    }

    /// Admits a processed trace into its stratum, then pulls a flush forward
    /// when the oldest held trace has been waiting at least `1/min_fps`
    /// seconds (or trace time regressed).
    pub fn sample(&self, trace: ProcessedTrace) {
        let sig = compute_signature_with_root_and_env(&trace.trace, trace.root, &trace.env);
        let end_ns = trace.end_ns();
        debug!(signature = %sig, trace_id = trace.trace_id(), "sampling trace");
        self.reservoir.add(sig, trace);

        if self.min_fps <= 0.0 {
            return;
        }
        let oldest_ns = self.reservoir.oldest_trace_end_ns(current_time_ns());
        let waited_ns = end_ns - oldest_ns;
        let threshold_ns = (1e9 / self.min_fps) as i64;
        if waited_ns < 0 || waited_ns >= threshold_ns {
            self.handle.ticket_flush();
        }
    }

    /// Collapses all strata into the overflow stratum; used under memory
    /// pressure.
    pub fn shrink(&self) {
        self.reservoir.shrink();
    }

    pub fn reservoir(&self) -> &Arc<StratifiedReservoir> {
        &self.reservoir
    }
}

fn current_time_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

async fn report_stats(
    reservoir: Arc<StratifiedReservoir>,
    metrics: Arc<dyn MetricsClient>,
    shutdown: CancellationToken,
) {
    let mut ticker = interval(STATS_REPORT_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {
                metrics.count(
                    names::RESERVOIR_MEMORY_SIZE,
                    reservoir.memory_size() as i64,
                    &[],
                );
                metrics.count(
                    names::RESERVOIR_SIGNATURE_CARDINALITY,
                    reservoir.signature_cardinality() as i64,
                    &[],
                );
                if reservoir.is_full() {
                    metrics.count(names::RESERVOIR_FULL, 1, &[]);
                }
            }
        }
    }
}

// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pipeline orchestrator.
//!
//! The agent owns the bounded channels between the external receiver, the
//! per-trace processing stage, the reservoir sampler and the trace writer:
//!
//! ```text
//! receiver -> raw traces (5000) -> process() -> sampler -> packages (50) -> writer
//!                                      \-> processed stats (50) -> concentrator
//! ```
//!
//! Per-trace processing validates and enriches each trace (normalization,
//! top-level flags, sublayers, signature admission). Failures never cross
//! trace boundaries: a bad span drops its own trace with a debug log and a
//! counter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::filters::{Blacklister, Replacer};
use crate::model::{
    compute_sublayers, compute_top_level, extract_top_level_subtraces, get_root, normalize,
    set_sublayers_on_span, span, trace_env, ProcessedTrace, Span, SublayerValue, Trace,
};
use crate::sampler::ReservoirSampler;
use crate::telemetry::MetricsClient;
use crate::writer::{ApiSender, PayloadSender, TracePackage, TraceWriter};

/// Capacity of the receiver-to-orchestrator channel (~1000 traces/s for 5s).
pub const RAW_TRACE_CHANNEL_CAPACITY: usize = 5000;
/// Capacity of the sampler-to-writer channel.
pub const TRACE_PACKAGE_CHANNEL_CAPACITY: usize = 50;
/// Capacity of the processed-trace channel feeding the stats concentrator.
pub const STATS_CHANNEL_CAPACITY: usize = 50;

/// Counters for the per-trace processing stage.
#[derive(Default)]
pub struct ProcessStats {
    pub traces_received: AtomicU64,
    pub traces_dropped: AtomicU64,
    pub traces_filtered: AtomicU64,
}

/// Handles the orchestrator hands to its external collaborators: the
/// receiver pushes raw traces into `trace_tx`; the stats concentrator
/// consumes `stats_rx`.
pub struct AgentChannels {
    pub trace_tx: mpsc::Sender<Trace>,
    pub stats_rx: mpsc::Receiver<ProcessedTrace>,
}

pub struct Agent {
    config: Arc<Config>,
    blacklister: Blacklister,
    replacer: Replacer,
    sampler: ReservoirSampler,
    raw_rx: mpsc::Receiver<Trace>,
    stats_tx: mpsc::Sender<ProcessedTrace>,
    writer: Option<TraceWriter>,
    shutdown: CancellationToken,
    stats: Arc<ProcessStats>,
}

impl Agent {
    /// Builds the agent with the production sender.
    pub fn new(
        config: Arc<Config>,
        shutdown: CancellationToken,
        metrics: Arc<dyn MetricsClient>,
    ) -> Result<(Agent, AgentChannels)> {
        let sender = Arc::new(ApiSender::from_config(&config)?);
        Ok(Self::with_sender(config, shutdown, metrics, sender))
    }

    /// Builds the agent with a caller-provided payload sender.
    pub fn with_sender(
        config: Arc<Config>,
        shutdown: CancellationToken,
        metrics: Arc<dyn MetricsClient>,
        sender: Arc<dyn PayloadSender>,
    ) -> (Agent, AgentChannels) {
        let (trace_tx, raw_rx) = mpsc::channel(RAW_TRACE_CHANNEL_CAPACITY);
        let (package_tx, package_rx) = mpsc::channel(TRACE_PACKAGE_CHANNEL_CAPACITY);
        let (stats_tx, stats_rx) = mpsc::channel(STATS_CHANNEL_CAPACITY);

        let decision_tx = package_tx;
        let sampler = ReservoirSampler::new(
            config.max_traces_per_second,
            config.reservoir_memory_limit,
            Arc::new(move |trace: ProcessedTrace, sampled: bool| {
                if !sampled {
                    debug!(trace_id = trace.trace_id(), "trace not sampled");
                    return;
                }
                let package = TracePackage {
                    trace: Some(trace.trace),
                    events: Vec::new(),
                };
                if decision_tx.try_send(package).is_err() {
                    warn!("trace package channel full, dropping sampled trace");
                }
            }),
            metrics.clone(),
        );

        let writer = TraceWriter::new(
            config.trace_writer.clone(),
            config.hostname.clone(),
            config.default_env.clone(),
            package_rx,
            sender,
            metrics,
        );

        let agent = Agent {
            blacklister: Blacklister::new(config.ignore_resources.clone()),
            replacer: Replacer::new(config.replace_tags.clone()),
            sampler,
            raw_rx,
            stats_tx,
            writer: Some(writer),
            shutdown,
            stats: Arc::new(ProcessStats::default()),
            config,
        };
        (agent, AgentChannels { trace_tx, stats_rx })
    }

    pub fn process_stats(&self) -> Arc<ProcessStats> {
        self.stats.clone()
    }

    /// Runs the orchestrator until cancellation, then drains in-flight
    /// traces and lets the writer flush its remainders.
    pub async fn run(mut self) {
        if let Some(writer) = self.writer.take() {
            tokio::spawn(writer.run(self.shutdown.clone()));
        }
        self.sampler.start(&self.shutdown);
        info!("trace agent started");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                received = self.raw_rx.recv() => match received {
                    Some(trace) => self.process(trace),
                    None => break,
                }
            }
        }

        // Bounded drain: whatever the receiver already enqueued is processed,
        // nothing new is accepted.
        self.raw_rx.close();
        while let Ok(trace) = self.raw_rx.try_recv() {
            self.process(trace);
        }

        info!(
            received = self.stats.traces_received.load(Ordering::Relaxed),
            dropped = self.stats.traces_dropped.load(Ordering::Relaxed),
            filtered = self.stats.traces_filtered.load(Ordering::Relaxed),
            "trace agent exiting"
        );
    }

    /// The default work unit: takes one raw trace, transforms it and passes
    /// it downstream.
    pub fn process(&self, mut trace: Trace) {
        self.stats.traces_received.fetch_add(1, Ordering::Relaxed);

        let Some(root) = get_root(&trace) else {
            debug!("skipping received empty trace");
            self.stats.traces_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };

        // Extract the priority before anything else mutates the metrics map.
        let priority = span::sampling_priority(&trace[root]);

        if !self.blacklister.allows(&trace[root]) {
            debug!(resource = %trace[root].resource, "trace rejected by blacklister");
            self.stats.traces_filtered.fetch_add(1, Ordering::Relaxed);
            return;
        }

        self.replacer.replace(&mut trace);

        for s in trace.iter_mut() {
            if let Err(err) = normalize(s) {
                debug!(error = %err, trace_id = s.trace_id, "dropping trace: normalization failed");
                self.stats.traces_dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        // Fold the configured extra rate into the client-applied rate so
        // downstream weighting sees a single number.
        let rate = span::applied_sample_rate(&trace[root]) * self.config.extra_sample_rate;
        span::set_applied_sample_rate(&mut trace[root], rate);

        compute_top_level(&mut trace);

        let subtraces = extract_top_level_subtraces(&trace);
        let computed: Vec<(usize, u64, Vec<SublayerValue>)> = subtraces
            .iter()
            .map(|st| {
                let spans: Vec<&Span> = st.spans.iter().map(|&i| &trace[i]).collect();
                (st.root, trace[st.root].span_id, compute_sublayers(&spans))
            })
            .collect();

        let mut sublayers = HashMap::with_capacity(computed.len());
        for (root_idx, span_id, values) in computed {
            set_sublayers_on_span(&mut trace[root_idx], &values);
            sublayers.insert(span_id, values);
        }

        let env = trace_env(&trace)
            .map(str::to_string)
            .unwrap_or_else(|| self.config.default_env.clone());

        let processed = ProcessedTrace {
            trace,
            root,
            env,
            sublayers,
        };

        // Everything reaches the concentrator for stats, sampled or not.
        if self.stats_tx.try_send(processed.clone()).is_err() {
            debug!("stats channel full, dropping stats-only copy");
        }

        // Client-rejected traces skip sampling entirely.
        if priority.map_or(false, |p| p < 0) {
            return;
        }

        self.sampler.sample(processed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ObfuscationSettings, ProxySettings, TraceWriterSettings};
    use crate::filters::ReplaceRule;
    use crate::model::normalize::YEAR_2000_NS;
    use crate::telemetry::LogMetricsClient;
    use crate::writer::{Payload, SendError, SendOutcome};
    use regex::Regex;

    struct NullSender;

    #[async_trait::async_trait]
    impl PayloadSender for NullSender {
        async fn send(&self, _payload: Payload) -> Result<SendOutcome, SendError> {
            Ok(SendOutcome::default())
        }
    }

    fn test_config() -> Config {
        Config {
            api_key: "test-key".to_string(),
            hostname: "host".to_string(),
            default_env: "none".to_string(),
            site: "datadoghq.com".to_string(),
            endpoint_url: "http://localhost:0".to_string(),
            additional_endpoints: HashMap::new(),
            proxy: ProxySettings::default(),
            skip_ssl_validation: false,
            extra_sample_rate: 1.0,
            max_traces_per_second: 10.0,
            ignore_resources: vec![Regex::new("^GET /ignored$").unwrap()],
            replace_tags: vec![ReplaceRule {
                name: "resource.name".to_string(),
                re: Regex::new(r"/users/\d+").unwrap(),
                repl: "/users/?".to_string(),
            }],
            trace_writer: TraceWriterSettings::default(),
            obfuscation: ObfuscationSettings::default(),
            reservoir_memory_limit: 100 * 1024 * 1024,
            log_level: "debug".to_string(),
        }
    }

    fn test_agent() -> (Agent, AgentChannels) {
        Agent::with_sender(
            Arc::new(test_config()),
            CancellationToken::new(),
            Arc::new(LogMetricsClient),
            Arc::new(NullSender),
        )
    }

    fn span(trace_id: u64, span_id: u64, parent_id: u64, service: &str) -> Span {
        Span {
            trace_id,
            span_id,
            parent_id,
            service: service.to_string(),
            name: "http.request".to_string(),
            resource: "GET /users/428".to_string(),
            start: YEAR_2000_NS + 1_000,
            duration: 100,
            r#type: "web".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_process_enriches_and_forwards_stats() {
        let (agent, mut channels) = test_agent();

        agent.process(vec![span(1, 1, 0, "web"), span(1, 2, 1, "db")]);

        let processed = channels.stats_rx.try_recv().unwrap();
        assert_eq!(processed.trace_id(), 1);
        assert_eq!(processed.env, "none");
        assert_eq!(processed.root, 0);
        // Replace rule redacted the user id in the resource.
        assert_eq!(processed.root_span().resource, "GET /users/?");
        // Both spans start service boundaries here.
        assert!(span::is_top_level(&processed.trace[0]));
        assert!(span::is_top_level(&processed.trace[1]));
        // Each top-level span carries its sublayer metrics.
        assert!(processed.sublayers.contains_key(&1));
        assert!(processed.sublayers.contains_key(&2));
        assert!(processed.trace[0]
            .metrics
            .contains_key("_sublayers.span_count"));

        // And the trace was admitted into a stratum.
        assert_eq!(agent.sampler.reservoir().signature_cardinality(), 1);
    }

    #[tokio::test]
    async fn test_process_drops_empty_trace() {
        let (agent, mut channels) = test_agent();
        agent.process(Vec::new());
        assert!(channels.stats_rx.try_recv().is_err());
        assert_eq!(agent.stats.traces_dropped.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_process_drops_trace_on_invalid_span() {
        let (agent, mut channels) = test_agent();
        let mut bad = span(1, 2, 1, "db");
        bad.duration = 0;
        agent.process(vec![span(1, 1, 0, "web"), bad]);

        assert!(channels.stats_rx.try_recv().is_err());
        assert_eq!(agent.stats.traces_dropped.load(Ordering::Relaxed), 1);
        assert_eq!(agent.sampler.reservoir().signature_cardinality(), 0);
    }

    #[tokio::test]
    async fn test_process_blacklists_by_root_resource() {
        let (agent, mut channels) = test_agent();
        let mut root = span(1, 1, 0, "web");
        root.resource = "GET /ignored".to_string();
        agent.process(vec![root]);

        assert!(channels.stats_rx.try_recv().is_err());
        assert_eq!(agent.stats.traces_filtered.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_negative_priority_skips_sampler_but_not_stats() {
        let (agent, mut channels) = test_agent();
        let mut root = span(1, 1, 0, "web");
        span::set_metric(&mut root, span::KEY_SAMPLING_PRIORITY, -1.0);
        agent.process(vec![root]);

        assert!(channels.stats_rx.try_recv().is_ok(), "stats still forwarded");
        assert_eq!(agent.sampler.reservoir().signature_cardinality(), 0);
    }

    #[tokio::test]
    async fn test_extra_sample_rate_applied() {
        let mut config = test_config();
        config.extra_sample_rate = 0.5;
        let (agent, mut channels) = Agent::with_sender(
            Arc::new(config),
            CancellationToken::new(),
            Arc::new(LogMetricsClient),
            Arc::new(NullSender),
        );

        let mut root = span(1, 1, 0, "web");
        span::set_applied_sample_rate(&mut root, 0.5);
        agent.process(vec![root]);

        let processed = channels.stats_rx.try_recv().unwrap();
        assert_eq!(span::applied_sample_rate(processed.root_span()), 0.25);
    }

    #[tokio::test]
    async fn test_trace_env_overrides_default() {
        let (agent, mut channels) = test_agent();
        let mut root = span(1, 1, 0, "web");
        root.meta
            .insert(span::KEY_ENV.to_string(), "staging".to_string());
        agent.process(vec![root]);

        let processed = channels.stats_rx.try_recv().unwrap();
        assert_eq!(processed.env, "staging");
    }
}

// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Internal telemetry seam.
//!
//! The metrics exporter itself lives outside the agent core; components
//! report through [`MetricsClient`] so production wiring can plug in a
//! statsd-style client while tests and the default binary log instead.

use tracing::debug;

pub mod names {
    pub const TRACE_WRITER_PAYLOADS: &str = "datadog.trace_agent.trace_writer.payloads";
    pub const TRACE_WRITER_TRACES: &str = "datadog.trace_agent.trace_writer.traces";
    pub const TRACE_WRITER_EVENTS: &str = "datadog.trace_agent.trace_writer.events";
    pub const TRACE_WRITER_SPANS: &str = "datadog.trace_agent.trace_writer.spans";
    pub const TRACE_WRITER_BYTES: &str = "datadog.trace_agent.trace_writer.bytes";
    pub const TRACE_WRITER_RETRIES: &str = "datadog.trace_agent.trace_writer.retries";
    pub const TRACE_WRITER_ERRORS: &str = "datadog.trace_agent.trace_writer.errors";
    pub const TRACE_WRITER_SINGLE_MAX_SPANS: &str =
        "datadog.trace_agent.trace_writer.single_max_spans";
    pub const TRACE_WRITER_FLUSH_DURATION: &str =
        "datadog.trace_agent.trace_writer.flush_duration";

    pub const RESERVOIR_MEMORY_SIZE: &str = "datadog.trace_agent.reservoir.memory_size";
    pub const RESERVOIR_SIGNATURE_CARDINALITY: &str =
        "datadog.trace_agent.reservoir.signature_cardinality";
    pub const RESERVOIR_FULL: &str = "datadog.trace_agent.reservoir.full";
}

pub trait MetricsClient: Send + Sync {
    fn count(&self, name: &str, value: i64, tags: &[String]);
    fn gauge(&self, name: &str, value: f64, tags: &[String]);
}

/// Default client: reports through the log stream.
pub struct LogMetricsClient;

impl MetricsClient for LogMetricsClient {
    fn count(&self, name: &str, value: i64, tags: &[String]) {
        debug!(metric = name, value, ?tags, "count");
    }

    fn gauge(&self, name: &str, value: f64, tags: &[String]) {
        debug!(metric = name, value, ?tags, "gauge");
    }
}

#[cfg(test)]
pub mod testutil {
    use super::MetricsClient;
    use std::sync::Mutex;

    /// Captures reported metrics for assertions.
    #[derive(Default)]
    pub struct CapturingMetricsClient {
        pub counts: Mutex<Vec<(String, i64)>>,
        pub gauges: Mutex<Vec<(String, f64)>>,
    }

    impl MetricsClient for CapturingMetricsClient {
        fn count(&self, name: &str, value: i64, _tags: &[String]) {
            self.counts.lock().unwrap().push((name.to_string(), value));
        }

        fn gauge(&self, name: &str, value: f64, _tags: &[String]) {
            self.gauges.lock().unwrap().push((name.to_string(), value));
        }
    }
}

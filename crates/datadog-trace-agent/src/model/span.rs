// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Span helpers shared across the pipeline.
//!
//! The wire type lives in `datadog-trace-protos`; this module adds the
//! accessors the agent needs for trace-level metadata carried on the root
//! span (sampling priority, applied sample rate, the `env` tag).

pub use datadog_trace_protos::pb::Span;

/// Root-span metric carrying the client sampling priority.
pub const KEY_SAMPLING_PRIORITY: &str = "_sampling_priority_v1";
/// Root-span metric carrying the sample rate already applied upstream.
pub const KEY_SAMPLE_RATE: &str = "_sample_rate";
/// Metric flag marking a span that begins a new service boundary.
pub const KEY_TOP_LEVEL: &str = "_top_level";
/// Meta tag carrying the tracer-provided environment.
pub const KEY_ENV: &str = "env";

pub fn set_metric(span: &mut Span, key: &str, value: f64) {
    span.metrics.insert(key.to_string(), value);
}

pub fn metric(span: &Span, key: &str) -> Option<f64> {
    span.metrics.get(key).copied()
}

/// Client sampling priority, if the tracer set one.
pub fn sampling_priority(span: &Span) -> Option<i32> {
    metric(span, KEY_SAMPLING_PRIORITY).map(|v| v as i32)
}

/// Sample rate applied by the client, defaulting to 1 when unset.
pub fn applied_sample_rate(span: &Span) -> f64 {
    metric(span, KEY_SAMPLE_RATE).unwrap_or(1.0)
}

pub fn set_applied_sample_rate(span: &mut Span, rate: f64) {
    set_metric(span, KEY_SAMPLE_RATE, rate);
}

pub fn is_top_level(span: &Span) -> bool {
    metric(span, KEY_TOP_LEVEL) == Some(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span() -> Span {
        Span {
            trace_id: 1,
            span_id: 1,
            service: "svc".to_string(),
            name: "op".to_string(),
            resource: "res".to_string(),
            start: 1,
            duration: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_sampling_priority() {
        let mut s = span();
        assert_eq!(sampling_priority(&s), None);
        set_metric(&mut s, KEY_SAMPLING_PRIORITY, -1.0);
        assert_eq!(sampling_priority(&s), Some(-1));
    }

    #[test]
    fn test_applied_sample_rate_defaults_to_one() {
        let mut s = span();
        assert_eq!(applied_sample_rate(&s), 1.0);
        set_applied_sample_rate(&mut s, 0.25);
        assert_eq!(applied_sample_rate(&s), 0.25);
    }
}

// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sublayer computation: apportioning a trace's wall-clock time across
//! (service, span type) cohorts.
//!
//! The trace is cut into intervals at every span start and end. Within an
//! interval, a span is *active* when it covers the interval and none of its
//! direct children does; the interval's duration is then split across the
//! active spans and credited to their service and type. Splitting uses
//! integer nanosecond division: a cohort with `k` of the `|A|` active spans
//! receives `k·Δ/|A|` truncated to whole nanoseconds.

use std::collections::HashMap;

use super::span::{set_metric, Span};

/// Metric name for per-service duration attribution.
pub const METRIC_DURATION_BY_SERVICE: &str = "_sublayers.duration.by_service";
/// Metric name for per-type duration attribution.
pub const METRIC_DURATION_BY_TYPE: &str = "_sublayers.duration.by_type";
/// Metric name for the span count of the subtrace.
pub const METRIC_SPAN_COUNT: &str = "_sublayers.span_count";

const TAG_SERVICE: &str = "sublayer_service";
const TAG_TYPE: &str = "sublayer_type";

/// Tag qualifying a sublayer value (e.g. `sublayer_service:web`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SublayerTag {
    pub name: String,
    pub value: String,
}

impl std::fmt::Display for SublayerTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.name, self.value)
    }
}

/// One computed sublayer metric value.
#[derive(Clone, Debug, PartialEq)]
pub struct SublayerValue {
    pub metric: String,
    pub tag: Option<SublayerTag>,
    pub value: f64,
}

/// Computes sublayer values for the given spans (usually one subtrace).
///
/// Returns per-service durations (sorted by service), per-type durations
/// (sorted by type, empty types skipped) and the span count, in that order.
pub fn compute_sublayers(spans: &[&Span]) -> Vec<SublayerValue> {
    let mut values = Vec::new();
    if spans.is_empty() {
        return values;
    }

    let timestamps = build_timestamps(spans);
    let active = build_active_spans_mapping(spans, &timestamps);

    let mut duration_by_service: HashMap<&str, i64> = HashMap::new();
    let mut duration_by_type: HashMap<&str, i64> = HashMap::new();

    for window in timestamps.windows(2) {
        let (ts, next) = (window[0], window[1]);
        let Some(active_spans) = active.get(&ts) else {
            continue;
        };
        if active_spans.is_empty() {
            continue;
        }
        let delta = next - ts;
        let active_count = active_spans.len() as i64;

        let mut service_counts: HashMap<&str, i64> = HashMap::new();
        let mut type_counts: HashMap<&str, i64> = HashMap::new();
        for &idx in active_spans {
            let span = spans[idx];
            *service_counts.entry(span.service.as_str()).or_default() += 1;
            if !span.r#type.is_empty() {
                *type_counts.entry(span.r#type.as_str()).or_default() += 1;
            }
        }

        for (service, k) in service_counts {
            *duration_by_service.entry(service).or_default() += k * delta / active_count;
        }
        for (ty, k) in type_counts {
            *duration_by_type.entry(ty).or_default() += k * delta / active_count;
        }
    }

    let mut services: Vec<_> = duration_by_service.into_iter().collect();
    services.sort_unstable_by_key(|(name, _)| *name);
    for (service, duration) in services {
        values.push(SublayerValue {
            metric: METRIC_DURATION_BY_SERVICE.to_string(),
            tag: Some(SublayerTag {
                name: TAG_SERVICE.to_string(),
                value: service.to_string(),
            }),
            value: duration as f64,
        });
    }

    let mut types: Vec<_> = duration_by_type.into_iter().collect();
    types.sort_unstable_by_key(|(name, _)| *name);
    for (ty, duration) in types {
        values.push(SublayerValue {
            metric: METRIC_DURATION_BY_TYPE.to_string(),
            tag: Some(SublayerTag {
                name: TAG_TYPE.to_string(),
                value: ty.to_string(),
            }),
            value: duration as f64,
        });
    }

    values.push(SublayerValue {
        metric: METRIC_SPAN_COUNT.to_string(),
        tag: None,
        value: spans.len() as f64,
    });

    values
}

/// Writes sublayer values onto a span's metrics mapping, using
/// `<metric>.<tag>` keys for tagged values and the bare metric name
/// otherwise.
pub fn set_sublayers_on_span(span: &mut Span, values: &[SublayerValue]) {
    for v in values {
        let key = match &v.tag {
            Some(tag) => format!("{}.{}", v.metric, tag),
            None => v.metric.clone(),
        };
        set_metric(span, &key, v.value);
    }
}

/// Sorted unique timestamps over all span starts and ends.
fn build_timestamps(spans: &[&Span]) -> Vec<i64> {
    let mut timestamps = Vec::with_capacity(spans.len() * 2);
    for span in spans {
        timestamps.push(span.start);
        timestamps.push(span.start + span.duration);
    }
    timestamps.sort_unstable();
    timestamps.dedup();
    timestamps
}

fn covers(span: &Span, ts: i64) -> bool {
    span.start <= ts && ts < span.start + span.duration
}

/// For each timestamp but the last, the indices of spans active on the
/// interval starting there. A span is active when it covers the timestamp
/// and none of its direct children does: attribution always goes to the
/// deepest running spans.
fn build_active_spans_mapping(spans: &[&Span], timestamps: &[i64]) -> HashMap<i64, Vec<usize>> {
    let mut children: HashMap<u64, Vec<usize>> = HashMap::new();
    for (i, span) in spans.iter().enumerate() {
        children.entry(span.parent_id).or_default().push(i);
    }

    let mut mapping: HashMap<i64, Vec<usize>> = HashMap::new();
    for &ts in timestamps.iter().take(timestamps.len().saturating_sub(1)) {
        let mut active = Vec::new();
        for (i, span) in spans.iter().enumerate() {
            if !covers(span, ts) {
                continue;
            }
            let child_active = children
                .get(&span.span_id)
                .map(|kids| kids.iter().any(|&k| covers(spans[k], ts)))
                .unwrap_or(false);
            if !child_active {
                active.push(i);
            }
        }
        if !active.is_empty() {
            mapping.insert(ts, active);
        }
    }
    mapping
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(id: u64, parent: u64, service: &str, ty: &str, start: i64, duration: i64) -> Span {
        Span {
            trace_id: 1,
            span_id: id,
            parent_id: parent,
            service: service.to_string(),
            r#type: ty.to_string(),
            name: "op".to_string(),
            resource: "res".to_string(),
            start,
            duration,
            ..Default::default()
        }
    }

    fn by_service(service: &str, value: f64) -> SublayerValue {
        SublayerValue {
            metric: METRIC_DURATION_BY_SERVICE.to_string(),
            tag: Some(SublayerTag {
                name: TAG_SERVICE.to_string(),
                value: service.to_string(),
            }),
            value,
        }
    }

    fn by_type(ty: &str, value: f64) -> SublayerValue {
        SublayerValue {
            metric: METRIC_DURATION_BY_TYPE.to_string(),
            tag: Some(SublayerTag {
                name: TAG_TYPE.to_string(),
                value: ty.to_string(),
            }),
            value,
        }
    }

    fn span_count(count: f64) -> SublayerValue {
        SublayerValue {
            metric: METRIC_SPAN_COUNT.to_string(),
            tag: None,
            value: count,
        }
    }

    fn compute(trace: &[Span]) -> Vec<SublayerValue> {
        let refs: Vec<&Span> = trace.iter().collect();
        compute_sublayers(&refs)
    }

    // 0  10  20  30  40  50  60  70  80  90 100
    // |===|===|===|===|===|===|===|===|===|===|
    // <-1------------------------------------->
    #[test]
    fn test_single_span() {
        let trace = vec![span(1, 0, "web-server", "web", 0, 100)];
        assert_eq!(
            compute(&trace),
            vec![
                by_service("web-server", 100.0),
                by_type("web", 100.0),
                span_count(1.0),
            ]
        );
    }

    // 0  10  20  30  40  50  60  70  80  90 100
    // |===|===|===|===|===|===|===|===|===|===|
    // <-1------------------------------------->
    //     <-2----->   <-4----->
    //       <-3->
    #[test]
    fn test_nested_spans() {
        let trace = vec![
            span(1, 0, "web-server", "web", 0, 100),
            span(2, 1, "db-server", "db", 10, 20),
            span(3, 2, "pgsql", "db", 15, 10),
            span(4, 1, "web-server", "template", 40, 20),
        ];
        assert_eq!(
            compute(&trace),
            vec![
                by_service("db-server", 10.0),
                by_service("pgsql", 10.0),
                by_service("web-server", 80.0),
                by_type("db", 20.0),
                by_type("template", 20.0),
                by_type("web", 60.0),
                span_count(4.0),
            ]
        );
    }

    // 0  10  20  30  40  50  60  70  80  90 100
    // |===|===|===|===|===|===|===|===|===|===|
    // <-1------------------------------------->
    //     <-2----->       <-5----->
    //       <-3----->   <--6---->
    //         <-4----->               <-7->
    #[test]
    fn test_parallel_spans_single_service_active() {
        let trace = vec![
            span(1, 0, "web-server", "web", 0, 100),
            span(2, 1, "rpc1", "rpc", 10, 20),
            span(3, 1, "rpc1", "rpc", 15, 20),
            span(4, 1, "rpc1", "rpc", 20, 20),
            span(5, 1, "rpc2", "rpc", 50, 20),
            span(6, 1, "rpc2", "rpc", 45, 20),
            span(7, 1, "rpc3", "rpc", 80, 10),
        ];
        assert_eq!(
            compute(&trace),
            vec![
                by_service("rpc1", 30.0),
                by_service("rpc2", 25.0),
                by_service("rpc3", 10.0),
                by_service("web-server", 35.0),
                by_type("rpc", 65.0),
                by_type("web", 35.0),
                span_count(7.0),
            ]
        );
    }

    // 0  10  20  30  40  50  60  70  80  90 100
    // |===|===|===|===|===|===|===|===|===|===|
    // <-1----------------->
    //         <-2---------------->
    //                         <-3------------->
    #[test]
    fn test_parallel_spans_parent_not_waiting() {
        let trace = vec![
            span(1, 0, "web-server", "web", 0, 50),
            span(2, 1, "rpc1", "rpc", 20, 50),
            span(3, 2, "rpc2", "rpc", 60, 40),
        ];
        assert_eq!(
            compute(&trace),
            vec![
                by_service("rpc1", 40.0),
                by_service("rpc2", 40.0),
                by_service("web-server", 20.0),
                by_type("rpc", 80.0),
                by_type("web", 20.0),
                span_count(3.0),
            ]
        );
    }

    // 0  10  20  30  40  50  60  70  80  90 100
    // |===|===|===|===|===|===|===|===|===|===|
    // <-1----------------->
    //         <-2----------------->
    //     <-3-------------------------------->
    //                         <-4->
    #[test]
    fn test_parallel_spans_multiple_services_active() {
        let trace = vec![
            span(1, 0, "web-server", "web", 0, 50),
            span(2, 1, "rpc1", "rpc", 20, 50),
            span(3, 1, "rpc2", "rpc", 10, 90),
            span(4, 1, "rpc3", "rpc", 60, 10),
        ];
        assert_eq!(
            compute(&trace),
            vec![
                by_service("rpc1", 23.0),
                by_service("rpc2", 63.0),
                by_service("rpc3", 3.0),
                by_service("web-server", 10.0),
                by_type("rpc", 90.0),
                by_type("web", 10.0),
                span_count(4.0),
            ]
        );
    }

    // 0  10  20  30  40  50  60  70  80  90 100 110 120 130 140 150
    // |===|===|===|===|===|===|===|===|===|===|===|===|===|===|===|
    // <-1------------------------------------------------->
    //     <-2----------------->       <-3--------->
    //         <-4--------->
    //       <-5------------------->
    //                         <--6-------------------->
    //                                             <-7------------->
    #[test]
    fn test_mix_of_everything() {
        let trace = vec![
            span(1, 0, "web-server", "web", 0, 130),
            span(2, 1, "pg", "db", 10, 50),
            span(3, 1, "render", "web", 80, 30),
            span(4, 2, "pg-read", "db", 20, 30),
            span(5, 1, "redis", "cache", 15, 55),
            span(6, 1, "rpc1", "rpc", 60, 60),
            span(7, 6, "alert", "rpc", 110, 40),
        ];
        assert_eq!(
            compute(&trace),
            vec![
                by_service("alert", 35.0),
                by_service("pg", 12.0),
                by_service("pg-read", 15.0),
                by_service("redis", 27.0),
                by_service("render", 15.0),
                by_service("rpc1", 30.0),
                by_service("web-server", 15.0),
                by_type("cache", 27.0),
                by_type("db", 27.0),
                by_type("rpc", 65.0),
                by_type("web", 30.0),
                span_count(7.0),
            ]
        );
    }

    #[test]
    fn test_build_timestamps() {
        let trace = vec![
            span(1, 0, "web-server", "web", 0, 130),
            span(2, 1, "pg", "db", 10, 50),
            span(3, 1, "render", "web", 80, 30),
            span(4, 2, "pg-read", "db", 20, 30),
            span(5, 1, "redis", "cache", 15, 55),
            span(6, 1, "rpc1", "rpc", 60, 60),
            span(7, 6, "alert", "rpc", 110, 40),
        ];
        let refs: Vec<&Span> = trace.iter().collect();
        assert_eq!(
            build_timestamps(&refs),
            vec![0, 10, 15, 20, 50, 60, 70, 80, 110, 120, 130, 150]
        );
    }

    #[test]
    fn test_build_active_spans_mapping() {
        let trace = vec![
            span(1, 0, "web-server", "web", 0, 130),
            span(2, 1, "pg", "db", 10, 50),
            span(3, 1, "render", "web", 80, 30),
            span(4, 2, "pg-read", "db", 20, 30),
            span(5, 1, "redis", "cache", 15, 55),
            span(6, 1, "rpc1", "rpc", 60, 60),
            span(7, 6, "alert", "rpc", 110, 40),
        ];
        let refs: Vec<&Span> = trace.iter().collect();
        let timestamps = build_timestamps(&refs);
        let mapping = build_active_spans_mapping(&refs, &timestamps);

        let ids_at = |ts: i64| -> Vec<u64> {
            mapping
                .get(&ts)
                .map(|idxs| idxs.iter().map(|&i| refs[i].span_id).collect())
                .unwrap_or_default()
        };

        assert_eq!(ids_at(0), vec![1]);
        assert_eq!(ids_at(10), vec![2]);
        assert_eq!(ids_at(15), vec![2, 5]);
        assert_eq!(ids_at(20), vec![4, 5]);
        assert_eq!(ids_at(50), vec![2, 5]);
        assert_eq!(ids_at(60), vec![5, 6]);
        assert_eq!(ids_at(70), vec![6]);
        assert_eq!(ids_at(80), vec![3, 6]);
        assert_eq!(ids_at(110), vec![7]);
        assert_eq!(ids_at(120), vec![1, 7]);
        assert_eq!(ids_at(130), vec![7]);
    }

    #[test]
    fn test_set_sublayers_on_span() {
        let values = vec![
            by_service("pgsql", 30.0),
            by_service("pgsql-read", 20.0),
            by_type("db", 30.0),
            span_count(2.0),
        ];

        let mut target = span(1, 0, "web", "web", 0, 100);
        set_sublayers_on_span(&mut target, &values);

        assert_eq!(
            target.metrics.get("_sublayers.duration.by_service.sublayer_service:pgsql"),
            Some(&30.0)
        );
        assert_eq!(
            target
                .metrics
                .get("_sublayers.duration.by_service.sublayer_service:pgsql-read"),
            Some(&20.0)
        );
        assert_eq!(
            target.metrics.get("_sublayers.duration.by_type.sublayer_type:db"),
            Some(&30.0)
        );
        assert_eq!(target.metrics.get("_sublayers.span_count"), Some(&2.0));
    }
}

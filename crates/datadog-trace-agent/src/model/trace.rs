// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Trace shape analysis: root detection, top-level marking and subtrace
//! extraction.
//!
//! A *top-level* span begins a new service boundary: its parent is missing,
//! outside the trace, or belongs to a different service. Sublayer metrics are
//! computed per subtrace rooted at each top-level span, so the attribution
//! for one service boundary never bleeds into another.

use std::collections::{HashMap, HashSet};

use super::span::{self, Span, KEY_ENV, KEY_TOP_LEVEL};

/// An ordered collection of spans sharing a trace ID.
pub type Trace = Vec<Span>;

/// A subtrace rooted at a top-level span. Indices point into the owning
/// trace's span vector.
#[derive(Debug, PartialEq, Eq)]
pub struct Subtrace {
    pub root: usize,
    pub spans: Vec<usize>,
}

/// Returns the index of the root span: the first span (scanning from the
/// end) whose parent is zero or not present in the trace. Falls back to the
/// last span when every parent resolves.
pub fn get_root(trace: &[Span]) -> Option<usize> {
    if trace.is_empty() {
        return None;
    }
    let ids: HashSet<u64> = trace.iter().map(|s| s.span_id).collect();
    for (i, s) in trace.iter().enumerate().rev() {
        if s.parent_id == 0 || !ids.contains(&s.parent_id) {
            return Some(i);
        }
    }
    Some(trace.len() - 1)
}

/// Marks every top-level span with the `_top_level` metric flag.
pub fn compute_top_level(trace: &mut [Span]) {
    let service_by_id: HashMap<u64, String> = trace
        .iter()
        .map(|s| (s.span_id, s.service.clone()))
        .collect();

    for s in trace.iter_mut() {
        let top_level = match service_by_id.get(&s.parent_id) {
            _ if s.parent_id == 0 => true,
            None => true,
            Some(parent_service) => parent_service != &s.service,
        };
        if top_level {
            span::set_metric(s, KEY_TOP_LEVEL, 1.0);
        }
    }
}

/// Extracts, for each top-level span, the set of descendants that stay within
/// its service subtree. Traversal stops at (and excludes) any other top-level
/// span. `compute_top_level` must have run first.
pub fn extract_top_level_subtraces(trace: &[Span]) -> Vec<Subtrace> {
    if trace.is_empty() {
        return Vec::new();
    }

    let mut children: HashMap<u64, Vec<usize>> = HashMap::new();
    for (i, s) in trace.iter().enumerate() {
        children.entry(s.parent_id).or_default().push(i);
    }

    let mut subtraces = Vec::new();
    for (i, s) in trace.iter().enumerate() {
        if !span::is_top_level(s) {
            continue;
        }
        let mut members = Vec::new();
        let mut stack = vec![i];
        while let Some(cur) = stack.pop() {
            members.push(cur);
            if let Some(kids) = children.get(&trace[cur].span_id) {
                for &kid in kids {
                    if !span::is_top_level(&trace[kid]) {
                        stack.push(kid);
                    }
                }
            }
        }
        members.sort_unstable();
        subtraces.push(Subtrace {
            root: i,
            spans: members,
        });
    }
    subtraces
}

/// The `env` tag carried by the trace, if any span has one.
pub fn trace_env(trace: &[Span]) -> Option<&str> {
    trace
        .iter()
        .find_map(|s| s.meta.get(KEY_ENV).map(String::as_str))
        .filter(|e| !e.is_empty())
}

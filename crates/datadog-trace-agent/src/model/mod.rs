// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Trace data model: spans, traces, normalization and timeline analysis.

pub mod normalize;
pub mod span;
pub mod sublayers;
pub mod trace;

pub use normalize::{normalize, NormalizeError};
pub use span::Span;
pub use sublayers::{compute_sublayers, set_sublayers_on_span, SublayerTag, SublayerValue};
pub use trace::{
    compute_top_level, extract_top_level_subtraces, get_root, trace_env, Subtrace, Trace,
};

use std::collections::HashMap;

/// A trace bundled with everything the sampler needs: its root, the resolved
/// environment and the sublayer values computed for each top-level span
/// (keyed by span ID).
#[derive(Clone, Debug)]
pub struct ProcessedTrace {
    pub trace: Trace,
    /// Index of the root span within `trace`.
    pub root: usize,
    pub env: String,
    pub sublayers: HashMap<u64, Vec<SublayerValue>>,
}

impl ProcessedTrace {
    pub fn root_span(&self) -> &Span {
        &self.trace[self.root]
    }

    pub fn root_span_mut(&mut self) -> &mut Span {
        &mut self.trace[self.root]
    }

    pub fn trace_id(&self) -> u64 {
        self.root_span().trace_id
    }

    /// End of the root span, in nanoseconds since the Unix epoch.
    pub fn end_ns(&self) -> i64 {
        let root = self.root_span();
        root.start + root.duration
    }
}

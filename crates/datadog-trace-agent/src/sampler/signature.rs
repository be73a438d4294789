// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Trace signature computation.
//!
//! A signature is a deterministic fingerprint of a trace's structural shape:
//! traces with the same root (service, name, type), the same multiset of
//! non-root (service, name) pairs and the same environment hash to the same
//! value, on any platform and across restarts. Signatures partition traces
//! into the strata the reservoir samples from.

use std::hash::Hasher;

use fnv::FnvHasher;

use crate::model::{Span, Trace};

/// A stratum key. `Signature(0)` is reserved for the overflow stratum.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct Signature(pub u64);

impl std::fmt::Display for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// Computes the signature of a trace given its root span and environment.
pub fn compute_signature_with_root_and_env(trace: &Trace, root: usize, env: &str) -> Signature {
    let root_hash = root_span_hash(&trace[root], env);

    let mut span_hashes: Vec<u64> = trace
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != root)
        .map(|(_, span)| span_hash(span, env))
        .collect();

    if span_hashes.is_empty() {
        return Signature(root_hash);
    }

    // Sort and dedupe so ordering and repetition of identical spans do not
    // change the fingerprint, then fold everything into the root hash.
    span_hashes.sort_unstable();
    span_hashes.dedup();

    let mut trace_hash = root_hash;
    for h in span_hashes {
        trace_hash ^= h;
    }
    Signature(trace_hash)
}

fn root_span_hash(span: &Span, env: &str) -> u64 {
    let mut h = FnvHasher::default();
    h.write(env.as_bytes());
    h.write(span.service.as_bytes());
    h.write(span.name.as_bytes());
    h.write(span.r#type.as_bytes());
    h.finish()
}

fn span_hash(span: &Span, env: &str) -> u64 {
    let mut h = FnvHasher::default();
    h.write(env.as_bytes());
    h.write(span.service.as_bytes());
    h.write(span.name.as_bytes());
    h.finish()
}

// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Span validation and canonicalization.
//!
//! Every span entering the pipeline passes through [`normalize`] exactly once.
//! Hard failures (missing identity, bad timestamps, unparseable names) reject
//! the span; oversized free-form fields (resource, meta) are truncated in
//! place instead so a single noisy tag does not cost the whole trace.

use thiserror::Error;
use tracing::debug;

use super::span::Span;

/// Maximum length a service name can have.
pub const MAX_SERVICE_LEN: usize = 100;
/// Maximum length an operation name can have.
pub const MAX_NAME_LEN: usize = 100;
/// Maximum length a resource can have.
pub const MAX_RESOURCE_LEN: usize = 5000;
/// Maximum length a span type can have.
pub const MAX_TYPE_LEN: usize = 100;
/// Maximum length of a meta key.
pub const MAX_META_KEY_LEN: usize = 100;
/// Maximum length of a meta value.
pub const MAX_META_VAL_LEN: usize = 5000;
/// Maximum length of a metrics key.
pub const MAX_METRICS_KEY_LEN: usize = MAX_META_KEY_LEN;

/// 2000-01-01T00:00:00Z in nanoseconds since the Unix epoch. Start timestamps
/// below this are almost certainly a unit mistake on the client side.
pub const YEAR_2000_NS: i64 = 946_684_800_000_000_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("empty `service`")]
    EmptyService,
    #[error("`service` too long (max {MAX_SERVICE_LEN} chars): {0}")]
    ServiceTooLong(String),
    #[error("empty `name`")]
    EmptyName,
    #[error("`name` too long (max {MAX_NAME_LEN} chars): {0}")]
    NameTooLong(String),
    #[error("invalid `name`: {0}")]
    InvalidName(String),
    #[error("empty `resource`")]
    EmptyResource,
    #[error("empty `trace_id`")]
    EmptyTraceId,
    #[error("empty `span_id`")]
    EmptySpanId,
    #[error("invalid `start` (must be nanosecond epoch): {0}")]
    InvalidStart(i64),
    #[error("spans with zeroed `duration` are discarded, use annotations")]
    ZeroDuration,
    #[error("`type` too long (max {MAX_TYPE_LEN} chars): {0}")]
    TypeTooLong(String),
}

/// Validates a span and canonicalizes it in place.
///
/// Normalizing an already-normalized span is a no-op.
pub fn normalize(span: &mut Span) -> Result<(), NormalizeError> {
    if span.service.is_empty() {
        return Err(NormalizeError::EmptyService);
    }
    if span.service.len() > MAX_SERVICE_LEN {
        return Err(NormalizeError::ServiceTooLong(span.service.clone()));
    }

    if span.name.is_empty() {
        return Err(NormalizeError::EmptyName);
    }
    if span.name.len() > MAX_NAME_LEN {
        return Err(NormalizeError::NameTooLong(span.name.clone()));
    }
    // Operation names follow the metric name grammar.
    span.name = normalize_metric_name(&span.name)
        .ok_or_else(|| NormalizeError::InvalidName(span.name.clone()))?;

    if span.resource.is_empty() {
        return Err(NormalizeError::EmptyResource);
    }
    if span.resource.len() > MAX_RESOURCE_LEN {
        span.resource = truncate_utf8(&span.resource, MAX_RESOURCE_LEN).to_string();
        debug!(resource = %span.resource, "normalize: truncated `resource`");
    }

    // Identity is assigned by the client; all we can check is presence.
    if span.trace_id == 0 {
        return Err(NormalizeError::EmptyTraceId);
    }
    if span.span_id == 0 {
        return Err(NormalizeError::EmptySpanId);
    }

    if span.start < YEAR_2000_NS {
        return Err(NormalizeError::InvalidStart(span.start));
    }
    if span.duration == 0 {
        return Err(NormalizeError::ZeroDuration);
    }

    // Meta and metrics are optional; oversize entries are truncated, not fatal.
    let long_meta_keys: Vec<String> = span
        .meta
        .keys()
        .filter(|k| k.len() > MAX_META_KEY_LEN)
        .cloned()
        .collect();
    for key in long_meta_keys {
        if let Some(value) = span.meta.remove(&key) {
            debug!(key = %key, "normalize: truncating `meta` key");
            let new_key = format!("{}...", truncate_utf8(&key, MAX_META_KEY_LEN));
            span.meta.insert(new_key, value);
        }
    }
    for value in span.meta.values_mut() {
        if value.len() > MAX_META_VAL_LEN {
            *value = format!("{}...", truncate_utf8(value, MAX_META_VAL_LEN));
        }
    }

    let long_metric_keys: Vec<String> = span
        .metrics
        .keys()
        .filter(|k| k.len() > MAX_METRICS_KEY_LEN)
        .cloned()
        .collect();
    for key in long_metric_keys {
        if let Some(value) = span.metrics.remove(&key) {
            debug!(key = %key, "normalize: truncating `metrics` key");
            let new_key = format!("{}...", truncate_utf8(&key, MAX_METRICS_KEY_LEN));
            span.metrics.insert(new_key, value);
        }
    }

    if span.r#type.len() > MAX_TYPE_LEN {
        return Err(NormalizeError::TypeTooLong(span.r#type.clone()));
    }

    Ok(())
}

fn is_alpha(b: u8) -> bool {
    b.is_ascii_lowercase() || b.is_ascii_uppercase()
}

fn is_alpha_num(b: u8) -> bool {
    is_alpha(b) || b.is_ascii_digit()
}

/// Normalizes an operation name to the metric name grammar.
///
/// Leading non-alphabetic bytes are skipped; alphanumerics pass through;
/// periods collapse a preceding underscore; every other byte becomes a single
/// underscore unless one (or a period) was just emitted. A trailing
/// underscore is stripped. Returns `None` when nothing valid remains.
pub fn normalize_metric_name(name: &str) -> Option<String> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return None;
    }

    let bytes = name.as_bytes();
    let mut i = 0;
    while i < bytes.len() && !is_alpha(bytes[i]) {
        i += 1;
    }
    if i == bytes.len() {
        return None;
    }

    let mut res = String::with_capacity(name.len());
    while i < bytes.len() {
        let b = bytes[i];
        if is_alpha_num(b) {
            res.push(b as char);
        } else if b == b'.' {
            match res.pop() {
                // an underscore before a period is overwritten by the period
                Some('_') => res.push('.'),
                Some(prev) => {
                    res.push(prev);
                    res.push('.');
                }
                None => res.push('.'),
            }
        } else {
            // no double underscores, no underscores after periods
            match res.chars().last() {
                Some('.') | Some('_') => {}
                _ => res.push('_'),
            }
        }
        i += 1;
    }

    if res.ends_with('_') {
        res.pop();
    }

    if res.is_empty() {
        None
    } else {
        Some(res)
    }
}

/// Cuts `s` down to at most `max` bytes without splitting a UTF-8 sequence.
fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use regex::Regex;

use crate::model::Span;

/// Rejects traces whose root resource matches any of the configured
/// `ignore_resources` patterns.
pub struct Blacklister {
    rules: Vec<Regex>,
}

impl Blacklister {
    pub fn new(rules: Vec<Regex>) -> Self {
        Blacklister { rules }
    }

    /// Returns false when the span's resource matches a blacklist rule.
    pub fn allows(&self, span: &Span) -> bool {
        !self.rules.iter().any(|re| re.is_match(&span.resource))
    }
}

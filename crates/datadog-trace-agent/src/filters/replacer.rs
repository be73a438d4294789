// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Tag replacement rules, used to redact or normalize sensitive tag values
//! before traces leave the host.

use regex::Regex;

use crate::model::Trace;

/// A compiled `replace_tags` entry. `name` selects the target tag:
/// `"*"` applies to every meta value and the resource, `"resource.name"`
/// targets the resource, anything else targets that meta key.
#[derive(Debug, Clone)]
pub struct ReplaceRule {
    pub name: String,
    pub re: Regex,
    pub repl: String,
}

pub struct Replacer {
    rules: Vec<ReplaceRule>,
}

impl Replacer {
    pub fn new(rules: Vec<ReplaceRule>) -> Self {
        Replacer { rules }
    }

    /// Applies every rule to every span of the trace, in place.
    pub fn replace(&self, trace: &mut Trace) {
        for rule in &self.rules {
            for span in trace.iter_mut() {
                match rule.name.as_str() {
                    "*" => {
                        for value in span.meta.values_mut() {
                            *value = rule.re.replace_all(value, rule.repl.as_str()).into_owned();
                        }
                        span.resource = rule
                            .re
                            .replace_all(&span.resource, rule.repl.as_str())
                            .into_owned();
                    }
                    "resource.name" => {
                        span.resource = rule
                            .re
                            .replace_all(&span.resource, rule.repl.as_str())
                            .into_owned();
                    }
                    name => {
                        if let Some(value) = span.meta.get_mut(name) {
                            *value = rule.re.replace_all(value, rule.repl.as_str()).into_owned();
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Span;

    fn rule(name: &str, pattern: &str, repl: &str) -> ReplaceRule {
        ReplaceRule {
            name: name.to_string(),
            re: Regex::new(pattern).unwrap(),
            repl: repl.to_string(),
        }
    }

    fn test_trace() -> Trace {
        let mut span = Span {
            trace_id: 1,
            span_id: 1,
            resource: "GET /users/428".to_string(),
            ..Default::default()
        };
        span.meta
            .insert("http.url".to_string(), "http://host/users/428?key=s3cr3t".to_string());
        span.meta
            .insert("custom.tag".to_string(), "id 428".to_string());
        vec![span]
    }

    #[test]
    fn test_replace_named_tag() {
        let replacer = Replacer::new(vec![rule("http.url", r"key=\w+", "key=?")]);
        let mut trace = test_trace();
        replacer.replace(&mut trace);
        assert_eq!(
            trace[0].meta.get("http.url").map(String::as_str),
            Some("http://host/users/428?key=?")
        );
        // Other tags untouched.
        assert_eq!(
            trace[0].meta.get("custom.tag").map(String::as_str),
            Some("id 428")
        );
    }

    #[test]
    fn test_replace_resource_name() {
        let replacer = Replacer::new(vec![rule("resource.name", r"/users/\d+", "/users/?")]);
        let mut trace = test_trace();
        replacer.replace(&mut trace);
        assert_eq!(trace[0].resource, "GET /users/?");
    }

    #[test]
    fn test_replace_wildcard_hits_all_tags_and_resource() {
        let replacer = Replacer::new(vec![rule("*", r"\d+", "?")]);
        let mut trace = test_trace();
        replacer.replace(&mut trace);
        assert_eq!(trace[0].resource, "GET /users/?");
        assert_eq!(
            trace[0].meta.get("custom.tag").map(String::as_str),
            Some("id ?")
        );
        assert_eq!(
            trace[0].meta.get("http.url").map(String::as_str),
            Some("http://host/users/??key=s?cr?t")
        );
    }

    #[test]
    fn test_replace_missing_tag_is_noop() {
        let replacer = Replacer::new(vec![rule("no.such.tag", ".*", "x")]);
        let mut trace = test_trace();
        let before = trace.clone();
        replacer.replace(&mut trace);
        assert_eq!(before, trace);
    }
}

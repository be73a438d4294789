// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Agent configuration.
//!
//! Configuration sources are applied in order (later overrides earlier):
//!
//! 1. Hard-coded defaults
//! 2. YAML file (`datadog.yaml` shape), when present
//! 3. `DD_*` environment variables
//!
//! Regex-bearing settings (`ignore_resources`, `replace_tags`) are compiled
//! at load time so an invalid pattern fails startup instead of silently
//! disabling a filter.

use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use figment::providers::{Format, Yaml};
use figment::Figment;
use regex::Regex;
use serde::{Deserialize, Deserializer};
use serde_aux::prelude::deserialize_bool_from_anything;

use crate::filters::ReplaceRule;

const API_ENDPOINT_PREFIX: &str = "https://trace.agent.";
const DEFAULT_SITE: &str = "datadoghq.com";

const DEFAULT_MAX_TPS: f64 = 10.0;
const DEFAULT_EXTRA_SAMPLE_RATE: f64 = 1.0;
const DEFAULT_RESERVOIR_MEMORY_LIMIT: u64 = 100 * 1024 * 1024;

const DEFAULT_MAX_SPANS_PER_PAYLOAD: usize = 1000;
const DEFAULT_FLUSH_PERIOD_SECS: u64 = 5;
const DEFAULT_UPDATE_INFO_PERIOD_SECS: u64 = 10;

#[derive(Debug, Clone, Default)]
pub struct ProxySettings {
    pub http: Option<String>,
    pub https: Option<String>,
    pub no_proxy: Vec<String>,
}

/// Retry queue settings for the outbound sender.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub max_age_seconds: u64,
    pub max_bytes: u64,
    pub max_payloads: usize,
    pub exp_backoff_max_duration_seconds: u64,
    pub exp_backoff_base_milliseconds: u64,
    pub exp_backoff_growth_base: u32,
}

impl Default for QueueSettings {
    fn default() -> Self {
        QueueSettings {
            max_age_seconds: 20 * 60,
            max_bytes: 64 * 1024 * 1024,
            max_payloads: 0,
            exp_backoff_max_duration_seconds: 120,
            exp_backoff_base_milliseconds: 200,
            exp_backoff_growth_base: 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TraceWriterSettings {
    pub max_spans_per_payload: usize,
    pub flush_period: Duration,
    pub update_info_period: Duration,
    pub queue: QueueSettings,
}

impl Default for TraceWriterSettings {
    fn default() -> Self {
        TraceWriterSettings {
            max_spans_per_payload: DEFAULT_MAX_SPANS_PER_PAYLOAD,
            flush_period: Duration::from_secs(DEFAULT_FLUSH_PERIOD_SECS),
            update_info_period: Duration::from_secs(DEFAULT_UPDATE_INFO_PERIOD_SECS),
            queue: QueueSettings::default(),
        }
    }
}

/// Obfuscation settings are parsed and carried for the external obfuscator;
/// the agent core itself does not consume them.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ObfuscationSettings {
    pub elasticsearch: JsonObfuscationSettings,
    pub mongodb: JsonObfuscationSettings,
    pub http: HttpObfuscationSettings,
    pub remove_stack_traces: bool,
    pub redis: Enablable,
    pub memcached: Enablable,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct JsonObfuscationSettings {
    pub enabled: bool,
    pub keep_values: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HttpObfuscationSettings {
    pub remove_query_string: bool,
    pub remove_paths_with_digits: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Enablable {
    pub enabled: bool,
}

#[derive(Debug)]
pub struct Config {
    pub api_key: String,
    pub hostname: String,
    pub default_env: String,
    pub site: String,
    /// Primary intake endpoint, e.g. `https://trace.agent.datadoghq.com`.
    pub endpoint_url: String,
    /// Extra intake endpoints: URL prefix to API keys.
    pub additional_endpoints: HashMap<String, Vec<String>>,
    pub proxy: ProxySettings,
    pub skip_ssl_validation: bool,

    pub extra_sample_rate: f64,
    pub max_traces_per_second: f64,
    pub ignore_resources: Vec<Regex>,
    pub replace_tags: Vec<ReplaceRule>,

    pub trace_writer: TraceWriterSettings,
    pub obfuscation: ObfuscationSettings,
    pub reservoir_memory_limit: u64,
    pub log_level: String,
}

impl Config {
    /// Loads configuration from an optional YAML file plus `DD_*` env vars.
    pub fn load(path: Option<&Path>) -> Result<Config> {
        let mut figment = Figment::new();
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        let yaml: YamlAgentConfig = figment
            .extract()
            .context("failed to parse configuration file")?;
        Self::from_yaml(yaml)
    }

    fn from_yaml(yaml: YamlAgentConfig) -> Result<Config> {
        let apm = yaml.apm_config.unwrap_or_default();

        let api_key = env::var("DD_API_KEY")
            .ok()
            .or(yaml.api_key)
            .map(|k| k.trim().to_string())
            .unwrap_or_default();
        if api_key.is_empty() {
            bail!("missing `api_key`: set it in the configuration file or via DD_API_KEY");
        }

        let site = env::var("DD_SITE")
            .ok()
            .or(yaml.site)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_SITE.to_string());

        let endpoint_url = env::var("DD_APM_DD_URL")
            .ok()
            .or(apm.apm_dd_url)
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| format!("{API_ENDPOINT_PREFIX}{site}"));

        let hostname = env::var("DD_HOSTNAME")
            .ok()
            .or(yaml.hostname)
            .unwrap_or_default();

        let default_env = env::var("DD_ENV").ok().or(apm.env).unwrap_or_default();

        let log_level = env::var("DD_LOG_LEVEL")
            .map(|l| l.to_lowercase())
            .ok()
            .or(yaml.log_level)
            .unwrap_or_else(|| "info".to_string());

        let proxy = ProxySettings {
            http: env::var("DD_PROXY_HTTP")
                .or_else(|_| env::var("HTTP_PROXY"))
                .ok()
                .or(yaml.proxy.http),
            https: env::var("DD_PROXY_HTTPS")
                .or_else(|_| env::var("HTTPS_PROXY"))
                .ok()
                .or(yaml.proxy.https),
            no_proxy: yaml.proxy.no_proxy,
        };

        let ignore_resources = apm
            .ignore_resources
            .iter()
            .map(|pattern| {
                Regex::new(pattern)
                    .with_context(|| format!("invalid `ignore_resources` pattern: {pattern}"))
            })
            .collect::<Result<Vec<_>>>()?;

        // DD_APM_REPLACE_TAGS carries the rules as a JSON array and takes
        // precedence over the YAML list.
        let raw_replace_tags = match env::var("DD_APM_REPLACE_TAGS") {
            Ok(json) => serde_json::from_str::<Vec<RawReplaceRule>>(&json)
                .context("invalid JSON in DD_APM_REPLACE_TAGS")?,
            Err(_) => apm.replace_tags,
        };
        let replace_tags = raw_replace_tags
            .iter()
            .map(|rule| {
                let re = Regex::new(&rule.pattern).with_context(|| {
                    format!("invalid `replace_tags` pattern for {}: {}", rule.name, rule.pattern)
                })?;
                Ok(ReplaceRule {
                    name: rule.name.clone(),
                    re,
                    repl: rule.repl.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let writer = apm.trace_writer.unwrap_or_default();
        let trace_writer = TraceWriterSettings {
            max_spans_per_payload: writer
                .max_spans_per_payload
                .unwrap_or(DEFAULT_MAX_SPANS_PER_PAYLOAD),
            flush_period: Duration::from_secs(
                writer.flush_period_seconds.unwrap_or(DEFAULT_FLUSH_PERIOD_SECS),
            ),
            update_info_period: Duration::from_secs(
                writer
                    .update_info_period_seconds
                    .unwrap_or(DEFAULT_UPDATE_INFO_PERIOD_SECS),
            ),
            queue: writer.queue.unwrap_or_default(),
        };

        Ok(Config {
            api_key,
            hostname,
            default_env,
            site,
            endpoint_url,
            additional_endpoints: apm.additional_endpoints,
            proxy,
            skip_ssl_validation: yaml.skip_ssl_validation.unwrap_or(false),
            extra_sample_rate: apm.extra_sample_rate.unwrap_or(DEFAULT_EXTRA_SAMPLE_RATE),
            max_traces_per_second: apm
                .max_traces_per_second
                .unwrap_or(DEFAULT_MAX_TPS),
            ignore_resources,
            replace_tags,
            trace_writer,
            obfuscation: apm.obfuscation.unwrap_or_default(),
            reservoir_memory_limit: DEFAULT_RESERVOIR_MEMORY_LIMIT,
            log_level,
        })
    }
}

fn opt_bool_from_anything<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    deserialize_bool_from_anything(deserializer).map(Some)
}

/// Raw shape of the `datadog.yaml` configuration file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct YamlAgentConfig {
    api_key: Option<String>,
    hostname: Option<String>,
    log_level: Option<String>,
    site: Option<String>,
    proxy: RawProxy,
    #[serde(deserialize_with = "opt_bool_from_anything")]
    skip_ssl_validation: Option<bool>,
    apm_config: Option<RawTraceAgent>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawProxy {
    http: Option<String>,
    https: Option<String>,
    no_proxy: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawTraceAgent {
    apm_dd_url: Option<String>,
    env: Option<String>,
    additional_endpoints: HashMap<String, Vec<String>>,
    extra_sample_rate: Option<f64>,
    max_traces_per_second: Option<f64>,
    ignore_resources: Vec<String>,
    replace_tags: Vec<RawReplaceRule>,
    trace_writer: Option<RawTraceWriter>,
    obfuscation: Option<ObfuscationSettings>,
}

#[derive(Debug, Deserialize)]
struct RawReplaceRule {
    name: String,
    pattern: String,
    repl: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawTraceWriter {
    max_spans_per_payload: Option<usize>,
    flush_period_seconds: Option<u64>,
    update_info_period_seconds: Option<u64>,
    queue: Option<QueueSettings>,
}

// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]

use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use datadog_trace_agent::agent::{Agent, AgentChannels};
use datadog_trace_agent::config::Config;
use datadog_trace_agent::telemetry::LogMetricsClient;

const DEFAULT_CONFIG_FILE: &str = "datadog.yaml";

#[tokio::main]
async fn main() {
    let log_level = env::var("DD_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or_else(|_| "info".to_string());
    let env_filter = format!("hyper=off,reqwest=off,rustls=off,{log_level}");

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_target(true)
        .finish();
    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let config_path = config_file_path();
    let config = match Config::load(config_path.as_deref()) {
        Ok(config) => Arc::new(config),
        Err(err) => {
            error!("error creating config on trace agent startup: {err:#}");
            return;
        }
    };

    let shutdown = CancellationToken::new();
    let (agent, channels) =
        match Agent::new(config, shutdown.clone(), Arc::new(LogMetricsClient)) {
            Ok(built) => built,
            Err(err) => {
                error!("error wiring trace agent: {err:#}");
                return;
            }
        };

    let AgentChannels {
        trace_tx,
        mut stats_rx,
    } = channels;

    // The HTTP receiver plugs into `trace_tx`; keep the intake open for the
    // process lifetime.
    let _intake = trace_tx;

    // The stats concentrator consumes processed traces; without one wired in
    // this build, drain the channel so the pipeline never backs up on it.
    tokio::spawn(async move { while stats_rx.recv().await.is_some() {} });

    let agent_task = tokio::spawn(agent.run());

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(err) => error!("failed to listen for shutdown signal: {err}"),
    }
    shutdown.cancel();
    if let Err(err) = agent_task.await {
        error!("agent task failed during shutdown: {err}");
    }
    debug!("trace agent stopped");
}

fn config_file_path() -> Option<PathBuf> {
    if let Ok(path) = env::var("DD_CONFIG_FILE") {
        return Some(PathBuf::from(path));
    }
    let default = Path::new(DEFAULT_CONFIG_FILE);
    default.exists().then(|| default.to_path_buf())
}

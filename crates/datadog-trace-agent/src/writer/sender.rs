// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Outbound payload delivery.
//!
//! The writer hands finished payloads to a [`PayloadSender`]. The production
//! implementation posts protobuf bodies to the trace intake with bounded
//! retries; the full queueing sender (age/byte-bounded retry queue) lives
//! outside the agent core, but its wire contract is fixed here.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, error};

use crate::config::Config;

/// Intake path for trace payloads.
pub const TRACES_PATH: &str = "/api/v0.2/traces";
/// Header summarizing the client languages seen by the receiver.
pub const LANGUAGES_HEADER: &str = "X-Datadog-Reported-Languages";

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_RETRIES: u32 = 3;

/// A serialized, possibly compressed trace payload.
#[derive(Clone, Debug)]
pub struct Payload {
    pub body: Vec<u8>,
    /// `Content-Encoding` of `body`: `"gzip"` or `"identity"`.
    pub encoding: &'static str,
}

#[derive(Debug, Default)]
pub struct SendOutcome {
    pub retries: u32,
}

#[derive(Debug, Error)]
#[error("failed to deliver trace payload after {retries} retries: {message}")]
pub struct SendError {
    pub retries: u32,
    pub message: String,
}

#[async_trait]
pub trait PayloadSender: Send + Sync {
    async fn send(&self, payload: Payload) -> Result<SendOutcome, SendError>;
}

struct Endpoint {
    url: String,
    api_key: String,
}

/// Sends payloads to the primary intake endpoint plus any configured
/// additional endpoints. 4xx responses are permanent drops; 5xx and network
/// errors retry with exponential backoff before the payload is given up on.
pub struct ApiSender {
    client: reqwest::Client,
    endpoints: Vec<Endpoint>,
    max_retries: u32,
    backoff_base: Duration,
    backoff_growth: u32,
    languages: String,
}

impl ApiSender {
    pub fn from_config(config: &Config) -> anyhow::Result<ApiSender> {
        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(HTTP_TIMEOUT);

        if config.skip_ssl_validation {
            builder = builder.danger_accept_invalid_certs(true);
        }

        let no_proxy = if config.proxy.no_proxy.is_empty() {
            None
        } else {
            reqwest::NoProxy::from_string(&config.proxy.no_proxy.join(","))
        };
        if let Some(http) = &config.proxy.http {
            builder = builder.proxy(reqwest::Proxy::http(http)?.no_proxy(no_proxy.clone()));
        }
        if let Some(https) = &config.proxy.https {
            builder = builder.proxy(reqwest::Proxy::https(https)?.no_proxy(no_proxy));
        }

        let mut endpoints = vec![Endpoint {
            url: config.endpoint_url.clone(),
            api_key: config.api_key.clone(),
        }];
        for (url, keys) in &config.additional_endpoints {
            for key in keys {
                endpoints.push(Endpoint {
                    url: url.clone(),
                    api_key: key.clone(),
                });
            }
        }

        Ok(ApiSender {
            client: builder.build()?,
            endpoints,
            max_retries: MAX_RETRIES,
            backoff_base: Duration::from_millis(
                config.trace_writer.queue.exp_backoff_base_milliseconds,
            ),
            backoff_growth: config.trace_writer.queue.exp_backoff_growth_base.max(2),
            languages: String::new(),
        })
    }

    async fn send_to_endpoint(
        &self,
        endpoint: &Endpoint,
        payload: &Payload,
        retries: &mut u32,
    ) -> Result<(), String> {
        let url = format!("{}{}", endpoint.url, TRACES_PATH);
        let mut attempt: u32 = 0;
        loop {
            let response = self
                .client
                .post(&url)
                .query(&[("api_key", endpoint.api_key.as_str())])
                .header(CONTENT_TYPE, "application/x-protobuf")
                .header(CONTENT_ENCODING, payload.encoding)
                .header(LANGUAGES_HEADER, self.languages.as_str())
                .body(payload.body.clone())
                .send()
                .await;

            let err = match response {
                Ok(resp) if resp.status().is_success() => {
                    debug!(url = %endpoint.url, "flushed trace payload");
                    return Ok(());
                }
                Ok(resp) if resp.status().is_client_error() => {
                    // Client errors will not get better on retry.
                    return Err(format!("{url}: {}", resp.status()));
                }
                Ok(resp) => format!("{url}: {}", status_line(resp.status())),
                Err(e) => format!("{url}: {e}"),
            };

            if attempt >= self.max_retries {
                return Err(err);
            }
            let delay = self.backoff_base * self.backoff_growth.pow(attempt);
            debug!(error = %err, ?delay, "retrying trace payload delivery");
            tokio::time::sleep(delay).await;
            attempt += 1;
            *retries += 1;
        }
    }
}

fn status_line(status: StatusCode) -> String {
    match status.canonical_reason() {
        Some(reason) => format!("{} {}", status.as_u16(), reason),
        None => status.as_u16().to_string(),
    }
}

#[async_trait]
impl PayloadSender for ApiSender {
    async fn send(&self, payload: Payload) -> Result<SendOutcome, SendError> {
        let mut retries = 0;
        let mut first_error: Option<String> = None;

        for endpoint in &self.endpoints {
            if let Err(err) = self.send_to_endpoint(endpoint, &payload, &mut retries).await {
                error!(error = %err, "dropping trace payload for endpoint");
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            None => Ok(SendOutcome { retries }),
            Some(message) => Err(SendError { retries, message }),
        }
    }
}

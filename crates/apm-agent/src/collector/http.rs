// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! JSON over HTTP transport for [`CollectorApi`].
//!
//! Every call is a POST to `<base>/agent_listener/invoke_raw_method` with
//! `method`, `license_key`, `protocol_version` and, once connected, `run_id`
//! as URL-encoded query parameters. Responses are `{"return_value": ...}` or
//! `{"exception": {...}}`.

use crate::collector::{AppInfo, CollectorApi, ConnectResponse, MetricDataPayload};
use crate::config::Config;
use crate::constants::PROTOCOL_VERSION;
use crate::error_aggregator::TracedError;
use crate::errors::CollectorError;
use crate::trace_aggregator::TransactionTrace;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    return_value: Option<Value>,
    #[serde(default)]
    exception: Option<Exception>,
}

#[derive(Debug, Deserialize)]
struct Exception {
    #[serde(default)]
    error_type: String,
    #[serde(default)]
    message: String,
}

impl From<Exception> for CollectorError {
    fn from(exception: Exception) -> Self {
        if exception.error_type.ends_with("ForceRestartException") {
            CollectorError::ForceRestart(exception.message)
        } else if exception.error_type.ends_with("ForceDisconnectException") {
            CollectorError::ForceDisconnect(exception.message)
        } else {
            CollectorError::Exception {
                error_type: exception.error_type,
                message: exception.message,
            }
        }
    }
}

pub struct HttpCollector {
    client: reqwest::Client,
    license_key: String,
    /// Where `get_redirect_host` is asked.
    base_url: String,
    /// Collector assigned by the redirect, used for everything after it.
    session_url: RwLock<String>,
}

/// Builds a reqwest client with optional proxy configuration and timeout.
pub fn build_client(
    proxy_url: Option<&str>,
    timeout: Duration,
) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder().timeout(timeout);
    if let Some(proxy) = proxy_url {
        builder = builder.proxy(reqwest::Proxy::https(proxy)?);
    }
    builder.build()
}

impl HttpCollector {
    pub fn new(config: &Config) -> Result<Self, CollectorError> {
        let client = build_client(config.proxy_url.as_deref(), config.timeout)?;
        let base_url = config.collector_url();
        Ok(Self {
            client,
            license_key: config.license_key.clone(),
            session_url: RwLock::new(base_url.clone()),
            base_url,
        })
    }

    pub async fn session_url(&self) -> String {
        self.session_url.read().await.clone()
    }

    async fn invoke(
        &self,
        base_url: &str,
        method: &str,
        run_id: Option<&str>,
        body: &Value,
    ) -> Result<Value, CollectorError> {
        let url = format!("{base_url}/agent_listener/invoke_raw_method");
        let protocol_version = PROTOCOL_VERSION.to_string();
        let mut query = vec![
            ("method", method),
            ("license_key", self.license_key.as_str()),
            ("protocol_version", protocol_version.as_str()),
        ];
        if let Some(run_id) = run_id {
            query.push(("run_id", run_id));
        }
        debug!(method = %method, base_url = %base_url, "collector request");

        let response = self
            .client
            .post(&url)
            .query(&query)
            .json(body)
            .send()
            .await?;
        let status = response.status();
        let bytes = response.bytes().await?;
        debug!(method = %method, status = %status, body_len = bytes.len(), "collector response");

        // Exceptions may come back with an error status; prefer them when present.
        match serde_json::from_slice::<Envelope>(&bytes) {
            Ok(Envelope {
                exception: Some(exception),
                ..
            }) => Err(exception.into()),
            Ok(envelope) if status.is_success() => Ok(envelope.return_value.unwrap_or(Value::Null)),
            Ok(_) => Err(CollectorError::Status(status.as_u16())),
            Err(_) if !status.is_success() => Err(CollectorError::Status(status.as_u16())),
            Err(err) => Err(err.into()),
        }
    }

    async fn invoke_session(
        &self,
        method: &str,
        run_id: &str,
        body: &Value,
    ) -> Result<Value, CollectorError> {
        let session_url = self.session_url().await;
        self.invoke(&session_url, method, Some(run_id), body).await
    }

    /// Resolves the `host[:port]` handed out by the redirect into a base URL
    /// with the scheme of the configured one.
    fn redirect_url(&self, host: &str) -> String {
        let scheme = self
            .base_url
            .split_once("://")
            .map_or("https", |(scheme, _)| scheme);
        format!("{scheme}://{}", host.trim_end_matches('/'))
    }
}

#[async_trait]
impl CollectorApi for HttpCollector {
    async fn connect(&self, app: &AppInfo) -> Result<ConnectResponse, CollectorError> {
        let redirect = self
            .invoke(&self.base_url, "get_redirect_host", None, &json!([]))
            .await?;
        let session_url = match redirect.as_str() {
            Some(host) if !host.is_empty() => self.redirect_url(host),
            _ => {
                return Err(CollectorError::InvalidResponse(format!(
                    "expected a redirect host, got {redirect}"
                )))
            }
        };
        debug!("Collector redirected to {session_url}");

        let response = self.invoke(&session_url, "connect", None, &json!([app])).await?;
        let response: ConnectResponse = serde_json::from_value(response)?;
        *self.session_url.write().await = session_url;
        Ok(response)
    }

    async fn send_metric_data(
        &self,
        run_id: &str,
        payload: &MetricDataPayload,
    ) -> Result<Option<Value>, CollectorError> {
        let response = self
            .invoke_session("metric_data", run_id, &payload.to_body(run_id))
            .await?;
        Ok((!response.is_null()).then_some(response))
    }

    async fn send_traced_errors(
        &self,
        run_id: &str,
        errors: &[TracedError],
    ) -> Result<(), CollectorError> {
        self.invoke_session("error_data", run_id, &json!([run_id, errors]))
            .await
            .map(|_| ())
    }

    async fn send_transaction_traces(
        &self,
        run_id: &str,
        traces: &[TransactionTrace],
    ) -> Result<(), CollectorError> {
        self.invoke_session("transaction_sample_data", run_id, &json!([run_id, traces]))
            .await
            .map(|_| ())
    }

    async fn shutdown(&self, run_id: &str) -> Result<(), CollectorError> {
        self.invoke_session("shutdown", run_id, &json!([]))
            .await
            .map(|_| ())
    }
}

// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Request/response channel to the remote collector.

pub mod backoff;
pub mod connection;
pub mod http;

use crate::config::Config;
use crate::constants::{AGENT_LANGUAGE, AGENT_VERSION};
use crate::error_aggregator::TracedError;
use crate::errors::CollectorError;
use crate::mapper::MetricMapper;
use crate::metric::{ApdexStats, MetricKey, Stats};
use crate::metrics::Metrics;
use crate::trace_aggregator::TransactionTrace;
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

/// Identity of this process, sent with the connect handshake.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct AppInfo {
    pub pid: u32,
    pub host: String,
    #[serde(rename = "app_name")]
    pub app_names: Vec<String>,
    pub language: String,
    pub agent_version: String,
    pub environment: Vec<(String, String)>,
}

impl AppInfo {
    pub fn from_config(config: &Config) -> Self {
        Self {
            pid: std::process::id(),
            host: config.hostname.clone(),
            app_names: config.app_names.clone(),
            language: AGENT_LANGUAGE.to_string(),
            agent_version: AGENT_VERSION.to_string(),
            environment: vec![
                ("OS".to_string(), std::env::consts::OS.to_string()),
                ("Arch".to_string(), std::env::consts::ARCH.to_string()),
            ],
        }
    }
}

/// Session parameters returned by a successful connect.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct ConnectResponse {
    #[serde(deserialize_with = "run_id_from_json")]
    pub agent_run_id: String,
    #[serde(default)]
    pub apdex_t: Option<f64>,
    #[serde(default)]
    pub url_rules: Option<Value>,
    #[serde(default)]
    pub metric_id_rules: Option<Value>,
}

/// Run ids are opaque; some collectors send them as numbers.
fn run_id_from_json<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(id) => Ok(id),
        Value::Number(id) => Ok(id.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "agent_run_id must be a string or number, got {other}"
        ))),
    }
}

/// How a metric is identified on the wire: by collector-assigned id once
/// known, by name and scope otherwise.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetricIdentity {
    Id(u64),
    Name {
        name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        scope: Option<String>,
    },
}

impl MetricIdentity {
    fn new(key: &MetricKey, mapper: &MetricMapper) -> Self {
        match mapper.map(key) {
            Some(id) => MetricIdentity::Id(id),
            None => MetricIdentity::Name {
                name: key.name.clone(),
                scope: key.scope.clone(),
            },
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetricData {
    Stats(Stats),
    Apdex(ApdexStats),
}

/// `[identity, [six slots]]`
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MetricEntry(pub MetricIdentity, pub MetricData);

/// One harvest window of metrics, ready to send.
#[derive(Clone, Debug, PartialEq)]
pub struct MetricDataPayload {
    pub start: SystemTime,
    pub end: SystemTime,
    pub entries: Vec<MetricEntry>,
}

impl MetricDataPayload {
    pub fn new(metrics: &Metrics, end: SystemTime, mapper: &MetricMapper) -> Self {
        let mut stats: Vec<_> = metrics.iter().collect();
        stats.sort_unstable_by(|(a, _), (b, _)| a.cmp(b));
        let mut apdex: Vec<_> = metrics.iter_apdex().collect();
        apdex.sort_unstable_by(|(a, _), (b, _)| a.cmp(b));

        let entries = stats
            .into_iter()
            .map(|(key, stats)| {
                MetricEntry(MetricIdentity::new(key, mapper), MetricData::Stats(*stats))
            })
            .chain(apdex.into_iter().map(|(key, apdex)| {
                MetricEntry(MetricIdentity::new(key, mapper), MetricData::Apdex(*apdex))
            }))
            .collect();
        Self {
            start: metrics.started(),
            end,
            entries,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `[run_id, start_secs, end_secs, [entries]]`
    pub fn to_body(&self, run_id: &str) -> Value {
        serde_json::json!([run_id, unix_secs(self.start), unix_secs(self.end), self.entries])
    }
}

fn unix_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}

/// RPC surface of the collector. Every call after `connect` is bound to the
/// run id the handshake returned.
#[async_trait]
pub trait CollectorApi: Send + Sync {
    async fn connect(&self, app: &AppInfo) -> Result<ConnectResponse, CollectorError>;

    /// Returns the collector's new name to id mapping, if it sent one.
    async fn send_metric_data(
        &self,
        run_id: &str,
        payload: &MetricDataPayload,
    ) -> Result<Option<Value>, CollectorError>;

    async fn send_traced_errors(
        &self,
        run_id: &str,
        errors: &[TracedError],
    ) -> Result<(), CollectorError>;

    async fn send_transaction_traces(
        &self,
        run_id: &str,
        traces: &[TransactionTrace],
    ) -> Result<(), CollectorError>;

    async fn shutdown(&self, run_id: &str) -> Result<(), CollectorError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn payload_uses_ids_when_mapped() {
        let mut metrics = Metrics::new(0.5);
        metrics.measure("Database/all", None, 0.5, 0.25);
        metrics.measure("Database/find", Some("WebTransaction/Uri/a"), 1.0, 1.0);
        metrics.measure_apdex("Apdex", 0.1, false);

        let mut mapper = MetricMapper::default();
        mapper
            .load(&json!([[{"name": "Database/all"}, 7]]))
            .expect("valid mapping");

        let end = UNIX_EPOCH + Duration::from_secs(60);
        let mut payload = MetricDataPayload::new(&metrics, end, &mapper);
        payload.start = UNIX_EPOCH;
        assert_eq!(
            payload.to_body("run-1"),
            json!(["run-1", 0, 60, [
                [7, [1.0, 0.5, 0.25, 0.5, 0.5, 0.25]],
                [
                    {"name": "Database/find", "scope": "WebTransaction/Uri/a"},
                    [1.0, 1.0, 1.0, 1.0, 1.0, 1.0]
                ],
                [{"name": "Apdex"}, [1.0, 0.0, 0.0, 0.5, 0.5, 0.0]],
            ]])
        );
    }

    #[test]
    fn connect_response_accepts_numeric_run_id() {
        let response: ConnectResponse =
            serde_json::from_value(json!({"agent_run_id": 42, "apdex_t": 0.5})).expect("decode");
        assert_eq!(response.agent_run_id, "42");
        assert_eq!(response.apdex_t, Some(0.5));
        assert!(response.url_rules.is_none());

        assert!(serde_json::from_value::<ConnectResponse>(json!({"agent_run_id": null})).is_err());
    }

    #[test]
    fn app_info_serializes_app_name_list() {
        let config = Config::new("key", vec!["shop".to_string()]);
        let json = serde_json::to_value(AppInfo::from_config(&config)).expect("encode");
        assert_eq!(json["app_name"], json!(["shop"]));
        assert_eq!(json["language"], json!("rust"));
        assert_eq!(json["host"], json!("localhost"));
    }
}

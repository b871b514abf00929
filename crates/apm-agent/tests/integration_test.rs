// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use apm_agent::{
    agent::AgentService,
    collector::{
        connection::ConnectionState, http::HttpCollector, AppInfo, CollectorApi,
        MetricDataPayload,
    },
    config::Config,
    errors::{CollectorError, HarvestError},
    mapper::MetricMapper,
    metrics::Metrics,
};
use mockito::{Matcher, Server, ServerGuard};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::time::{timeout, Duration};

const LISTENER: &str = "/agent_listener/invoke_raw_method";

fn config(server: &ServerGuard) -> Config {
    let mut config = Config::new("mock-license-key", vec!["shop".to_string()]);
    config.collector_url = Some(server.url());
    config.timeout = Duration::from_secs(5);
    config
}

fn method(name: &str) -> Matcher {
    Matcher::AllOf(vec![
        Matcher::UrlEncoded("method".into(), name.into()),
        Matcher::UrlEncoded("license_key".into(), "mock-license-key".into()),
        Matcher::UrlEncoded("protocol_version".into(), "14".into()),
    ])
}

fn session_method(name: &str, run_id: &str) -> Matcher {
    Matcher::AllOf(vec![
        method(name),
        Matcher::UrlEncoded("run_id".into(), run_id.into()),
    ])
}

async fn mock_handshake(server: &mut ServerGuard, run_id: &str) -> (mockito::Mock, mockito::Mock) {
    let redirect = server
        .mock("POST", LISTENER)
        .match_query(method("get_redirect_host"))
        .with_status(200)
        .with_body(format!(r#"{{"return_value": "{}"}}"#, server.host_with_port()))
        .create_async()
        .await;
    let connect = server
        .mock("POST", LISTENER)
        .match_query(method("connect"))
        .match_body(Matcher::Regex(r#""app_name":\["shop"\]"#.to_string()))
        .with_status(200)
        .with_body(format!(
            r#"{{"return_value": {{"agent_run_id": "{run_id}", "apdex_t": 0.5}}}}"#
        ))
        .create_async()
        .await;
    (redirect, connect)
}

fn sample_payload() -> MetricDataPayload {
    let mut metrics = Metrics::new(0.1);
    metrics.measure("WebTransaction", None, 0.2, 0.2);
    MetricDataPayload::new(&metrics, SystemTime::now(), &MetricMapper::default())
}

#[tokio::test]
async fn connect_follows_redirect() {
    let mut server = Server::new_async().await;
    let (redirect, connect) = mock_handshake(&mut server, "run-7").await;

    let config = config(&server);
    let collector = HttpCollector::new(&config).expect("client");
    let response = collector
        .connect(&AppInfo::from_config(&config))
        .await
        .expect("connect");

    assert_eq!(response.agent_run_id, "run-7");
    assert_eq!(response.apdex_t, Some(0.5));
    assert_eq!(
        collector.session_url().await,
        format!("http://{}", server.host_with_port())
    );
    redirect.assert_async().await;
    connect.assert_async().await;
}

#[tokio::test]
async fn metric_data_returns_id_mapping() {
    let mut server = Server::new_async().await;
    let _handshake = mock_handshake(&mut server, "run-1").await;
    let metric_data = server
        .mock("POST", LISTENER)
        .match_query(session_method("metric_data", "run-1"))
        .match_body(Matcher::Regex(
            r#"\["run-1",\d+,\d+,\[\[\{"name":"WebTransaction"\}"#.to_string(),
        ))
        .with_status(200)
        .with_body(r#"{"return_value": [[{"name": "WebTransaction"}, 4]]}"#)
        .create_async()
        .await;

    let config = config(&server);
    let collector = HttpCollector::new(&config).expect("client");
    collector
        .connect(&AppInfo::from_config(&config))
        .await
        .expect("connect");
    let ids = collector
        .send_metric_data("run-1", &sample_payload())
        .await
        .expect("metric data");

    assert_eq!(ids, Some(serde_json::json!([[{"name": "WebTransaction"}, 4]])));
    metric_data.assert_async().await;
}

#[tokio::test]
async fn exceptions_are_mapped() {
    let mut server = Server::new_async().await;
    let _restart = server
        .mock("POST", LISTENER)
        .match_query(session_method("metric_data", "run-1"))
        .with_status(200)
        .with_body(
            r#"{"exception": {"error_type": "NewRelic::Agent::ForceRestartException", "message": "restart now"}}"#,
        )
        .create_async()
        .await;
    let _disconnect = server
        .mock("POST", LISTENER)
        .match_query(session_method("shutdown", "run-1"))
        .with_status(410)
        .with_body(
            r#"{"exception": {"error_type": "NewRelic::Agent::ForceDisconnectException", "message": "gone"}}"#,
        )
        .create_async()
        .await;

    let collector = HttpCollector::new(&config(&server)).expect("client");
    let restart = collector.send_metric_data("run-1", &sample_payload()).await;
    assert!(matches!(restart, Err(CollectorError::ForceRestart(m)) if m == "restart now"));

    let disconnect = collector.shutdown("run-1").await;
    assert!(matches!(disconnect, Err(CollectorError::ForceDisconnect(_))));
}

#[tokio::test]
async fn query_parameters_are_url_encoded() {
    let mut server = Server::new_async().await;
    let shutdown = server
        .mock("POST", LISTENER)
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("method".into(), "shutdown".into()),
            Matcher::UrlEncoded("license_key".into(), "key&admin=1".into()),
            Matcher::UrlEncoded("run_id".into(), "run&7+x=y".into()),
        ]))
        .with_status(200)
        .with_body(r#"{"return_value": null}"#)
        .create_async()
        .await;

    let mut config = config(&server);
    config.license_key = "key&admin=1".to_string();
    let collector = HttpCollector::new(&config).expect("client");
    collector.shutdown("run&7+x=y").await.expect("shutdown");
    shutdown.assert_async().await;
}

#[tokio::test]
async fn error_status_without_exception() {
    let mut server = Server::new_async().await;
    let _unavailable = server
        .mock("POST", LISTENER)
        .match_query(method("get_redirect_host"))
        .with_status(503)
        .with_body("Service Unavailable")
        .create_async()
        .await;

    let config = config(&server);
    let collector = HttpCollector::new(&config).expect("client");
    let result = collector.connect(&AppInfo::from_config(&config)).await;
    assert!(matches!(result, Err(CollectorError::Status(503))));
}

#[tokio::test]
async fn agent_harvests_to_collector() {
    let mut server = Server::new_async().await;
    let _handshake = mock_handshake(&mut server, "run-9").await;
    let metric_data = server
        .mock("POST", LISTENER)
        .match_query(session_method("metric_data", "run-9"))
        .match_body(Matcher::Regex("WebTransaction/Uri/cart".to_string()))
        .with_status(200)
        .with_body(r#"{"return_value": null}"#)
        .expect(1)
        .create_async()
        .await;
    let errors = server
        .mock("POST", LISTENER)
        .match_query(session_method("error_data", "run-9"))
        .match_body(Matcher::Regex("HttpError 500".to_string()))
        .with_status(200)
        .with_body(r#"{"return_value": null}"#)
        .create_async()
        .await;
    let shutdown = server
        .mock("POST", LISTENER)
        .match_query(session_method("shutdown", "run-9"))
        .with_status(200)
        .with_body(r#"{"return_value": null}"#)
        .create_async()
        .await;

    let config = config(&server);
    let collector = Arc::new(HttpCollector::new(&config).expect("client"));
    let (service, handle) = AgentService::new(config, collector);
    let task = tokio::spawn(service.run());

    timeout(
        Duration::from_secs(5),
        handle
            .subscribe_state()
            .wait_for(|state| *state == ConnectionState::Connected),
    )
    .await
    .expect("connected in time")
    .expect("state channel open");
    assert_eq!(handle.apdex_t(), 0.5);

    let mut context = handle.web_transaction("/cart?id=3");
    context.set_status_code(500);
    handle.finish(&mut context);
    handle.harvest_now().await.expect("harvest");

    handle.shutdown().await;
    task.await.expect("service task");

    metric_data.assert_async().await;
    errors.assert_async().await;
    shutdown.assert_async().await;
    assert!(matches!(
        handle.harvest_now().await,
        Err(HarvestError::Stopped)
    ));
}

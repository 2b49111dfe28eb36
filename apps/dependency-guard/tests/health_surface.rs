//! Health Surface Integration Tests
//!
//! Drives the HTTP health router against fake dependency endpoints served by
//! wiremock, wired by the same config-to-monitor path the binary uses.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use dependency_guard::config::load_config_from_string;
use dependency_guard::health::monitor_from_config;
use dependency_guard::health::server::router;
use dependency_guard::{CircuitState, HealthMonitor, HealthReport, HealthStatus};
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn fake_dependency(status: u16) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/healthz"))
        .respond_with(ResponseTemplate::new(status))
        .mount(&server)
        .await;
    server
}

fn monitor_for(yaml: &str) -> Arc<HealthMonitor> {
    let config = load_config_from_string(yaml).expect("valid config");
    Arc::new(monitor_from_config(&config, &reqwest::Client::new()))
}

async fn fetch_report(monitor: &Arc<HealthMonitor>) -> (StatusCode, HealthReport) {
    let response = router(Arc::clone(monitor))
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn all_dependencies_up_is_healthy() {
    let qdrant = fake_dependency(200).await;
    let kroki = fake_dependency(200).await;
    let yaml = format!(
        r"
service:
  name: knowledge-api
defaults:
  retry:
    max_retries: 0
dependencies:
  - name: qdrant
    health_url: {}/healthz
    critical: true
  - name: kroki
    health_url: {}/healthz
",
        qdrant.uri(),
        kroki.uri()
    );
    let monitor = monitor_for(&yaml);

    let (status, report) = fetch_report(&monitor).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report.status, HealthStatus::Healthy);
    assert_eq!(report.service, "knowledge-api");
    assert_eq!(report.checks["qdrant"].status, HealthStatus::Healthy);
    assert_eq!(report.dependencies["kroki"].status, HealthStatus::Healthy);
    assert_eq!(report.circuit_breakers.len(), 2);
    assert!(report.errors.is_empty());
}

#[tokio::test]
async fn failing_optional_dependency_degrades_then_opens_breaker() {
    let qdrant = fake_dependency(200).await;
    let kroki = fake_dependency(503).await;
    let yaml = format!(
        r"
defaults:
  retry:
    max_retries: 0
dependencies:
  - name: qdrant
    health_url: {}/healthz
    critical: true
  - name: kroki
    health_url: {}/healthz
    circuit_breaker:
      max_failures: 2
      reset_timeout_ms: 60000
",
        qdrant.uri(),
        kroki.uri()
    );
    let monitor = monitor_for(&yaml);

    let (status, report) = fetch_report(&monitor).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report.status, HealthStatus::Degraded);
    let kroki_result = &report.dependencies["kroki"];
    assert_eq!(kroki_result.status, HealthStatus::Unhealthy);
    assert!(kroki_result.message.contains("kroki health check"));
    assert!(!kroki_result.message.contains("503"));

    let (_, report) = fetch_report(&monitor).await;
    assert_eq!(report.circuit_breakers["kroki"].state, CircuitState::Open);
    assert!(
        report
            .errors
            .contains(&"circuit breaker 'kroki' is open".to_string())
    );

    // Further polls are answered by the breaker without touching the endpoint.
    let (_, report) = fetch_report(&monitor).await;
    assert_eq!(report.status, HealthStatus::Degraded);
    assert_eq!(kroki.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn failing_critical_dependency_is_unhealthy() {
    let qdrant = fake_dependency(500).await;
    let yaml = format!(
        r"
defaults:
  retry:
    max_retries: 0
dependencies:
  - name: qdrant
    health_url: {}/healthz
    critical: true
",
        qdrant.uri()
    );
    let monitor = monitor_for(&yaml);

    let (status, report) = fetch_report(&monitor).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(report.status, HealthStatus::Unhealthy);

    let response = router(Arc::clone(&monitor))
        .oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn unreachable_dependency_is_classified_without_leaking_address() {
    let yaml = r"
defaults:
  retry:
    max_retries: 0
dependencies:
  - name: search
    health_url: http://127.0.0.1:9/healthz
    check_timeout_ms: 1000
";
    let monitor = monitor_for(yaml);

    let (_, report) = fetch_report(&monitor).await;
    let search = &report.dependencies["search"];
    assert_eq!(search.status, HealthStatus::Unhealthy);
    assert!(!search.message.contains("127.0.0.1"));
    assert_eq!(report.status, HealthStatus::Degraded);
}

#[tokio::test]
async fn critical_dependencies_register_as_checks_with_breakers() {
    let qdrant = fake_dependency(200).await;
    let kroki = fake_dependency(200).await;
    let yaml = format!(
        r"
defaults:
  retry:
    max_retries: 0
dependencies:
  - name: qdrant
    health_url: {}/healthz
    critical: true
  - name: kroki
    health_url: {}/healthz
",
        qdrant.uri(),
        kroki.uri()
    );
    let monitor = monitor_for(&yaml);

    let (_, report) = fetch_report(&monitor).await;
    assert_eq!(report.status, HealthStatus::Healthy);
    assert!(report.checks.contains_key("qdrant"));
    assert!(!report.dependencies.contains_key("qdrant"));
    assert!(report.dependencies.contains_key("kroki"));
    assert!(!report.checks.contains_key("kroki"));
    assert_eq!(report.circuit_breakers["qdrant"].name, "qdrant");
    assert_eq!(report.circuit_breakers["kroki"].state, CircuitState::Closed);
}

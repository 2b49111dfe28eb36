//! Health probes.
//!
//! A probe answers one question: is this thing usable right now? `Ok(())`
//! means healthy; any error means unhealthy and is classified before it is
//! shown to anyone.

use std::future::Future;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::resilience::{BoxError, ExecutionPolicy, execute};

/// A named health check's body.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Run the check once.
    async fn check(&self) -> Result<(), BoxError>;
}

/// Probe backed by an async closure. See [`probe_fn`].
#[derive(Debug, Clone)]
pub struct FnProbe<F>(F);

/// Turn an async closure into a probe.
///
/// ```rust,ignore
/// monitor.add_check("cache", Duration::from_millis(200), probe_fn(move || {
///     let cache = cache.clone();
///     async move { cache.ping().await.map_err(Into::into) }
/// }));
/// ```
pub const fn probe_fn<F, Fut>(f: F) -> FnProbe<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), BoxError>> + Send,
{
    FnProbe(f)
}

#[async_trait]
impl<F, Fut> HealthProbe for FnProbe<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), BoxError>> + Send,
{
    async fn check(&self) -> Result<(), BoxError> {
        (self.0)().await
    }
}

/// Probe errors that are not transport errors.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    /// The endpoint answered with a non-2xx status.
    #[error("unexpected status {0} from health endpoint")]
    UnexpectedStatus(reqwest::StatusCode),
}

/// Probe that GETs a dependency's health endpoint.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpProbe {
    /// Create a probe for `url` using a shared client.
    #[must_use]
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    /// Probed URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Route this probe through `policy`, sharing its breaker with regular calls.
    #[must_use]
    pub const fn guarded(self, policy: ExecutionPolicy) -> GuardedProbe<Self> {
        GuardedProbe::new(self, policy)
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn check(&self) -> Result<(), BoxError> {
        let response = self.client.get(&self.url).send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ProbeError::UnexpectedStatus(status).into())
        }
    }
}

/// A probe run under an [`ExecutionPolicy`].
#[derive(Debug, Clone)]
pub struct GuardedProbe<P> {
    probe: P,
    policy: ExecutionPolicy,
}

impl<P> GuardedProbe<P> {
    /// Wrap `probe` with `policy`.
    #[must_use]
    pub const fn new(probe: P, policy: ExecutionPolicy) -> Self {
        Self { probe, policy }
    }

    /// Policy applied to every check.
    #[must_use]
    pub const fn policy(&self) -> &ExecutionPolicy {
        &self.policy
    }
}

#[async_trait]
impl<P: HealthProbe> HealthProbe for GuardedProbe<P> {
    async fn check(&self) -> Result<(), BoxError> {
        let cancel = CancellationToken::new();
        execute(&self.policy, &cancel, || self.probe.check()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState, is_circuit_open};
    use std::sync::Arc;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn fn_probe_runs_closure() {
        let probe = probe_fn(|| async { Ok::<(), BoxError>(()) });
        tokio_test::assert_ok!(probe.check().await);

        let failing = probe_fn(|| async { Err::<(), BoxError>("connection refused".into()) });
        assert_eq!(
            failing.check().await.unwrap_err().to_string(),
            "connection refused"
        );
    }

    #[tokio::test]
    async fn http_probe_accepts_2xx() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/healthz"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let probe = HttpProbe::new(reqwest::Client::new(), format!("{}/healthz", server.uri()));
        tokio_test::assert_ok!(probe.check().await);
    }

    #[tokio::test]
    async fn http_probe_rejects_other_statuses() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/healthz"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let probe = HttpProbe::new(reqwest::Client::new(), format!("{}/healthz", server.uri()));
        let error = probe.check().await.unwrap_err();
        assert_eq!(
            error.to_string(),
            "unexpected status 503 Service Unavailable from health endpoint"
        );
    }

    #[tokio::test]
    async fn guarded_probe_shares_breaker() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let breaker = Arc::new(CircuitBreaker::new(
            "kroki",
            CircuitBreakerConfig::new(1, Duration::from_secs(60), 1),
        ));
        let policy = ExecutionPolicy::new("kroki").with_breaker(Arc::clone(&breaker));
        let probe = HttpProbe::new(reqwest::Client::new(), server.uri()).guarded(policy);

        tokio_test::assert_err!(probe.check().await);
        assert_eq!(breaker.state(), CircuitState::Open);

        let error = probe.check().await.unwrap_err();
        assert!(is_circuit_open(&*error));
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }
}

//! Composite health reporting.
//!
//! [`HealthMonitor`] holds three registries: internal checks, dependency
//! checks, and circuit breakers. Every call to [`HealthMonitor::report`] runs
//! all probes once, in parallel, each bounded by its own timeout, and
//! returns an immutable [`HealthReport`].
//!
//! # Status Precedence
//!
//! ```text
//! any internal check unhealthy             → unhealthy
//! any dependency unhealthy or breaker open → degraded
//! otherwise                                → healthy
//! ```

mod probe;
pub mod server;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub use probe::{FnProbe, GuardedProbe, HealthProbe, HttpProbe, ProbeError, probe_fn};

use crate::config::Config;
use crate::error::classify;
use crate::observability;
use crate::resilience::{CircuitBreaker, CircuitBreakerStats, CircuitState};

/// Health of one check, or of the whole service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Working.
    Healthy,
    /// Working with reduced capability.
    Degraded,
    /// Not working.
    Unhealthy,
    /// The check could not produce an answer.
    Unknown,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => f.write_str("healthy"),
            Self::Degraded => f.write_str("degraded"),
            Self::Unhealthy => f.write_str("unhealthy"),
            Self::Unknown => f.write_str("unknown"),
        }
    }
}

/// Outcome of one probe run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    /// Probe status.
    pub status: HealthStatus,
    /// User-safe description.
    pub message: String,
    /// When the probe finished.
    pub timestamp: DateTime<Utc>,
    /// Probe latency in milliseconds.
    pub duration_ms: u64,
}

/// One polling pass over every registered check, dependency, and breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// Overall status.
    pub status: HealthStatus,
    /// When the report was assembled.
    pub timestamp: DateTime<Utc>,
    /// Service name.
    pub service: String,
    /// Seconds since the monitor was created.
    pub uptime_secs: u64,
    /// Internal check results by name.
    pub checks: BTreeMap<String, HealthCheckResult>,
    /// Dependency results by name.
    pub dependencies: BTreeMap<String, HealthCheckResult>,
    /// Breaker stats by registered name.
    pub circuit_breakers: BTreeMap<String, CircuitBreakerStats>,
    /// One line per problem found.
    pub errors: Vec<String>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum CheckKind {
    Check,
    Dependency,
}

impl CheckKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Check => "check",
            Self::Dependency => "dependency",
        }
    }
}

#[derive(Clone)]
struct Registered {
    probe: Arc<dyn HealthProbe>,
    timeout: Duration,
}

#[derive(Clone, Default)]
struct Registry {
    checks: BTreeMap<String, Registered>,
    dependencies: BTreeMap<String, Registered>,
    breakers: BTreeMap<String, Arc<CircuitBreaker>>,
}

/// Build a monitor for every configured dependency.
///
/// Each dependency gets its breaker registered and an HTTP probe guarded by
/// its policy. A `critical` dependency registers as an internal check, so its
/// failure makes the service unhealthy; the rest register as dependencies.
#[must_use]
pub fn monitor_from_config(config: &Config, client: &reqwest::Client) -> HealthMonitor {
    let monitor = HealthMonitor::new(config.service.name.clone());

    for dep in &config.dependencies {
        let policy = dep.policy(&config.defaults);
        if let Some(breaker) = &policy.breaker {
            monitor.add_circuit_breaker(dep.name.clone(), Arc::clone(breaker));
        }

        let probe = HttpProbe::new(client.clone(), dep.health_url.clone()).guarded(policy);
        if dep.critical {
            monitor.add_check(dep.name.clone(), dep.check_timeout(), probe);
        } else {
            monitor.add_dependency(dep.name.clone(), dep.check_timeout(), probe);
        }

        tracing::info!(
            dependency = %dep.name,
            url = %dep.health_url,
            critical = dep.critical,
            "Registered dependency"
        );
    }

    monitor
}

/// Aggregates checks, dependencies, and breakers into one report.
pub struct HealthMonitor {
    service: String,
    started_at: Instant,
    registry: RwLock<Registry>,
}

impl fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.registry.read();
        f.debug_struct("HealthMonitor")
            .field("service", &self.service)
            .field("checks", &registry.checks.keys().collect::<Vec<_>>())
            .field("dependencies", &registry.dependencies.keys().collect::<Vec<_>>())
            .field("circuit_breakers", &registry.breakers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl HealthMonitor {
    /// Create an empty monitor for `service`.
    #[must_use]
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            started_at: Instant::now(),
            registry: RwLock::new(Registry::default()),
        }
    }

    /// Service name.
    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Register an internal check. Failure makes the service unhealthy.
    pub fn add_check(
        &self,
        name: impl Into<String>,
        timeout: Duration,
        probe: impl HealthProbe + 'static,
    ) {
        let entry = Registered {
            probe: Arc::new(probe),
            timeout,
        };
        self.registry.write().checks.insert(name.into(), entry);
    }

    /// Register a dependency check. Failure degrades the service.
    pub fn add_dependency(
        &self,
        name: impl Into<String>,
        timeout: Duration,
        probe: impl HealthProbe + 'static,
    ) {
        let entry = Registered {
            probe: Arc::new(probe),
            timeout,
        };
        self.registry.write().dependencies.insert(name.into(), entry);
    }

    /// Register a breaker. An open breaker degrades the service.
    pub fn add_circuit_breaker(&self, name: impl Into<String>, breaker: Arc<CircuitBreaker>) {
        self.registry.write().breakers.insert(name.into(), breaker);
    }

    /// Run every probe once and assemble the report.
    ///
    /// Dropping the returned future aborts the probe tasks it spawned.
    pub async fn report(&self) -> HealthReport {
        let registry = self.registry.read().clone();

        let (checks, dependencies) = futures::join!(
            run_all(CheckKind::Check, registry.checks),
            run_all(CheckKind::Dependency, registry.dependencies),
        );

        let circuit_breakers: BTreeMap<String, CircuitBreakerStats> = registry
            .breakers
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.stats()))
            .collect();

        let mut errors = Vec::new();
        let passes = [
            (CheckKind::Check, &checks),
            (CheckKind::Dependency, &dependencies),
        ];
        for (kind, results) in passes {
            for (name, result) in results {
                if result.status != HealthStatus::Healthy {
                    errors.push(format!("{} '{name}': {}", kind.as_str(), result.message));
                }
            }
        }
        for (name, stats) in &circuit_breakers {
            if stats.state == CircuitState::Open {
                errors.push(format!("circuit breaker '{name}' is open"));
            }
        }

        let status = overall_status(&checks, &dependencies, &circuit_breakers);
        if status != HealthStatus::Healthy {
            tracing::warn!(
                service = %self.service,
                status = %status,
                problems = errors.len(),
                "Service not healthy"
            );
        }

        HealthReport {
            status,
            timestamp: Utc::now(),
            service: self.service.clone(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            checks,
            dependencies,
            circuit_breakers,
            errors,
        }
    }
}

fn overall_status(
    checks: &BTreeMap<String, HealthCheckResult>,
    dependencies: &BTreeMap<String, HealthCheckResult>,
    breakers: &BTreeMap<String, CircuitBreakerStats>,
) -> HealthStatus {
    if checks.values().any(|r| r.status == HealthStatus::Unhealthy) {
        HealthStatus::Unhealthy
    } else if dependencies.values().any(|r| r.status == HealthStatus::Unhealthy)
        || breakers.values().any(|s| s.state == CircuitState::Open)
    {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

async fn run_all(
    kind: CheckKind,
    entries: BTreeMap<String, Registered>,
) -> BTreeMap<String, HealthCheckResult> {
    let started = Instant::now();
    let (names, handles): (Vec<_>, Vec<_>) = entries
        .into_iter()
        .map(|(name, entry)| (name, tokio::spawn(run_probe(entry))))
        .unzip();
    let mut tasks = ProbeTasks(handles);

    let mut results = BTreeMap::new();
    for (name, handle) in names.into_iter().zip(tasks.0.iter_mut()) {
        let (status, message, elapsed) = match handle.await {
            Ok(ProbeOutcome::Passed(elapsed)) => {
                (HealthStatus::Healthy, "OK".to_string(), elapsed)
            }
            Ok(ProbeOutcome::Failed(error, elapsed)) => {
                tracing::warn!(
                    check = %name,
                    kind = kind.as_str(),
                    error = %error,
                    "Health check failed"
                );
                let message = classify(error, &format!("{name} health check"))
                    .message()
                    .to_string();
                (HealthStatus::Unhealthy, message, elapsed)
            }
            Ok(ProbeOutcome::TimedOut(after)) => {
                tracing::warn!(
                    check = %name,
                    kind = kind.as_str(),
                    timeout = ?after,
                    "Health check timed out"
                );
                (
                    HealthStatus::Unhealthy,
                    format!("health check timed out after {}ms", after.as_millis()),
                    after,
                )
            }
            Err(join_error) => {
                tracing::warn!(
                    check = %name,
                    kind = kind.as_str(),
                    error = %join_error,
                    "Health check did not complete"
                );
                (
                    HealthStatus::Unknown,
                    "health check did not complete".to_string(),
                    started.elapsed(),
                )
            }
        };

        observability::record_health_check_duration(
            &name,
            kind.as_str(),
            &status.to_string(),
            elapsed.as_secs_f64(),
        );
        results.insert(
            name,
            HealthCheckResult {
                status,
                message,
                timestamp: Utc::now(),
                duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            },
        );
    }
    results
}

/// Probe tasks of one report pass. Tasks still running when the pass is
/// dropped are aborted.
struct ProbeTasks(Vec<JoinHandle<ProbeOutcome>>);

impl Drop for ProbeTasks {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

enum ProbeOutcome {
    Passed(Duration),
    Failed(crate::resilience::BoxError, Duration),
    TimedOut(Duration),
}

async fn run_probe(entry: Registered) -> ProbeOutcome {
    let started = Instant::now();
    match tokio::time::timeout(entry.timeout, entry.probe.check()).await {
        Ok(Ok(())) => ProbeOutcome::Passed(started.elapsed()),
        Ok(Err(error)) => ProbeOutcome::Failed(error, started.elapsed()),
        Err(_) => ProbeOutcome::TimedOut(entry.timeout),
    }
}

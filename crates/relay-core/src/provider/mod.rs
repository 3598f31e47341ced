//! Resource provider lifecycle management.
//!
//! A [`ResourceProvider`] owns one external capability back-end: it discovers
//! whether the back-end exists, polls its health on an interval, and exposes
//! stable info snapshots, isolating failures behind two independent circuit
//! breakers (discovery, health-check). Consumers subscribe to per-instance
//! lifecycle events instead of polling.

pub mod backend;
pub mod config;
pub mod events;

pub use backend::{DiscoveryError, HealthCheckError, HealthCheckResult, ProviderBackend};
pub use config::{AuthConfig, AuthScheme, ProviderConfig};
pub use events::ProviderEvent;

use crate::breaker::{CircuitBreaker, CircuitBreakerConfig};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Consecutive health-check failures tolerated before the resource is
/// declared lost.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Whether the back-end has been discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscoveryStatus {
    /// The back-end exists and is usable.
    Available,
    /// The back-end has not been found (or was lost).
    NotFound,
}

/// Last observed health of a discovered back-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceHealth {
    /// Last probe succeeded.
    Healthy,
    /// Last probe failed.
    Unhealthy,
    /// No probe has run since (re)discovery.
    Unknown,
}

/// Public info snapshot - no secrets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderInfo {
    /// Provider identifier.
    pub id: String,
    /// Capability category.
    pub category: String,
    /// Human-readable display name.
    pub display_name: String,
    /// Current discovery status.
    pub status: DiscoveryStatus,
    /// Current health.
    pub health: ResourceHealth,
    /// Current consecutive health-check failure count.
    pub consecutive_failures: u32,
}

/// Internal info snapshot - adds the resolved configuration.
///
/// For server-side callers only; never expose to end users.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderInternalInfo {
    /// The public snapshot.
    pub info: ProviderInfo,
    /// The resolved provider configuration.
    pub config: ProviderConfig,
}

#[derive(Debug)]
struct ProviderState {
    status: DiscoveryStatus,
    health: ResourceHealth,
    consecutive_failures: u32,
}

/// Lifecycle manager for one external capability back-end.
pub struct ResourceProvider {
    /// The guarded back-end.
    backend: Arc<dyn ProviderBackend>,
    /// Provider configuration.
    config: ProviderConfig,
    /// Authentication scheme, derived once from the configuration.
    auth: AuthScheme,
    /// Orthogonal status/health state.
    state: RwLock<ProviderState>,
    /// Breaker guarding discovery probes.
    discovery_breaker: CircuitBreaker,
    /// Breaker guarding health probes.
    health_breaker: CircuitBreaker,
    /// Per-instance lifecycle event channel.
    events_tx: broadcast::Sender<ProviderEvent>,
    /// Shutdown signal for the monitor task.
    shutdown_tx: broadcast::Sender<()>,
    /// Active health monitor task, if any.
    monitor: Mutex<Option<JoinHandle<()>>>,
    /// Whether `initialize` has run.
    initialized: AtomicBool,
}

impl ResourceProvider {
    /// Creates a provider around a back-end.
    ///
    /// Returned as `Arc` because the health monitor task holds a weak
    /// reference back to the provider.
    pub fn new(backend: Arc<dyn ProviderBackend>, config: ProviderConfig) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(100);
        let (shutdown_tx, _) = broadcast::channel(16);
        let auth = AuthScheme::from_config(&config.auth);
        let id = backend.id().to_string();
        Arc::new(Self {
            backend,
            config,
            auth,
            state: RwLock::new(ProviderState {
                status: DiscoveryStatus::NotFound,
                health: ResourceHealth::Unknown,
                consecutive_failures: 0,
            }),
            discovery_breaker: CircuitBreaker::new(
                format!("{id}-discovery"),
                CircuitBreakerConfig::discovery(),
            ),
            health_breaker: CircuitBreaker::new(
                format!("{id}-health"),
                CircuitBreakerConfig::health_check(),
            ),
            events_tx,
            shutdown_tx,
            monitor: Mutex::new(None),
            initialized: AtomicBool::new(false),
        })
    }

    /// Initializes the provider: one discovery, then background health
    /// monitoring when an interval is configured.
    ///
    /// No-op when already initialized or when the provider is disabled (the
    /// back-end stays `NotFound` and discovery is never invoked).
    pub async fn initialize(self: &Arc<Self>) {
        if self.initialized.load(Ordering::SeqCst) {
            debug!(provider_id = %self.backend.id(), "Provider already initialized");
            return;
        }
        if !self.config.enabled {
            debug!(provider_id = %self.backend.id(), "Provider disabled, skipping discovery");
            return;
        }
        self.initialized.store(true, Ordering::SeqCst);

        let found = self.discover().await;
        if found && self.config.health_check_interval.is_some() {
            self.restart_health_monitoring();
        }
    }

    /// Runs one discovery probe through the discovery breaker.
    ///
    /// # Returns
    /// True if the back-end is available after the probe.
    pub async fn discover(&self) -> bool {
        let backend = Arc::clone(&self.backend);
        let result =
            self.discovery_breaker.execute(move || async move { backend.perform_discovery().await }).await;

        let found = match &result {
            Ok(found) => *found,
            Err(e) => {
                debug!(provider_id = %self.backend.id(), error = %e, "Discovery probe failed");
                false
            }
        };

        let (was_available, health_changed) = {
            let mut state = self.state.write().unwrap();
            let was_available = state.status == DiscoveryStatus::Available;
            state.status =
                if found { DiscoveryStatus::Available } else { DiscoveryStatus::NotFound };
            let health_changed = if found {
                false
            } else {
                let changed = state.health != ResourceHealth::Unknown;
                state.health = ResourceHealth::Unknown;
                changed
            };
            (was_available, health_changed)
        };

        if found && !was_available {
            info!(provider_id = %self.backend.id(), "Resource discovered");
            self.emit(ProviderEvent::Discovered { provider_id: self.backend.id().to_string() });
        } else if !found && was_available {
            warn!(provider_id = %self.backend.id(), "Resource lost");
            self.emit(ProviderEvent::Lost {
                provider_id: self.backend.id().to_string(),
                status: DiscoveryStatus::NotFound,
            });
            if health_changed {
                self.emit(ProviderEvent::HealthChanged {
                    provider_id: self.backend.id().to_string(),
                    health: ResourceHealth::Unknown,
                });
            }
        }

        found
    }

    /// Runs one health probe through the health breaker.
    ///
    /// Short-circuits without touching the back-end when the resource is not
    /// available. Crossing [`MAX_CONSECUTIVE_FAILURES`] declares the resource
    /// lost and stops monitoring.
    pub async fn health_check(&self) -> HealthCheckResult {
        {
            let state = self.state.read().unwrap();
            if state.status != DiscoveryStatus::Available {
                return HealthCheckResult::unhealthy(format!(
                    "{} not available",
                    self.backend.id()
                ));
            }
        }

        let backend = Arc::clone(&self.backend);
        let result = self
            .health_breaker
            .execute(move || async move { backend.perform_health_check().await })
            .await;

        match result {
            Ok(check) if check.healthy => {
                self.record_health(ResourceHealth::Healthy);
                check
            }
            Ok(check) => {
                self.record_health_failure();
                check
            }
            Err(e) => {
                self.record_health_failure();
                HealthCheckResult::unhealthy(e.to_string())
            }
        }
    }

    /// Restarts background health monitoring.
    ///
    /// Idempotent: any prior monitor task is cancelled before a new one is
    /// scheduled. No-op when no interval is configured.
    pub fn restart_health_monitoring(self: &Arc<Self>) {
        let mut guard = self.monitor.lock().unwrap();
        if let Some(handle) = guard.take() {
            handle.abort();
        }
        let Some(interval) = self.config.health_check_interval else {
            return;
        };

        let weak = Arc::downgrade(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let provider_id = self.backend.id().to_string();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(provider) = weak.upgrade() else { break };
                        if provider.status() != DiscoveryStatus::Available {
                            debug!(provider_id = %provider_id, "Resource no longer available, stopping health monitor");
                            break;
                        }
                        provider.health_check().await;
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
        *guard = Some(handle);
        debug!(provider_id = %self.backend.id(), "Health monitoring (re)started");
    }

    /// Shuts the provider down: cancels monitoring, forces
    /// `NotFound`/`Unknown`, and marks the provider uninitialized.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.monitor.lock().unwrap().take() {
            handle.abort();
        }
        {
            let mut state = self.state.write().unwrap();
            state.status = DiscoveryStatus::NotFound;
            state.health = ResourceHealth::Unknown;
            state.consecutive_failures = 0;
        }
        self.initialized.store(false, Ordering::SeqCst);
        info!(provider_id = %self.backend.id(), "Provider shut down");
    }

    /// Subscribes to this provider's lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ProviderEvent> {
        self.events_tx.subscribe()
    }

    /// Public info snapshot - id, category, display metadata, status, health.
    pub fn public_info(&self) -> ProviderInfo {
        let state = self.state.read().unwrap();
        ProviderInfo {
            id: self.backend.id().to_string(),
            category: self.backend.category().to_string(),
            display_name: self.backend.display_name().to_string(),
            status: state.status,
            health: state.health,
            consecutive_failures: state.consecutive_failures,
        }
    }

    /// Internal info snapshot - adds the resolved configuration.
    pub fn internal_info(&self) -> ProviderInternalInfo {
        ProviderInternalInfo { info: self.public_info(), config: self.config.clone() }
    }

    /// The authentication scheme derived from configuration, for back-ends
    /// building calls.
    pub fn auth_scheme(&self) -> &AuthScheme {
        &self.auth
    }

    /// Current discovery status.
    pub fn status(&self) -> DiscoveryStatus {
        self.state.read().unwrap().status
    }

    /// Current health.
    pub fn health(&self) -> ResourceHealth {
        self.state.read().unwrap().health
    }

    fn emit(&self, event: ProviderEvent) {
        let _ = self.events_tx.send(event);
    }

    fn record_health(&self, health: ResourceHealth) {
        let changed = {
            let mut state = self.state.write().unwrap();
            state.consecutive_failures = 0;
            let changed = state.health != health;
            state.health = health;
            changed
        };
        if changed {
            self.emit(ProviderEvent::HealthChanged {
                provider_id: self.backend.id().to_string(),
                health,
            });
        }
    }

    fn record_health_failure(&self) {
        let (health_changed, forced_lost, failures) = {
            let mut state = self.state.write().unwrap();
            state.consecutive_failures += 1;
            let health_changed = state.health != ResourceHealth::Unhealthy;
            state.health = ResourceHealth::Unhealthy;
            let forced_lost = state.consecutive_failures > MAX_CONSECUTIVE_FAILURES;
            if forced_lost {
                state.status = DiscoveryStatus::NotFound;
                state.health = ResourceHealth::Unknown;
            }
            (health_changed, forced_lost, state.consecutive_failures)
        };

        if health_changed && !forced_lost {
            self.emit(ProviderEvent::HealthChanged {
                provider_id: self.backend.id().to_string(),
                health: ResourceHealth::Unhealthy,
            });
        }

        if forced_lost {
            warn!(
                provider_id = %self.backend.id(),
                consecutive_failures = failures,
                "Too many consecutive health-check failures, declaring resource lost"
            );
            self.emit(ProviderEvent::Lost {
                provider_id: self.backend.id().to_string(),
                status: DiscoveryStatus::NotFound,
            });
            self.emit(ProviderEvent::HealthChanged {
                provider_id: self.backend.id().to_string(),
                health: ResourceHealth::Unknown,
            });
        } else {
            debug!(
                provider_id = %self.backend.id(),
                consecutive_failures = failures,
                "Health check failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Back-end with scripted probe behavior and call counters.
    struct MockBackend {
        discovery_calls: AtomicUsize,
        health_calls: AtomicUsize,
        discover_result: Mutex<Result<bool, DiscoveryError>>,
        health_result: Mutex<Result<HealthCheckResult, HealthCheckError>>,
    }

    impl MockBackend {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                discovery_calls: AtomicUsize::new(0),
                health_calls: AtomicUsize::new(0),
                discover_result: Mutex::new(Ok(true)),
                health_result: Mutex::new(Ok(HealthCheckResult::healthy())),
            })
        }

        fn set_discover(&self, result: Result<bool, DiscoveryError>) {
            *self.discover_result.lock().unwrap() = result;
        }

        fn set_health(&self, result: Result<HealthCheckResult, HealthCheckError>) {
            *self.health_result.lock().unwrap() = result;
        }
    }

    #[async_trait]
    impl ProviderBackend for MockBackend {
        fn id(&self) -> &str {
            "mock-backend"
        }

        fn category(&self) -> &str {
            "model"
        }

        fn display_name(&self) -> &str {
            "Mock Backend"
        }

        async fn perform_discovery(&self) -> Result<bool, DiscoveryError> {
            self.discovery_calls.fetch_add(1, Ordering::SeqCst);
            self.discover_result.lock().unwrap().clone()
        }

        async fn perform_health_check(&self) -> Result<HealthCheckResult, HealthCheckError> {
            self.health_calls.fetch_add(1, Ordering::SeqCst);
            self.health_result.lock().unwrap().clone()
        }
    }

    #[tokio::test]
    async fn test_disabled_provider_never_discovers() {
        let backend = MockBackend::new();
        let provider =
            ResourceProvider::new(Arc::clone(&backend) as Arc<dyn ProviderBackend>, ProviderConfig::disabled());

        provider.initialize().await;

        assert_eq!(provider.status(), DiscoveryStatus::NotFound);
        assert_eq!(backend.discovery_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_discovery_success_emits_discovered() {
        let backend = MockBackend::new();
        let provider = ResourceProvider::new(
            Arc::clone(&backend) as Arc<dyn ProviderBackend>,
            ProviderConfig::enabled(None),
        );
        let mut events = provider.subscribe();

        provider.initialize().await;

        assert_eq!(provider.status(), DiscoveryStatus::Available);
        assert_eq!(
            events.recv().await.unwrap(),
            ProviderEvent::Discovered { provider_id: "mock-backend".to_string() }
        );
    }

    #[tokio::test]
    async fn test_discovery_false_leaves_not_found() {
        let backend = MockBackend::new();
        backend.set_discover(Ok(false));
        let provider = ResourceProvider::new(
            Arc::clone(&backend) as Arc<dyn ProviderBackend>,
            ProviderConfig::enabled(None),
        );

        provider.initialize().await;
        assert_eq!(provider.status(), DiscoveryStatus::NotFound);
    }

    #[tokio::test]
    async fn test_discovery_error_leaves_not_found() {
        let backend = MockBackend::new();
        backend.set_discover(Err(DiscoveryError("connection refused".to_string())));
        let provider = ResourceProvider::new(
            Arc::clone(&backend) as Arc<dyn ProviderBackend>,
            ProviderConfig::enabled(None),
        );

        provider.initialize().await;
        assert_eq!(provider.status(), DiscoveryStatus::NotFound);
    }

    #[tokio::test]
    async fn test_losing_discovered_resource_emits_lost() {
        let backend = MockBackend::new();
        let provider = ResourceProvider::new(
            Arc::clone(&backend) as Arc<dyn ProviderBackend>,
            ProviderConfig::enabled(None),
        );
        provider.initialize().await;
        let mut events = provider.subscribe();

        backend.set_discover(Ok(false));
        assert!(!provider.discover().await);

        assert_eq!(provider.status(), DiscoveryStatus::NotFound);
        assert_eq!(
            events.recv().await.unwrap(),
            ProviderEvent::Lost {
                provider_id: "mock-backend".to_string(),
                status: DiscoveryStatus::NotFound,
            }
        );
    }

    #[tokio::test]
    async fn test_health_check_short_circuits_when_not_available() {
        let backend = MockBackend::new();
        backend.set_discover(Ok(false));
        let provider = ResourceProvider::new(
            Arc::clone(&backend) as Arc<dyn ProviderBackend>,
            ProviderConfig::enabled(None),
        );
        provider.initialize().await;

        let result = provider.health_check().await;

        assert!(!result.healthy);
        assert!(result.message.unwrap().contains("not available"));
        assert_eq!(backend.health_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_healthy_check_sets_health_and_emits_change() {
        let backend = MockBackend::new();
        let provider = ResourceProvider::new(
            Arc::clone(&backend) as Arc<dyn ProviderBackend>,
            ProviderConfig::enabled(None),
        );
        provider.initialize().await;
        let mut events = provider.subscribe();

        let result = provider.health_check().await;

        assert!(result.healthy);
        assert_eq!(provider.health(), ResourceHealth::Healthy);
        assert_eq!(
            events.recv().await.unwrap(),
            ProviderEvent::HealthChanged {
                provider_id: "mock-backend".to_string(),
                health: ResourceHealth::Healthy,
            }
        );
    }

    #[tokio::test]
    async fn test_consecutive_failures_force_resource_lost() {
        let backend = MockBackend::new();
        let provider = ResourceProvider::new(
            Arc::clone(&backend) as Arc<dyn ProviderBackend>,
            ProviderConfig::enabled(None),
        );
        provider.initialize().await;
        backend.set_health(Ok(HealthCheckResult::unhealthy("degraded")));

        for _ in 0..MAX_CONSECUTIVE_FAILURES {
            provider.health_check().await;
        }
        assert_eq!(provider.status(), DiscoveryStatus::Available);
        assert_eq!(provider.health(), ResourceHealth::Unhealthy);

        // The sixth consecutive failure declares the resource lost.
        provider.health_check().await;
        assert_eq!(provider.status(), DiscoveryStatus::NotFound);
        assert_eq!(provider.health(), ResourceHealth::Unknown);
    }

    #[tokio::test]
    async fn test_recovery_resets_failure_counter() {
        let backend = MockBackend::new();
        let provider = ResourceProvider::new(
            Arc::clone(&backend) as Arc<dyn ProviderBackend>,
            ProviderConfig::enabled(None),
        );
        provider.initialize().await;

        backend.set_health(Ok(HealthCheckResult::unhealthy("degraded")));
        for _ in 0..3 {
            provider.health_check().await;
        }
        assert_eq!(provider.public_info().consecutive_failures, 3);

        backend.set_health(Ok(HealthCheckResult::healthy()));
        provider.health_check().await;
        assert_eq!(provider.public_info().consecutive_failures, 0);
        assert_eq!(provider.health(), ResourceHealth::Healthy);
    }

    #[tokio::test]
    async fn test_background_monitoring_declares_lost_resource() {
        let backend = MockBackend::new();
        let provider = ResourceProvider::new(
            Arc::clone(&backend) as Arc<dyn ProviderBackend>,
            ProviderConfig::enabled(Some(Duration::from_millis(10))),
        );
        backend.set_health(Ok(HealthCheckResult::unhealthy("degraded")));

        provider.initialize().await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(provider.status(), DiscoveryStatus::NotFound);
        assert_eq!(provider.health(), ResourceHealth::Unknown);
        provider.shutdown();
    }

    #[tokio::test]
    async fn test_restart_health_monitoring_is_idempotent() {
        let backend = MockBackend::new();
        let provider = ResourceProvider::new(
            Arc::clone(&backend) as Arc<dyn ProviderBackend>,
            ProviderConfig::enabled(Some(Duration::from_millis(50))),
        );
        provider.initialize().await;

        provider.restart_health_monitoring();
        provider.restart_health_monitoring();

        // Exactly one monitor task is live after repeated restarts.
        assert!(provider.monitor.lock().unwrap().is_some());
        provider.shutdown();
        assert!(provider.monitor.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_public_info_is_idempotent() {
        let backend = MockBackend::new();
        let provider = ResourceProvider::new(
            Arc::clone(&backend) as Arc<dyn ProviderBackend>,
            ProviderConfig::enabled(None),
        );
        provider.initialize().await;

        assert_eq!(provider.public_info(), provider.public_info());
    }

    #[tokio::test]
    async fn test_shutdown_resets_state() {
        let backend = MockBackend::new();
        let provider = ResourceProvider::new(
            Arc::clone(&backend) as Arc<dyn ProviderBackend>,
            ProviderConfig::enabled(None),
        );
        provider.initialize().await;
        assert_eq!(provider.status(), DiscoveryStatus::Available);

        provider.shutdown();

        assert_eq!(provider.status(), DiscoveryStatus::NotFound);
        assert_eq!(provider.health(), ResourceHealth::Unknown);

        // Re-initialization runs discovery again.
        provider.initialize().await;
        assert_eq!(provider.status(), DiscoveryStatus::Available);
        assert_eq!(backend.discovery_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_auth_scheme_derived_from_config() {
        let backend = MockBackend::new();
        let mut config = ProviderConfig::enabled(None);
        config.auth.bearer_token = Some("secret".to_string());
        let provider = ResourceProvider::new(Arc::clone(&backend) as Arc<dyn ProviderBackend>, config);

        assert_eq!(provider.auth_scheme(), &AuthScheme::Bearer("secret".to_string()));
    }
}

//! Back-end trait implemented per external capability provider.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error raised by a back-end's discovery probe.
///
/// Provider-internal: callers only ever observe the derived discovery status.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Discovery failed: {0}")]
pub struct DiscoveryError(pub String);

/// Error raised by a back-end's health probe.
///
/// Provider-internal: callers only ever observe the derived health.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Health check failed: {0}")]
pub struct HealthCheckError(pub String);

/// Outcome of one health probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    /// Whether the back-end responded healthily.
    pub healthy: bool,
    /// Optional detail message.
    pub message: Option<String>,
}

impl HealthCheckResult {
    /// A healthy result with no message.
    pub fn healthy() -> Self {
        Self { healthy: true, message: None }
    }

    /// An unhealthy result with a detail message.
    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self { healthy: false, message: Some(message.into()) }
    }
}

/// One external capability back-end.
///
/// Implementations perform the actual probes; the surrounding
/// [`ResourceProvider`](super::ResourceProvider) owns the state machine,
/// breakers, and event emission.
#[async_trait]
pub trait ProviderBackend: Send + Sync {
    /// Stable identifier for this back-end.
    fn id(&self) -> &str;

    /// Capability category (e.g. "model", "tool").
    fn category(&self) -> &str;

    /// Human-readable display name.
    fn display_name(&self) -> &str;

    /// Probes whether the back-end exists.
    ///
    /// # Returns
    /// `Ok(true)` if the back-end was found, `Ok(false)` if it was not.
    ///
    /// # Errors
    /// Returns `DiscoveryError` if the probe itself failed.
    async fn perform_discovery(&self) -> Result<bool, DiscoveryError>;

    /// Probes the back-end's health.
    ///
    /// Only invoked while the back-end is discovered.
    ///
    /// # Errors
    /// Returns `HealthCheckError` if the probe itself failed.
    async fn perform_health_check(&self) -> Result<HealthCheckResult, HealthCheckError>;
}

//! Provider lifecycle events.
//!
//! Each [`ResourceProvider`](super::ResourceProvider) owns its own broadcast
//! channel; there is no process-wide bus, so multiple provider instances
//! cannot cross-talk.

use super::{DiscoveryStatus, ResourceHealth};
use serde::{Deserialize, Serialize};

/// Event emitted by a resource provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderEvent {
    /// The back-end transitioned from not-found to available.
    Discovered {
        /// Provider identifier.
        provider_id: String,
    },
    /// The back-end transitioned from available to not-found.
    Lost {
        /// Provider identifier.
        provider_id: String,
        /// Discovery status after the loss (always `NotFound`).
        status: DiscoveryStatus,
    },
    /// The back-end's health changed.
    HealthChanged {
        /// Provider identifier.
        provider_id: String,
        /// The new health.
        health: ResourceHealth,
    },
}

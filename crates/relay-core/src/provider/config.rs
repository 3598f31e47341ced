//! Resource provider configuration and derived authentication.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Authentication material supplied in the provider configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    /// API key, sent as a dedicated header.
    pub api_key: Option<String>,
    /// Bearer token.
    pub bearer_token: Option<String>,
    /// Basic-auth username.
    pub username: Option<String>,
    /// Basic-auth password.
    pub password: Option<String>,
}

/// Authentication scheme derived once from [`AuthConfig`].
///
/// Exposed to back-ends for building calls; not part of the provider state
/// machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthScheme {
    /// API-key header authentication.
    ApiKey(String),
    /// Bearer-token authentication.
    Bearer(String),
    /// Basic authentication.
    Basic {
        /// Username.
        username: String,
        /// Password.
        password: String,
    },
    /// No authentication configured.
    None,
}

impl AuthScheme {
    /// Derives the scheme from configuration.
    ///
    /// Precedence: api-key, then bearer, then basic.
    pub fn from_config(auth: &AuthConfig) -> Self {
        if let Some(key) = &auth.api_key {
            return Self::ApiKey(key.clone());
        }
        if let Some(token) = &auth.bearer_token {
            return Self::Bearer(token.clone());
        }
        if let (Some(username), Some(password)) = (&auth.username, &auth.password) {
            return Self::Basic { username: username.clone(), password: password.clone() };
        }
        Self::None
    }
}

/// Configuration for one resource provider instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Whether this provider participates at all.
    pub enabled: bool,
    /// Health polling interval; `None` disables background monitoring.
    #[serde(default)]
    pub health_check_interval: Option<Duration>,
    /// Authentication material.
    #[serde(default)]
    pub auth: AuthConfig,
    /// Free-form display metadata, surfaced in info snapshots.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl ProviderConfig {
    /// Enabled provider with the given polling interval.
    pub fn enabled(health_check_interval: Option<Duration>) -> Self {
        Self {
            enabled: true,
            health_check_interval,
            auth: AuthConfig::default(),
            metadata: serde_json::Value::Null,
        }
    }

    /// Disabled provider; discovery is never attempted.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            health_check_interval: None,
            auth: AuthConfig::default(),
            metadata: serde_json::Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_scheme_precedence() {
        let auth = AuthConfig {
            api_key: Some("key".to_string()),
            bearer_token: Some("token".to_string()),
            username: None,
            password: None,
        };
        assert_eq!(AuthScheme::from_config(&auth), AuthScheme::ApiKey("key".to_string()));
    }

    #[test]
    fn test_auth_scheme_basic() {
        let auth = AuthConfig {
            api_key: None,
            bearer_token: None,
            username: Some("user".to_string()),
            password: Some("pass".to_string()),
        };
        assert_eq!(
            AuthScheme::from_config(&auth),
            AuthScheme::Basic { username: "user".to_string(), password: "pass".to_string() }
        );
    }

    #[test]
    fn test_auth_scheme_none() {
        assert_eq!(AuthScheme::from_config(&AuthConfig::default()), AuthScheme::None);
    }
}

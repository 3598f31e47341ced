//! Model invocation interface.
//!
//! Strategies drive model back-ends exclusively through [`ModelInvoker`]; the
//! prompt wire protocol, retries, and transport all live behind it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors a model invocation can fail with.
///
/// Strategies must catch every variant and convert it into a step-level
/// failure; an invocation error never crosses the strategy boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvocationError {
    /// The call exceeded its time budget.
    #[error("Invocation timed out after {elapsed_ms}ms")]
    Timeout {
        /// Elapsed wall-clock time in milliseconds.
        elapsed_ms: u64,
    },

    /// Provider quota exceeded or rate limit hit.
    #[error("Quota exceeded{}", message.as_ref().map(|m| format!(": {}", m)).unwrap_or_default())]
    QuotaExceeded {
        /// Optional error message from the provider.
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// Transport-level failure (network, connection reset, ...).
    #[error("Transport error: {0}")]
    Transport(String),

    /// Other unexpected errors.
    #[error("Invocation error: {0}")]
    Other(String),
}

/// Resource budget attached to a single invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationBudget {
    /// Maximum credits this call may consume.
    pub max_credits: u64,
    /// Maximum tokens to generate.
    pub max_tokens: u32,
    /// Wall-clock ceiling in milliseconds.
    pub max_time_ms: u64,
    /// Tool names the call may invoke.
    pub tools: Vec<String>,
}

impl InvocationBudget {
    /// Creates a budget with no tools enabled.
    pub fn new(max_credits: u64, max_tokens: u32, max_time_ms: u64) -> Self {
        Self { max_credits, max_tokens, max_time_ms, tools: Vec::new() }
    }
}

/// A single model invocation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationRequest {
    /// The user-facing prompt.
    pub prompt: String,
    /// Optional system message prepended to the conversation.
    pub system_message: Option<String>,
    /// Maximum tokens to generate for this call.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
    /// Resource budget for the call.
    pub budget: InvocationBudget,
}

impl InvocationRequest {
    /// Creates a request with default temperature and the given budget.
    pub fn new(prompt: impl Into<String>, budget: InvocationBudget) -> Self {
        Self {
            prompt: prompt.into(),
            system_message: None,
            max_tokens: budget.max_tokens,
            temperature: 0.7,
            budget,
        }
    }

    /// Sets the system message.
    #[must_use]
    pub fn with_system_message(mut self, system_message: impl Into<String>) -> Self {
        self.system_message = Some(system_message.into());
        self
    }

    /// Sets the per-call token ceiling.
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Sets the sampling temperature.
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

/// The response from a model invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationResponse {
    /// Generated text content.
    pub content: String,
    /// Credits consumed by the call.
    pub credits_used: u64,
    /// Number of tool calls the model made.
    pub tool_calls: u32,
}

/// A trait for invoking model back-ends.
///
/// All invokers must be `Send + Sync` to allow concurrent use across
/// strategy tasks.
#[async_trait]
pub trait ModelInvoker: Send + Sync {
    /// Invokes the model once.
    ///
    /// # Arguments
    /// * `request` - The invocation request, including its budget
    ///
    /// # Errors
    /// Returns an `InvocationError` if the call fails.
    async fn invoke(&self, request: InvocationRequest)
    -> Result<InvocationResponse, InvocationError>;
}

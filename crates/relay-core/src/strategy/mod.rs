//! Pluggable per-step execution strategies.
//!
//! A strategy turns one [`ExecutionContext`] into step outputs under a
//! resource budget. Failures never cross the strategy boundary as `Err`:
//! every timeout, credit exhaustion, or invocation failure becomes a
//! `success: false` result that still reports the partial spend.

pub mod context;
pub mod conversational;
pub mod deterministic;
pub mod four_phase;
pub mod registry;

pub use context::{ExecutionContext, ExecutionLimits};
pub use conversational::ConversationalStrategy;
pub use deterministic::DeterministicStrategy;
pub use four_phase::FourPhaseStrategy;
pub use registry::{StrategyRegistry, StrategyRegistryConfig};

use crate::run::routine::StepDefinition;
use async_trait::async_trait;
use regex::Regex;
use relay_abstraction::{
    ChatMessage, InvocationError, MessageStore, ModelInvoker, ValidationEngine,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// How a step is executed; the primary dispatch signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepExecutionKind {
    /// Single-shot invocation, no loop. The default fallback.
    Deterministic,
    /// Analyze / plan / execute / refine pipeline.
    FourPhase,
    /// Bounded multi-turn dialogue.
    Conversational,
}

/// Step-level failure, carried as data across the strategy boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepError {
    /// Stable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Structured detail payload.
    pub details: Value,
}

impl StepError {
    /// Creates a step error.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { code: code.into(), message: message.into(), details: Value::Null }
    }

    /// Cancellation observed mid-step.
    pub fn cancelled() -> Self {
        Self::new("CANCELLED", "Execution cancelled")
    }

    /// The step exceeded its time budget.
    pub fn timeout(elapsed: Duration) -> Self {
        Self::new("TIMEOUT", format!("Step timed out after {}ms", elapsed.as_millis()))
    }

    /// The step exhausted its credit budget.
    pub fn credit_exhausted(used: u64, limit: u64) -> Self {
        Self::new("CREDIT_EXHAUSTED", format!("Credit budget exhausted: {used}/{limit}"))
    }

    /// A model invocation failed.
    pub fn invocation(message: impl Into<String>) -> Self {
        Self::new("INVOCATION_FAILED", message)
    }
}

/// Result of executing one step through a strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecutionResult {
    /// Whether the step succeeded.
    pub success: bool,
    /// Produced output values, keyed by output name.
    pub outputs: HashMap<String, Value>,
    /// Credits consumed, including on failure.
    pub credits_used: u64,
    /// Wall-clock time spent.
    pub time_elapsed: Duration,
    /// Tool calls made.
    pub tool_calls: u32,
    /// Messages produced during execution.
    pub messages: Vec<ChatMessage>,
    /// Failure description, present iff `success` is false.
    pub error: Option<StepError>,
    /// Strategy-specific metadata (confidence, validation, turn counts, ...).
    pub metadata: Value,
}

impl StepExecutionResult {
    /// Creates a successful result.
    pub fn success(
        outputs: HashMap<String, Value>,
        credits_used: u64,
        time_elapsed: Duration,
        tool_calls: u32,
        messages: Vec<ChatMessage>,
    ) -> Self {
        Self {
            success: true,
            outputs,
            credits_used,
            time_elapsed,
            tool_calls,
            messages,
            error: None,
            metadata: Value::Null,
        }
    }

    /// Creates a failed result that still accounts the partial spend.
    pub fn failure(
        error: StepError,
        credits_used: u64,
        time_elapsed: Duration,
        tool_calls: u32,
        messages: Vec<ChatMessage>,
    ) -> Self {
        Self {
            success: false,
            outputs: HashMap::new(),
            credits_used,
            time_elapsed,
            tool_calls,
            messages,
            error: Some(error),
            metadata: Value::Null,
        }
    }

    /// Attaches metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Collaborators a strategy executes against.
///
/// The context is borrowed for the duration of one step and must not be
/// retained past the call.
pub struct StrategyDeps<'a> {
    /// The per-step execution context.
    pub context: &'a ExecutionContext,
    /// Model invocation collaborator.
    pub invoker: Arc<dyn ModelInvoker>,
    /// Message/output store.
    pub messages: Arc<dyn MessageStore>,
    /// Validation collaborator, consumed by the refine phase.
    pub validator: Option<Arc<dyn ValidationEngine>>,
    /// Cancellation signal; observed at least once per turn/phase.
    pub cancel: CancellationToken,
}

/// Converts an invocation error into a step-level failure, preserving the
/// variant as a stable code.
pub(crate) fn step_error_from_invocation(err: &InvocationError) -> StepError {
    let code = match err {
        InvocationError::Timeout { .. } => "TIMEOUT",
        InvocationError::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
        InvocationError::Transport(_) => "TRANSPORT_FAILED",
        InvocationError::Other(_) => "INVOCATION_FAILED",
    };
    StepError::new(code, err.to_string())
}

/// Appends a message to the step's conversation, best effort. Persistence
/// failures are logged and never fail the step.
pub(crate) async fn persist_message(
    store: &Arc<dyn MessageStore>,
    conversation_id: &str,
    message: &ChatMessage,
) {
    if let Err(err) = store.add_message(conversation_id, message.clone()).await {
        warn!(conversation_id, error = %err, "Failed to persist conversation message");
    }
}

/// Extracts declared outputs from generated text by matching `Name: value`
/// lines (display name or machine name, case-insensitive).
///
/// Returns `None` when no declared output matched at all.
pub(crate) fn extract_labeled_outputs(
    step: &StepDefinition,
    text: &str,
) -> Option<HashMap<String, Value>> {
    let mut outputs = HashMap::new();
    for field in &step.expected_outputs {
        let mut labels = vec![field.name.as_str()];
        if let Some(display) = &field.display_name {
            labels.push(display.as_str());
        }
        for label in labels {
            let pattern = format!(r"(?im)^\s*{}\s*:\s*(.+)$", regex::escape(label));
            let Ok(re) = Regex::new(&pattern) else { continue };
            if let Some(captures) = re.captures(text)
                && let Some(value) = captures.get(1)
            {
                outputs
                    .insert(field.name.clone(), Value::String(value.as_str().trim().to_string()));
                break;
            }
        }
    }
    if outputs.is_empty() { None } else { Some(outputs) }
}

/// A pluggable algorithm that executes one step under a resource budget.
#[async_trait]
pub trait ExecutionStrategy: Send + Sync {
    /// The execution kind this strategy implements.
    fn kind(&self) -> StepExecutionKind;

    /// Heuristic applicability check, used only as a last-resort dispatch
    /// fallback. Explicit step configuration always wins.
    fn can_handle(&self, step: &StepDefinition) -> bool;

    /// Executes the step. Never returns `Err`: failures become
    /// `success: false` results with the partial spend accounted.
    async fn execute(&self, deps: StrategyDeps<'_>) -> StepExecutionResult;
}

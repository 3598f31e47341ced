//! Per-step execution context handed to a strategy.

use crate::run::routine::StepDefinition;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// Resource budget for one step execution.
///
/// Limits are what REMAINS for the step, not the run-wide totals: the engine
/// subtracts spend already accounted to earlier steps before building the
/// context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionLimits {
    /// Maximum credits the step may consume.
    pub max_credits: u64,
    /// Maximum tool calls the step may make.
    pub max_tool_calls: u32,
    /// Maximum wall-clock time for the step.
    pub max_time: Duration,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self { max_credits: 100, max_tool_calls: 20, max_time: Duration::from_secs(300) }
    }
}

/// Everything a strategy needs to know about the step it is executing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Owning run identifier.
    pub run_id: String,
    /// Routine the step belongs to.
    pub routine_id: String,
    /// Conversation used for message persistence.
    pub conversation_id: String,
    /// The step being executed.
    pub step: StepDefinition,
    /// Resolved input values (declared inputs merged over run variables).
    pub io_inputs: HashMap<String, Value>,
    /// Caller-supplied opaque payload, threaded through unchanged.
    pub user_data: Value,
    /// Remaining resource budget.
    pub limits: ExecutionLimits,
}

impl ExecutionContext {
    /// Creates a context for one step.
    pub fn new(
        run_id: impl Into<String>,
        routine_id: impl Into<String>,
        step: StepDefinition,
        limits: ExecutionLimits,
    ) -> Self {
        let run_id = run_id.into();
        let conversation_id = format!("{run_id}:{}", step.id);
        Self {
            run_id,
            routine_id: routine_id.into(),
            conversation_id,
            step,
            io_inputs: HashMap::new(),
            user_data: Value::Null,
            limits,
        }
    }

    /// Sets the resolved inputs.
    #[must_use]
    pub fn with_inputs(mut self, inputs: HashMap<String, Value>) -> Self {
        self.io_inputs = inputs;
        self
    }

    /// Sets the opaque caller payload.
    #[must_use]
    pub fn with_user_data(mut self, user_data: Value) -> Self {
        self.user_data = user_data;
        self
    }

    /// Renders the resolved inputs as prompt-ready lines, sorted for
    /// deterministic prompts.
    pub fn render_inputs(&self) -> String {
        let mut entries: Vec<_> = self.io_inputs.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries
            .iter()
            .map(|(name, value)| match value {
                Value::String(s) => format!("- {name}: {s}"),
                other => format!("- {name}: {other}"),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_conversation_id_derived_from_run_and_step() {
        let step = StepDefinition::new("step-1", "Step");
        let ctx = ExecutionContext::new("run-1", "routine-1", step, ExecutionLimits::default());
        assert_eq!(ctx.conversation_id, "run-1:step-1");
    }

    #[test]
    fn test_render_inputs_is_sorted_and_unquoted() {
        let step = StepDefinition::new("step-1", "Step");
        let ctx = ExecutionContext::new("run-1", "routine-1", step, ExecutionLimits::default())
            .with_inputs(HashMap::from([
                ("b_topic".to_string(), json!("rust")),
                ("a_count".to_string(), json!(3)),
            ]));
        assert_eq!(ctx.render_inputs(), "- a_count: 3\n- b_topic: rust");
    }
}

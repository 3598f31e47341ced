//! Single-shot deterministic step execution.
//!
//! One invocation, no loop, no refinement. This is the dispatch fallback for
//! steps that declare no execution kind.

use super::{
    ExecutionContext, ExecutionStrategy, StepError, StepExecutionKind, StepExecutionResult,
    StrategyDeps, extract_labeled_outputs, persist_message, step_error_from_invocation,
};
use crate::run::routine::StepDefinition;
use async_trait::async_trait;
use relay_abstraction::{ChatMessage, InvocationBudget, InvocationRequest};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Instant;
use tracing::debug;

const DEFAULT_MAX_TOKENS: u32 = 2048;

/// Strategy that executes a step as a single model invocation.
#[derive(Debug, Default)]
pub struct DeterministicStrategy;

impl DeterministicStrategy {
    /// Creates the strategy.
    pub fn new() -> Self {
        Self
    }
}

fn build_prompt(context: &ExecutionContext) -> String {
    let step = &context.step;
    let mut sections = vec![format!("Task: {}", step.name)];
    if !step.description.is_empty() {
        sections.push(step.description.clone());
    }
    let inputs = context.render_inputs();
    if !inputs.is_empty() {
        sections.push(format!("Inputs:\n{inputs}"));
    }
    if !step.expected_outputs.is_empty() {
        let names: Vec<_> = step.expected_outputs.iter().map(|f| f.name.as_str()).collect();
        sections.push(format!(
            "Produce the following outputs, one per line as `name: value`: {}",
            names.join(", ")
        ));
    }
    sections.join("\n\n")
}

fn outputs_from_content(step: &StepDefinition, content: &str) -> HashMap<String, Value> {
    match step.expected_outputs.len() {
        0 => HashMap::from([("result".to_string(), Value::String(content.to_string()))]),
        1 => HashMap::from([(
            step.expected_outputs[0].name.clone(),
            Value::String(content.to_string()),
        )]),
        _ => extract_labeled_outputs(step, content).unwrap_or_else(|| {
            // Nothing matched; hand the whole response to the first output.
            HashMap::from([(
                step.expected_outputs[0].name.clone(),
                Value::String(content.to_string()),
            )])
        }),
    }
}

#[async_trait]
impl ExecutionStrategy for DeterministicStrategy {
    fn kind(&self) -> StepExecutionKind {
        StepExecutionKind::Deterministic
    }

    fn can_handle(&self, _step: &StepDefinition) -> bool {
        true
    }

    async fn execute(&self, deps: StrategyDeps<'_>) -> StepExecutionResult {
        let started = Instant::now();
        let context = deps.context;
        debug!(
            run_id = %context.run_id,
            step_id = %context.step.id,
            "Executing deterministic step"
        );

        if deps.cancel.is_cancelled() {
            return StepExecutionResult::failure(
                StepError::cancelled(),
                0,
                started.elapsed(),
                0,
                Vec::new(),
            );
        }

        let budget = InvocationBudget::new(
            context.limits.max_credits,
            DEFAULT_MAX_TOKENS,
            context.limits.max_time.as_millis() as u64,
        );
        let mut request = InvocationRequest::new(build_prompt(context), budget);
        if let Some(instructions) = &context.step.instructions {
            request = request.with_system_message(instructions.clone());
        }
        let user_message = ChatMessage::user(request.prompt.clone());

        let response = tokio::select! {
            () = deps.cancel.cancelled() => {
                return StepExecutionResult::failure(
                    StepError::cancelled(),
                    0,
                    started.elapsed(),
                    0,
                    Vec::new(),
                );
            }
            outcome = tokio::time::timeout(context.limits.max_time, deps.invoker.invoke(request)) => {
                match outcome {
                    Err(_) => {
                        return StepExecutionResult::failure(
                            StepError::timeout(started.elapsed()),
                            0,
                            started.elapsed(),
                            0,
                            Vec::new(),
                        );
                    }
                    Ok(Err(err)) => {
                        return StepExecutionResult::failure(
                            step_error_from_invocation(&err),
                            0,
                            started.elapsed(),
                            0,
                            Vec::new(),
                        );
                    }
                    Ok(Ok(response)) => response,
                }
            }
        };

        let assistant = ChatMessage::assistant(response.content.clone());
        persist_message(&deps.messages, &context.conversation_id, &user_message).await;
        persist_message(&deps.messages, &context.conversation_id, &assistant).await;

        let outputs = outputs_from_content(&context.step, &response.content);
        StepExecutionResult::success(
            outputs,
            response.credits_used,
            started.elapsed(),
            response.tool_calls,
            vec![user_message, assistant],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::routine::OutputField;
    use crate::strategy::ExecutionLimits;
    use relay_abstraction::InvocationError;
    use relay_abstraction::mock::MockInvoker;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    struct NullStore;

    #[async_trait]
    impl relay_abstraction::MessageStore for NullStore {
        async fn add_message(
            &self,
            _conversation_id: &str,
            _message: ChatMessage,
        ) -> Result<(), relay_abstraction::MessageStoreError> {
            Ok(())
        }
    }

    fn deps_for<'a>(
        context: &'a ExecutionContext,
        invoker: Arc<MockInvoker>,
    ) -> StrategyDeps<'a> {
        StrategyDeps {
            context,
            invoker,
            messages: Arc::new(NullStore),
            validator: None,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_single_output_receives_full_content() {
        let step = StepDefinition::new("s1", "Summarize")
            .with_output(OutputField::untyped("summary"));
        let context =
            ExecutionContext::new("run-1", "routine-1", step, ExecutionLimits::default());
        let invoker = Arc::new(MockInvoker::new().with_response("A short summary.", 7));

        let result = DeterministicStrategy::new().execute(deps_for(&context, invoker)).await;

        assert!(result.success);
        assert_eq!(result.outputs["summary"], "A short summary.");
        assert_eq!(result.credits_used, 7);
        assert_eq!(result.messages.len(), 2);
    }

    #[tokio::test]
    async fn test_invocation_error_becomes_failed_result() {
        let step = StepDefinition::new("s1", "Summarize");
        let context =
            ExecutionContext::new("run-1", "routine-1", step, ExecutionLimits::default());
        let invoker = Arc::new(
            MockInvoker::new()
                .with_failure(InvocationError::Transport("connection reset".to_string())),
        );

        let result = DeterministicStrategy::new().execute(deps_for(&context, invoker)).await;

        assert!(!result.success);
        let error = result.error.unwrap();
        assert_eq!(error.code, "TRANSPORT_FAILED");
    }

    #[tokio::test]
    async fn test_cancelled_before_start_spends_nothing() {
        let step = StepDefinition::new("s1", "Summarize");
        let context =
            ExecutionContext::new("run-1", "routine-1", step, ExecutionLimits::default());
        let invoker = Arc::new(MockInvoker::new());
        let mut deps = deps_for(&context, invoker.clone());
        deps.cancel.cancel();

        let result = DeterministicStrategy::new().execute(deps).await;

        assert!(!result.success);
        assert_eq!(result.error.unwrap().code, "CANCELLED");
        assert_eq!(result.credits_used, 0);
        assert_eq!(invoker.call_count(), 0);
    }

    #[tokio::test]
    async fn test_multi_output_labeled_extraction() {
        let step = StepDefinition::new("s1", "Classify")
            .with_output(OutputField::untyped("label"))
            .with_output(OutputField::untyped("confidence"));
        let context =
            ExecutionContext::new("run-1", "routine-1", step, ExecutionLimits::default());
        let invoker =
            Arc::new(MockInvoker::new().with_response("label: spam\nconfidence: high", 3));

        let result = DeterministicStrategy::new().execute(deps_for(&context, invoker)).await;

        assert!(result.success);
        assert_eq!(result.outputs["label"], "spam");
        assert_eq!(result.outputs["confidence"], "high");
    }
}

//! Bounded multi-turn conversational step execution.
//!
//! The conversation is capped at [`MAX_CONVERSATION_TURNS`] turns. The step
//! budget is split evenly across the turn cap with integer division, floored
//! at one credit and one tool call per turn, so a tight budget still allows
//! every turn a non-zero allowance. Cumulative limits are checked before each
//! turn; a turn that spends past its tool-call share fails the step. Task
//! instructions ride on every request's system message, while the prompt
//! replays only the trailing user/assistant turns.

use super::{
    ExecutionContext, ExecutionStrategy, StepError, StepExecutionKind, StepExecutionResult,
    StrategyDeps, extract_labeled_outputs, persist_message, step_error_from_invocation,
};
use crate::run::routine::StepDefinition;
use async_trait::async_trait;
use relay_abstraction::{ChatMessage, InvocationBudget, InvocationRequest, MessageRole};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// Hard cap on conversation turns.
pub const MAX_CONVERSATION_TURNS: u32 = 10;
/// Wall-clock ceiling for a single turn.
pub const TURN_TIMEOUT_MS: u64 = 60_000;
/// How many trailing messages are replayed into each turn's prompt.
pub const CONVERSATION_CONTEXT_WINDOW: usize = 5;

const TURN_MAX_TOKENS: u32 = 1024;

/// Phrases in an assistant turn that terminate the conversation.
const COMPLETION_PHRASES: &[&str] =
    &["task completed", "task complete", "all done", "conversation complete", "nothing further"];

const HEURISTIC_KEYWORDS: &[&str] =
    &["chat", "discuss", "conversation", "negotiate", "interview", "brainstorm", "tutor"];

const CONVERSATIONAL_SUBTYPES: &[&str] = &["discussion", "chat", "support", "interview"];

/// Splits a total budget evenly across the turn cap, flooring at one unit.
fn per_turn_share(total: u64, turns: u32) -> u64 {
    (total / u64::from(turns)).max(1)
}

/// Strategy that executes a step as a bounded dialogue.
#[derive(Debug, Default)]
pub struct ConversationalStrategy;

impl ConversationalStrategy {
    /// Creates the strategy.
    pub fn new() -> Self {
        Self
    }
}

fn system_message(context: &ExecutionContext) -> String {
    let step = &context.step;
    let mut sections = vec![format!(
        "You are working through a conversational task: {}. Say \"task completed\" once \
         nothing further is needed.",
        step.name
    )];
    if !step.description.is_empty() {
        sections.push(step.description.clone());
    }
    if let Some(instructions) = &step.instructions {
        sections.push(instructions.clone());
    }
    if !step.expected_outputs.is_empty() {
        let names: Vec<_> = step.expected_outputs.iter().map(|f| f.name.as_str()).collect();
        sections.push(format!(
            "Before finishing, state each of these on its own line as `name: value`: {}",
            names.join(", ")
        ));
    }
    sections.join("\n\n")
}

fn seed_message(context: &ExecutionContext) -> String {
    for key in ["message", "prompt", "question"] {
        if let Some(Value::String(text)) = context.io_inputs.get(key) {
            return text.clone();
        }
    }
    "Begin working on the task.".to_string()
}

fn render_window(messages: &[ChatMessage]) -> String {
    // The system message travels on the request, not in the window.
    let turns: Vec<&ChatMessage> =
        messages.iter().filter(|m| m.role != MessageRole::System).collect();
    let start = turns.len().saturating_sub(CONVERSATION_CONTEXT_WINDOW);
    turns[start..]
        .iter()
        .map(|m| {
            let role = if m.role == MessageRole::Assistant { "assistant" } else { "user" };
            format!("{role}: {}", m.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn mentions_all_outputs(step: &StepDefinition, content: &str) -> bool {
    if step.expected_outputs.is_empty() {
        return false;
    }
    let lowered = content.to_lowercase();
    step.expected_outputs.iter().all(|field| {
        lowered.contains(&field.name.to_lowercase())
            || field
                .display_name
                .as_ref()
                .is_some_and(|d| lowered.contains(&d.to_lowercase()))
    })
}

/// Extracts outputs from the conversation transcript.
///
/// With several declared outputs, the last three assistant turns are scanned
/// newest-first for `name: value` lines; with one (or none) the joined
/// assistant transcript is the value.
fn extract_outputs(step: &StepDefinition, messages: &[ChatMessage]) -> HashMap<String, Value> {
    let assistant: Vec<&ChatMessage> =
        messages.iter().filter(|m| m.role == MessageRole::Assistant).collect();
    let transcript =
        assistant.iter().map(|m| m.content.as_str()).collect::<Vec<_>>().join("\n");

    match step.expected_outputs.len() {
        0 => HashMap::from([("result".to_string(), Value::String(transcript))]),
        1 => HashMap::from([(step.expected_outputs[0].name.clone(), Value::String(transcript))]),
        _ => {
            let mut outputs = HashMap::new();
            for message in assistant.iter().rev().take(3) {
                if let Some(found) = extract_labeled_outputs(step, &message.content) {
                    for (name, value) in found {
                        outputs.entry(name).or_insert(value);
                    }
                }
                if outputs.len() == step.expected_outputs.len() {
                    break;
                }
            }
            if outputs.is_empty() {
                outputs.insert(
                    step.expected_outputs[0].name.clone(),
                    Value::String(transcript),
                );
            }
            outputs
        }
    }
}

#[async_trait]
impl ExecutionStrategy for ConversationalStrategy {
    fn kind(&self) -> StepExecutionKind {
        StepExecutionKind::Conversational
    }

    fn can_handle(&self, step: &StepDefinition) -> bool {
        if step.kind == Some(StepExecutionKind::Conversational) {
            return true;
        }
        if step
            .subtype
            .as_ref()
            .is_some_and(|s| CONVERSATIONAL_SUBTYPES.contains(&s.to_lowercase().as_str()))
        {
            return true;
        }
        let haystack = format!("{} {}", step.name, step.description).to_lowercase();
        HEURISTIC_KEYWORDS.iter().any(|kw| haystack.contains(kw))
    }

    async fn execute(&self, deps: StrategyDeps<'_>) -> StepExecutionResult {
        let started = Instant::now();
        let context = deps.context;
        let limits = &context.limits;
        debug!(
            run_id = %context.run_id,
            step_id = %context.step.id,
            "Executing conversational step"
        );

        let turn_credits = per_turn_share(limits.max_credits, MAX_CONVERSATION_TURNS);
        let turn_tool_calls =
            per_turn_share(u64::from(limits.max_tool_calls), MAX_CONVERSATION_TURNS);

        let mut messages: Vec<ChatMessage> = Vec::new();
        let mut credits_used: u64 = 0;
        let mut tool_calls: u32 = 0;

        let system_prompt = system_message(context);
        let system = ChatMessage::system(system_prompt.clone());
        persist_message(&deps.messages, &context.conversation_id, &system).await;
        messages.push(system);

        let seed = ChatMessage::user(seed_message(context));
        persist_message(&deps.messages, &context.conversation_id, &seed).await;
        messages.push(seed);

        let mut turns: u32 = 0;
        let mut terminated_by = "turn_limit";

        while turns < MAX_CONVERSATION_TURNS {
            if deps.cancel.is_cancelled() {
                return StepExecutionResult::failure(
                    StepError::cancelled(),
                    credits_used,
                    started.elapsed(),
                    tool_calls,
                    messages,
                );
            }
            let elapsed = started.elapsed();
            if elapsed >= limits.max_time {
                return StepExecutionResult::failure(
                    StepError::timeout(elapsed),
                    credits_used,
                    started.elapsed(),
                    tool_calls,
                    messages,
                );
            }
            if credits_used >= limits.max_credits {
                return StepExecutionResult::failure(
                    StepError::credit_exhausted(credits_used, limits.max_credits),
                    credits_used,
                    started.elapsed(),
                    tool_calls,
                    messages,
                );
            }

            let remaining_time = limits.max_time - elapsed;
            let turn_timeout = remaining_time.min(Duration::from_millis(TURN_TIMEOUT_MS));
            let budget = InvocationBudget::new(
                turn_credits.min(limits.max_credits - credits_used),
                TURN_MAX_TOKENS,
                turn_timeout.as_millis() as u64,
            );
            let request = InvocationRequest::new(render_window(&messages), budget)
                .with_system_message(system_prompt.clone());

            let response = tokio::select! {
                () = deps.cancel.cancelled() => {
                    return StepExecutionResult::failure(
                        StepError::cancelled(),
                        credits_used,
                        started.elapsed(),
                        tool_calls,
                        messages,
                    );
                }
                outcome = tokio::time::timeout(turn_timeout, deps.invoker.invoke(request)) => {
                    match outcome {
                        Err(_) => {
                            return StepExecutionResult::failure(
                                StepError::timeout(started.elapsed()),
                                credits_used,
                                started.elapsed(),
                                tool_calls,
                                messages,
                            );
                        }
                        Ok(Err(err)) => {
                            return StepExecutionResult::failure(
                                step_error_from_invocation(&err),
                                credits_used,
                                started.elapsed(),
                                tool_calls,
                                messages,
                            );
                        }
                        Ok(Ok(response)) => response,
                    }
                }
            };

            turns += 1;
            credits_used += response.credits_used;
            tool_calls += response.tool_calls;

            let assistant = ChatMessage::assistant(response.content.clone());
            persist_message(&deps.messages, &context.conversation_id, &assistant).await;
            messages.push(assistant);

            if u64::from(response.tool_calls) > turn_tool_calls {
                return StepExecutionResult::failure(
                    StepError::new(
                        "TOOL_CALLS_EXHAUSTED",
                        format!(
                            "Turn {turns} exceeded its tool-call share: {}/{turn_tool_calls}",
                            response.tool_calls
                        ),
                    ),
                    credits_used,
                    started.elapsed(),
                    tool_calls,
                    messages,
                );
            }

            let lowered = response.content.to_lowercase();
            if COMPLETION_PHRASES.iter().any(|p| lowered.contains(p)) {
                terminated_by = "completion_phrase";
                break;
            }
            // Outputs showing up in the answer only counts as done once the
            // dialogue has actually gone back and forth.
            if turns >= 2 && mentions_all_outputs(&context.step, &response.content) {
                terminated_by = "outputs_mentioned";
                break;
            }
            if tool_calls >= limits.max_tool_calls {
                return StepExecutionResult::failure(
                    StepError::new(
                        "TOOL_CALLS_EXHAUSTED",
                        format!(
                            "Tool call budget exhausted: {tool_calls}/{}",
                            limits.max_tool_calls
                        ),
                    ),
                    credits_used,
                    started.elapsed(),
                    tool_calls,
                    messages,
                );
            }

            if turns < MAX_CONVERSATION_TURNS {
                let follow_up =
                    ChatMessage::user("Continue. Address anything still unresolved.".to_string());
                persist_message(&deps.messages, &context.conversation_id, &follow_up).await;
                messages.push(follow_up);
            }
        }

        let outputs = extract_outputs(&context.step, &messages);
        StepExecutionResult::success(
            outputs,
            credits_used,
            started.elapsed(),
            tool_calls,
            messages,
        )
        .with_metadata(json!({ "turns": turns, "terminated_by": terminated_by }))
    }
}

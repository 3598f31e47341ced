//! Four-phase step execution: analyze, plan, execute, refine.
//!
//! Each phase is one model invocation. Before a phase starts, the strategy
//! checks cancellation, the time budget, and whether the phase's estimated
//! credit cost still fits the remaining budget; actual spend is accounted
//! from the invocation response afterwards. The refine phase only runs when a
//! validator is present and rejects the execute output, and performs at most
//! one corrective rewrite; whether it ran is reported as `refined` in the
//! step metadata.

use super::{
    ExecutionContext, ExecutionStrategy, StepError, StepExecutionKind, StepExecutionResult,
    StrategyDeps, extract_labeled_outputs, persist_message, step_error_from_invocation,
};
use crate::run::routine::{OutputFieldType, StepDefinition};
use async_trait::async_trait;
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use relay_abstraction::{ChatMessage, InvocationBudget, InvocationRequest};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::time::Instant;
use tracing::debug;

const ANALYZE_MAX_TOKENS: u32 = 1024;
const PLAN_MAX_TOKENS: u32 = 1024;
const EXECUTE_MAX_TOKENS: u32 = 4096;
const REFINE_MAX_TOKENS: u32 = 2048;

/// Estimated credit cost per phase, used for the pre-phase budget check.
const ANALYZE_CREDIT_ESTIMATE: u64 = 5;
const PLAN_CREDIT_ESTIMATE: u64 = 5;
const EXECUTE_CREDIT_ESTIMATE: u64 = 20;
const REFINE_CREDIT_ESTIMATE: u64 = 10;

const HEURISTIC_KEYWORDS: &[&str] =
    &["analyze", "analysis", "research", "evaluate", "assess", "investigate", "reason"];

static INTEGER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[-+]?\d+").unwrap());
static NUMBER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[-+]?\d+(?:\.\d+)?").unwrap());
static TRUE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(true|yes|confirmed|correct|passed)\b").unwrap());
static FALSE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(false|no|denied|incorrect|failed)\b").unwrap());

/// Strategy that decomposes a step into analyze, plan, execute, and refine
/// invocations.
#[derive(Debug, Default)]
pub struct FourPhaseStrategy;

impl FourPhaseStrategy {
    /// Creates the strategy.
    pub fn new() -> Self {
        Self
    }
}

struct PhaseState {
    started: Instant,
    credits_used: u64,
    tool_calls: u32,
    messages: Vec<ChatMessage>,
}

impl PhaseState {
    fn new() -> Self {
        Self { started: Instant::now(), credits_used: 0, tool_calls: 0, messages: Vec::new() }
    }
}

fn sniff_boolean(text: &str) -> Option<bool> {
    let lowered = text.to_lowercase();
    let positive = TRUE_RE.find(&lowered).map(|m| m.start());
    let negative = FALSE_RE.find(&lowered).map(|m| m.start());
    match (positive, negative) {
        (Some(p), Some(n)) => Some(p <= n),
        (Some(_), None) => Some(true),
        (None, Some(_)) => Some(false),
        (None, None) => None,
    }
}

fn coerce_value(field_type: OutputFieldType, text: &str) -> Option<Value> {
    match field_type {
        OutputFieldType::Boolean => sniff_boolean(text).map(Value::Bool),
        OutputFieldType::Integer => INTEGER_RE
            .find(text)
            .and_then(|m| m.as_str().parse::<i64>().ok())
            .map(Value::from),
        OutputFieldType::Number => NUMBER_RE
            .find(text)
            .and_then(|m| m.as_str().parse::<f64>().ok())
            .map(Value::from),
        OutputFieldType::Text => Some(Value::String(text.trim().to_string())),
    }
}

/// Builds the step outputs from the final text.
///
/// Declared outputs are coerced to their declared types; a field whose value
/// cannot be coerced is set to null and its name reported back so the caller
/// can flag it. Steps with no declared outputs get the raw text plus the
/// analysis as reasoning.
fn build_outputs(
    step: &StepDefinition,
    final_text: &str,
    analysis: &str,
) -> (HashMap<String, Value>, Vec<String>) {
    if step.expected_outputs.is_empty() {
        let outputs = HashMap::from([
            ("result".to_string(), Value::String(final_text.to_string())),
            ("reasoning".to_string(), Value::String(analysis.to_string())),
            ("timestamp".to_string(), Value::String(Utc::now().to_rfc3339())),
        ]);
        return (outputs, Vec::new());
    }

    let labeled = extract_labeled_outputs(step, final_text).unwrap_or_default();
    let mut outputs = HashMap::new();
    let mut failed = Vec::new();
    for field in &step.expected_outputs {
        let source = match labeled.get(&field.name) {
            Some(Value::String(s)) => s.clone(),
            _ => final_text.to_string(),
        };
        let value = match field.field_type {
            None => Value::String(source),
            Some(field_type) => match coerce_value(field_type, &source) {
                Some(value) => value,
                None => {
                    failed.push(field.name.clone());
                    Value::Null
                }
            },
        };
        outputs.insert(field.name.clone(), value);
    }
    (outputs, failed)
}

fn task_brief(context: &ExecutionContext) -> String {
    let step = &context.step;
    let mut sections = vec![format!("Task: {}", step.name)];
    if !step.description.is_empty() {
        sections.push(step.description.clone());
    }
    let inputs = context.render_inputs();
    if !inputs.is_empty() {
        sections.push(format!("Inputs:\n{inputs}"));
    }
    sections.join("\n\n")
}

fn output_instruction(step: &StepDefinition) -> String {
    if step.expected_outputs.is_empty() {
        return String::new();
    }
    let names: Vec<_> = step.expected_outputs.iter().map(|f| f.name.as_str()).collect();
    format!("\n\nReport each result on its own line as `name: value`: {}", names.join(", "))
}

impl FourPhaseStrategy {
    async fn run_phase(
        &self,
        deps: &StrategyDeps<'_>,
        state: &mut PhaseState,
        phase: &str,
        credit_estimate: u64,
        max_tokens: u32,
        prompt: String,
    ) -> Result<String, StepError> {
        let limits = &deps.context.limits;
        if deps.cancel.is_cancelled() {
            return Err(StepError::cancelled());
        }
        let elapsed = state.started.elapsed();
        if elapsed >= limits.max_time {
            return Err(StepError::timeout(elapsed));
        }
        if state.credits_used + credit_estimate > limits.max_credits {
            return Err(StepError::credit_exhausted(state.credits_used, limits.max_credits));
        }

        let remaining = limits.max_time - elapsed;
        let budget = InvocationBudget::new(
            limits.max_credits - state.credits_used,
            max_tokens,
            remaining.as_millis() as u64,
        );
        let mut request = InvocationRequest::new(prompt, budget);
        if let Some(instructions) = &deps.context.step.instructions {
            request = request.with_system_message(instructions.clone());
        }

        let user_message = ChatMessage::user(request.prompt.clone());
        persist_message(&deps.messages, &deps.context.conversation_id, &user_message).await;
        state.messages.push(user_message);

        let response = tokio::select! {
            () = deps.cancel.cancelled() => return Err(StepError::cancelled()),
            outcome = tokio::time::timeout(remaining, deps.invoker.invoke(request)) => {
                match outcome {
                    Err(_) => return Err(StepError::timeout(state.started.elapsed())),
                    Ok(Err(err)) => return Err(step_error_from_invocation(&err)),
                    Ok(Ok(response)) => response,
                }
            }
        };

        state.credits_used += response.credits_used;
        state.tool_calls += response.tool_calls;
        debug!(
            step_id = %deps.context.step.id,
            phase,
            credits_used = state.credits_used,
            "Phase completed"
        );

        let assistant = ChatMessage::assistant(response.content.clone());
        persist_message(&deps.messages, &deps.context.conversation_id, &assistant).await;
        state.messages.push(assistant);
        Ok(response.content)
    }

    async fn run_pipeline(
        &self,
        deps: &StrategyDeps<'_>,
        state: &mut PhaseState,
    ) -> Result<(HashMap<String, Value>, Value), StepError> {
        let context = deps.context;

        let analysis = self
            .run_phase(
                deps,
                state,
                "analyze",
                ANALYZE_CREDIT_ESTIMATE,
                ANALYZE_MAX_TOKENS,
                format!(
                    "Analyze the following task. Identify what is being asked, the key \
                     constraints, and any ambiguities.\n\n{}",
                    task_brief(context)
                ),
            )
            .await?;

        let plan = self
            .run_phase(
                deps,
                state,
                "plan",
                PLAN_CREDIT_ESTIMATE,
                PLAN_MAX_TOKENS,
                format!(
                    "Based on this analysis, produce a concise numbered plan for completing \
                     the task.\n\nAnalysis:\n{analysis}"
                ),
            )
            .await?;

        let mut final_text = self
            .run_phase(
                deps,
                state,
                "execute",
                EXECUTE_CREDIT_ESTIMATE,
                EXECUTE_MAX_TOKENS,
                format!(
                    "Carry out the plan and produce the final result.\n\n{}\n\nPlan:\n{plan}{}",
                    task_brief(context),
                    output_instruction(&context.step)
                ),
            )
            .await?;

        let mut metadata = serde_json::Map::new();
        metadata.insert("confidence".to_string(), json!(1.0));
        let mut refined = false;

        if let Some(validator) = &deps.validator {
            let candidate = json!(final_text);
            let results = validator.validate(&candidate, "default");
            let summary = validator.summarize(&results);
            if !summary.overall_passed {
                let suggestions = validator.suggest_improvements(&candidate, &results);
                final_text = self
                    .run_phase(
                        deps,
                        state,
                        "refine",
                        REFINE_CREDIT_ESTIMATE,
                        REFINE_MAX_TOKENS,
                        format!(
                            "The result below did not pass validation. Rewrite it, applying \
                             the suggested improvements.{}\n\nResult:\n{final_text}\n\n\
                             Improvements:\n- {}",
                            output_instruction(&context.step),
                            suggestions.join("\n- ")
                        ),
                    )
                    .await?;
                refined = true;
            }
            metadata.insert("confidence".to_string(), json!(summary.score));
            metadata.insert(
                "validation".to_string(),
                json!({
                    "score": summary.score,
                    "overall_passed": summary.overall_passed,
                    "corrected": refined,
                }),
            );
        }
        metadata.insert("refined".to_string(), json!(refined));

        let (outputs, failed) = build_outputs(&context.step, &final_text, &analysis);
        if !failed.is_empty() {
            metadata.insert("coercion_failed".to_string(), json!(failed));
        }
        Ok((outputs, Value::Object(metadata)))
    }
}

#[async_trait]
impl ExecutionStrategy for FourPhaseStrategy {
    fn kind(&self) -> StepExecutionKind {
        StepExecutionKind::FourPhase
    }

    fn can_handle(&self, step: &StepDefinition) -> bool {
        if step.kind == Some(StepExecutionKind::FourPhase) {
            return true;
        }
        let haystack = format!("{} {}", step.name, step.description).to_lowercase();
        HEURISTIC_KEYWORDS.iter().any(|kw| haystack.contains(kw))
    }

    async fn execute(&self, deps: StrategyDeps<'_>) -> StepExecutionResult {
        let mut state = PhaseState::new();
        debug!(
            run_id = %deps.context.run_id,
            step_id = %deps.context.step.id,
            "Executing four-phase step"
        );
        match self.run_pipeline(&deps, &mut state).await {
            Ok((outputs, metadata)) => StepExecutionResult::success(
                outputs,
                state.credits_used,
                state.started.elapsed(),
                state.tool_calls,
                std::mem::take(&mut state.messages),
            )
            .with_metadata(metadata),
            Err(error) => StepExecutionResult::failure(
                error,
                state.credits_used,
                state.started.elapsed(),
                state.tool_calls,
                std::mem::take(&mut state.messages),
            ),
        }
    }
}

//! The run driving loop.
//!
//! One coordinating task drives a run: it resolves the routine, walks the
//! node sequence, dispatches each step to a strategy with the *remaining*
//! budget, and folds results back into progress and context. Fork branches
//! may fan out into concurrent tasks, but branch tasks never touch the run
//! directly; they return outputs that only the coordinator merges. Branches
//! may themselves fork: each branch carries its own location stack, and a
//! nested fork that would push past the configured depth fails the branch
//! without invoking its steps.

use crate::error::RunError;
use crate::run::context::RunContext;
use crate::run::routine::{BranchDefinition, RoutineNode, RoutineSource, StepDefinition};
use crate::run::types::{
    BranchExecution, BranchState, Location, LocationStack, MAX_STEP_RETRIES, RecoveryStrategy,
    Run, RunState, StepState, StepStatus,
};
use crate::strategy::{ExecutionContext, ExecutionLimits, StrategyDeps, StrategyRegistry};
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use relay_abstraction::{MessageStore, ModelInvoker, RunStore, ValidationEngine};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Concurrency ceiling for parallel fork branches.
pub const MAX_PARALLEL_BRANCHES: usize = 4;

/// Tool-call allowance handed to each step.
const STEP_TOOL_CALLS: u32 = 20;

struct StepOutcome {
    status: StepStatus,
    outputs: HashMap<String, Value>,
    credits_used: u64,
    cancelled: bool,
}

struct BranchOutcome {
    index: usize,
    execution: BranchExecution,
    /// Executions of forks nested inside this branch, in creation order.
    nested: Vec<BranchExecution>,
    outputs: HashMap<String, Value>,
    credits_used: u64,
    completed: u32,
    failed: u32,
    skipped: u32,
    cancelled: bool,
}

/// Per-run parameters shared by every branch task.
#[derive(Clone, Copy)]
struct BranchEnv<'a> {
    run_id: &'a str,
    routine_id: &'a str,
    recovery: RecoveryStrategy,
    parallel: bool,
    max_depth: usize,
}

/// Drives runs to a terminal state.
pub struct RunEngine {
    registry: StrategyRegistry,
    routines: Arc<dyn RoutineSource>,
    invoker: Arc<dyn ModelInvoker>,
    messages: Arc<dyn MessageStore>,
    validator: Option<Arc<dyn ValidationEngine>>,
    store: Option<Arc<dyn RunStore>>,
}

impl RunEngine {
    /// Creates an engine over the given collaborators.
    pub fn new(
        registry: StrategyRegistry,
        routines: Arc<dyn RoutineSource>,
        invoker: Arc<dyn ModelInvoker>,
        messages: Arc<dyn MessageStore>,
    ) -> Self {
        Self { registry, routines, invoker, messages, validator: None, store: None }
    }

    /// Attaches a validation engine, consumed by the refine phase.
    #[must_use]
    pub fn with_validator(mut self, validator: Arc<dyn ValidationEngine>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Attaches a run store for checkpointing.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Drives the run until a terminal state or `Paused`.
    ///
    /// Valid from `Uninitialized` (fresh start) and `Paused` (resumption);
    /// the loop picks up at `progress.current_location`. Limit violations and
    /// unrecoverable failures terminate the run as `Failed`; cancellation
    /// terminates it as `Cancelled`. Both are normal outcomes, not errors.
    ///
    /// # Errors
    /// Returns `RunError::InvalidTransition` when the run is not startable
    /// and `RunError::RoutineResolution` when the routine cannot be resolved.
    /// Resolution runs first, so a resolution failure leaves the run in the
    /// state it was called with.
    pub async fn execute(
        &self,
        run: &mut Run,
        cancel: &CancellationToken,
    ) -> Result<RunState, RunError> {
        let routine = self.routines.resolve(&run.routine_id).await?;
        run.transition_to(RunState::Running)?;
        run.progress.total_steps = run.progress.total_steps.max(routine.leaf_step_count());
        info!(
            run_id = %run.id,
            routine_id = %run.routine_id,
            total_steps = run.progress.total_steps,
            "Run started"
        );

        let started = Instant::now();
        let mut steps_since_checkpoint: u32 = 0;
        let resume_index =
            run.progress.current_location.as_ref().map(|l| l.index).unwrap_or(0);

        for (index, node) in routine.nodes.iter().enumerate().skip(resume_index) {
            if cancel.is_cancelled() {
                return self.cancel_run(run).await;
            }
            if run.progress.settled_steps() >= run.config.max_steps {
                return self.fail_run(run, "Step limit exceeded".to_string()).await;
            }
            if started.elapsed() >= run.config.max_time {
                return self.fail_run(run, "Time limit exceeded".to_string()).await;
            }
            if run.progress.credits_used >= run.config.max_cost {
                return self
                    .fail_run(
                        run,
                        format!(
                            "Cost limit exceeded: {}/{}",
                            run.progress.credits_used, run.config.max_cost
                        ),
                    )
                    .await;
            }

            let node_id = match node {
                RoutineNode::Step(step) => step.id.clone(),
                RoutineNode::Fork { id, .. } => id.clone(),
            };
            run.progress.current_location =
                Some(Location::new(run.routine_id.as_str(), node_id, index));

            match node {
                RoutineNode::Step(step) => {
                    let limits = self.remaining_limits(run, started);
                    let inputs = resolve_inputs(&run.context, step);
                    let outcome = self
                        .drive_step(
                            &run.id,
                            &run.routine_id,
                            step,
                            limits,
                            inputs,
                            run.config.recovery_strategy,
                            cancel,
                        )
                        .await;
                    let cancelled = outcome.cancelled;
                    let aborted = outcome.status.state == StepState::Failed
                        && run.config.recovery_strategy == RecoveryStrategy::Abort;
                    self.fold_step(run, outcome);
                    if cancelled {
                        return self.cancel_run(run).await;
                    }
                    if aborted {
                        return self
                            .fail_run(run, format!("Step {} failed", step.id))
                            .await;
                    }
                }
                RoutineNode::Fork { id, branches } => {
                    if run.progress.location_stack.depth() + 1 > run.config.max_depth {
                        return self
                            .fail_run(run, "Depth limit exceeded".to_string())
                            .await;
                    }
                    run.progress
                        .location_stack
                        .push(Location::new(run.routine_id.as_str(), id.clone(), index));
                    let cancelled = self.drive_fork(run, id, branches, started, cancel).await;
                    run.progress.location_stack.pop();
                    if cancelled {
                        return self.cancel_run(run).await;
                    }
                    let fork_failed = run
                        .progress
                        .branches
                        .iter()
                        .any(|b| b.parent_step_id == *id && b.state == BranchState::Failed);
                    if fork_failed && run.config.recovery_strategy == RecoveryStrategy::Abort {
                        return self
                            .fail_run(run, format!("Branch under fork {id} failed"))
                            .await;
                    }
                }
            }

            steps_since_checkpoint += 1;
            if steps_since_checkpoint >= run.config.checkpoint_interval {
                self.checkpoint(run).await;
                steps_since_checkpoint = 0;
            }
        }

        let branch_failures =
            run.progress.branches.iter().filter(|b| b.state == BranchState::Failed).count();
        if run.progress.failed_steps > 0 || branch_failures > 0 {
            return self
                .fail_run(
                    run,
                    format!(
                        "{} step(s) and {} branch(es) failed",
                        run.progress.failed_steps, branch_failures
                    ),
                )
                .await;
        }

        run.transition_to(RunState::Completed)?;
        self.checkpoint(run).await;
        info!(
            run_id = %run.id,
            completed_steps = run.progress.completed_steps,
            credits_used = run.progress.credits_used,
            "Run completed"
        );
        Ok(RunState::Completed)
    }

    /// Suspends a running run and checkpoints it.
    ///
    /// # Errors
    /// Returns `RunError::InvalidTransition` unless the run is `Running`.
    pub async fn pause(&self, run: &mut Run) -> Result<(), RunError> {
        run.transition_to(RunState::Paused)?;
        self.checkpoint(run).await;
        info!(run_id = %run.id, "Run paused");
        Ok(())
    }

    fn remaining_limits(&self, run: &Run, started: Instant) -> ExecutionLimits {
        ExecutionLimits {
            max_credits: run.config.max_cost.saturating_sub(run.progress.credits_used),
            max_tool_calls: STEP_TOOL_CALLS,
            max_time: run.config.max_time.saturating_sub(started.elapsed()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive_step(
        &self,
        run_id: &str,
        routine_id: &str,
        step: &StepDefinition,
        limits: ExecutionLimits,
        inputs: HashMap<String, Value>,
        recovery: RecoveryStrategy,
        cancel: &CancellationToken,
    ) -> StepOutcome {
        let attempts = match recovery {
            RecoveryStrategy::Retry => MAX_STEP_RETRIES + 1,
            RecoveryStrategy::Skip | RecoveryStrategy::Abort => 1,
        };

        let mut status = StepStatus::pending(&step.id);
        status.start();
        let mut credits_used: u64 = 0;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let remaining = ExecutionLimits {
                max_credits: limits.max_credits.saturating_sub(credits_used),
                ..limits
            };
            let context = ExecutionContext::new(run_id, routine_id, step.clone(), remaining)
                .with_inputs(inputs.clone());
            let strategy = self.registry.resolve(step);
            let deps = StrategyDeps {
                context: &context,
                invoker: Arc::clone(&self.invoker),
                messages: Arc::clone(&self.messages),
                validator: self.validator.clone(),
                cancel: cancel.clone(),
            };

            let result = strategy.execute(deps).await;
            credits_used += result.credits_used;

            if result.success {
                let result_value =
                    serde_json::to_value(&result.outputs).unwrap_or(Value::Null);
                status.complete(result_value);
                return StepOutcome {
                    status,
                    outputs: result.outputs,
                    credits_used,
                    cancelled: false,
                };
            }

            let error = result.error.map(|e| e.message).unwrap_or_default();
            if cancel.is_cancelled() {
                status.fail(format!("Cancelled: {error}"));
                return StepOutcome {
                    status,
                    outputs: HashMap::new(),
                    credits_used,
                    cancelled: true,
                };
            }
            debug!(step_id = %step.id, attempt, error = %error, "Step attempt failed");
            last_error = error;
        }

        match recovery {
            RecoveryStrategy::Skip => status.skip(),
            RecoveryStrategy::Retry | RecoveryStrategy::Abort => status.fail(last_error),
        }
        StepOutcome { status, outputs: HashMap::new(), credits_used, cancelled: false }
    }

    fn fold_step(&self, run: &mut Run, outcome: StepOutcome) {
        run.progress.credits_used += outcome.credits_used;
        match outcome.status.state {
            StepState::Completed => run.progress.completed_steps += 1,
            StepState::Failed => run.progress.failed_steps += 1,
            StepState::Skipped => run.progress.skipped_steps += 1,
            StepState::Pending | StepState::Running => {}
        }
        for (name, value) in outcome.outputs {
            run.context.variables.insert(name, value);
        }
        run.progress.steps.push(outcome.status);
    }

    /// Drives all branches of one fork and merges the outcomes. Returns
    /// whether cancellation was observed.
    async fn drive_fork(
        &self,
        run: &mut Run,
        fork_id: &str,
        branches: &[BranchDefinition],
        started: Instant,
        cancel: &CancellationToken,
    ) -> bool {
        let limits = self.remaining_limits(run, started);
        let base_inputs = run.context.visible_variables();
        let env = BranchEnv {
            run_id: &run.id,
            routine_id: &run.routine_id,
            recovery: run.config.recovery_strategy,
            parallel: run.config.parallelization,
            max_depth: run.config.max_depth,
        };
        let stack = run.progress.location_stack.clone();

        let outcomes =
            self.drive_branch_set(env, branches, fork_id, limits, base_inputs, &stack, cancel).await;

        let mut cancelled = false;
        for outcome in outcomes {
            run.progress.credits_used += outcome.credits_used;
            run.progress.completed_steps += outcome.completed;
            run.progress.failed_steps += outcome.failed;
            run.progress.skipped_steps += outcome.skipped;
            cancelled |= outcome.cancelled;
            for (name, value) in outcome.outputs {
                run.context.variables.insert(name, value);
            }
            run.progress.branches.push(outcome.execution);
            run.progress.branches.extend(outcome.nested);
        }
        cancelled
    }

    /// Drives one set of sibling branches, concurrently when the run allows
    /// it, and returns their outcomes in creation order.
    #[allow(clippy::too_many_arguments)]
    async fn drive_branch_set(
        &self,
        env: BranchEnv<'_>,
        branches: &[BranchDefinition],
        fork_id: &str,
        limits: ExecutionLimits,
        base_inputs: HashMap<String, Value>,
        stack: &LocationStack,
        cancel: &CancellationToken,
    ) -> Vec<BranchOutcome> {
        let mut outcomes: Vec<BranchOutcome> = if env.parallel {
            let futures: Vec<_> = branches
                .iter()
                .enumerate()
                .map(|(index, branch)| {
                    self.drive_branch(
                        env,
                        index,
                        branch,
                        fork_id,
                        limits,
                        base_inputs.clone(),
                        stack,
                        cancel,
                    )
                })
                .collect();
            stream::iter(futures)
                .buffer_unordered(MAX_PARALLEL_BRANCHES)
                .collect()
                .await
        } else {
            let mut sequential = Vec::with_capacity(branches.len());
            for (index, branch) in branches.iter().enumerate() {
                sequential.push(
                    self.drive_branch(
                        env,
                        index,
                        branch,
                        fork_id,
                        limits,
                        base_inputs.clone(),
                        stack,
                        cancel,
                    )
                    .await,
                );
            }
            sequential
        };

        // Branch order in progress reflects creation order, not completion
        // order.
        outcomes.sort_by_key(|o| o.index);
        outcomes
    }

    /// Drives one branch node by node. Nested forks recurse through
    /// [`Self::drive_branch_set`] with a deeper location stack; the returned
    /// future is boxed to break the resulting cycle.
    #[allow(clippy::too_many_arguments)]
    fn drive_branch<'a>(
        &'a self,
        env: BranchEnv<'a>,
        index: usize,
        branch: &'a BranchDefinition,
        parent_step_id: &'a str,
        limits: ExecutionLimits,
        base_inputs: HashMap<String, Value>,
        stack: &'a LocationStack,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, BranchOutcome> {
        async move {
            let branch_id =
                if branch.id.is_empty() { Uuid::new_v4().to_string() } else { branch.id.clone() };
            let mut execution = BranchExecution::new(branch_id, parent_step_id, env.parallel);
            execution.state = BranchState::Running;

            let mut nested: Vec<BranchExecution> = Vec::new();
            let mut outputs: HashMap<String, Value> = HashMap::new();
            let mut credits_used: u64 = 0;
            let mut completed: u32 = 0;
            let mut failed: u32 = 0;
            let mut skipped: u32 = 0;
            let mut branch_failed = false;
            let mut cancelled = false;

            for (node_index, node) in branch.nodes.iter().enumerate() {
                let halted =
                    cancelled || (branch_failed && env.recovery == RecoveryStrategy::Abort);
                match node {
                    RoutineNode::Step(step) => {
                        if halted {
                            execution.steps.push(StepStatus::pending(&step.id));
                            continue;
                        }
                        let remaining = ExecutionLimits {
                            max_credits: limits.max_credits.saturating_sub(credits_used),
                            ..limits
                        };
                        // Within a branch, earlier node outputs feed later
                        // nodes.
                        let mut inputs = base_inputs.clone();
                        for (name, value) in &outputs {
                            inputs.insert(name.clone(), value.clone());
                        }

                        let outcome = self
                            .drive_step(
                                env.run_id,
                                env.routine_id,
                                step,
                                remaining,
                                inputs,
                                env.recovery,
                                cancel,
                            )
                            .await;
                        credits_used += outcome.credits_used;
                        cancelled |= outcome.cancelled;
                        match outcome.status.state {
                            StepState::Completed => completed += 1,
                            StepState::Failed => {
                                failed += 1;
                                branch_failed = true;
                            }
                            StepState::Skipped => skipped += 1,
                            StepState::Pending | StepState::Running => {}
                        }
                        for (name, value) in outcome.outputs {
                            outputs.insert(name, value);
                        }
                        execution.steps.push(outcome.status);
                    }
                    RoutineNode::Fork { id, branches } => {
                        if halted {
                            execution.steps.push(StepStatus::pending(id));
                            continue;
                        }
                        let mut status = StepStatus::pending(id);
                        status.start();
                        if stack.depth() + 1 > env.max_depth {
                            status.fail("Depth limit exceeded".to_string());
                            execution.steps.push(status);
                            branch_failed = true;
                            continue;
                        }

                        let mut deeper = stack.clone();
                        deeper.push(Location::new(env.routine_id, id.clone(), node_index));
                        let remaining = ExecutionLimits {
                            max_credits: limits.max_credits.saturating_sub(credits_used),
                            ..limits
                        };
                        let mut inputs = base_inputs.clone();
                        for (name, value) in &outputs {
                            inputs.insert(name.clone(), value.clone());
                        }

                        let sub = self
                            .drive_branch_set(env, branches, id, remaining, inputs, &deeper, cancel)
                            .await;
                        let mut fork_failed = false;
                        for outcome in sub {
                            credits_used += outcome.credits_used;
                            completed += outcome.completed;
                            failed += outcome.failed;
                            skipped += outcome.skipped;
                            cancelled |= outcome.cancelled;
                            fork_failed |= outcome.execution.state == BranchState::Failed;
                            for (name, value) in outcome.outputs {
                                outputs.insert(name, value);
                            }
                            nested.push(outcome.execution);
                            nested.extend(outcome.nested);
                        }

                        if fork_failed {
                            status.fail(format!("Branch under fork {id} failed"));
                            branch_failed = true;
                        } else if !cancelled {
                            status.complete(Value::Null);
                        }
                        execution.steps.push(status);
                    }
                }
            }

            execution.recompute_state(env.recovery);
            BranchOutcome {
                index,
                execution,
                nested,
                outputs,
                credits_used,
                completed,
                failed,
                skipped,
                cancelled,
            }
        }
        .boxed()
    }

    async fn fail_run(&self, run: &mut Run, message: String) -> Result<RunState, RunError> {
        warn!(run_id = %run.id, error = %message, "Run failed");
        run.error = Some(message);
        run.transition_to(RunState::Failed)?;
        self.checkpoint(run).await;
        Ok(RunState::Failed)
    }

    async fn cancel_run(&self, run: &mut Run) -> Result<RunState, RunError> {
        info!(run_id = %run.id, "Run cancelled");
        run.error = Some("Run cancelled".to_string());
        run.transition_to(RunState::Cancelled)?;
        self.checkpoint(run).await;
        Ok(RunState::Cancelled)
    }

    /// Persists a progress/context snapshot, best effort. A failing store
    /// never fails the run.
    async fn checkpoint(&self, run: &Run) {
        let Some(store) = &self.store else { return };
        let progress = match serde_json::to_value(&run.progress) {
            Ok(value) => value,
            Err(err) => {
                warn!(run_id = %run.id, error = %err, "Failed to serialize progress");
                return;
            }
        };
        let context = match serde_json::to_value(&run.context) {
            Ok(value) => value,
            Err(err) => {
                warn!(run_id = %run.id, error = %err, "Failed to serialize context");
                return;
            }
        };
        if let Err(err) = store.checkpoint(&run.id, progress, context).await {
            warn!(run_id = %run.id, error = %err, "Checkpoint failed");
        }
    }
}

/// Resolves step inputs: every variable visible from the active scope,
/// overridden by the step's declared inputs.
fn resolve_inputs(context: &RunContext, step: &StepDefinition) -> HashMap<String, Value> {
    let mut inputs = context.visible_variables();
    for (name, value) in &step.inputs {
        inputs.insert(name.clone(), value.clone());
    }
    inputs
}

//! Run data model: state machine, configuration, progress, and step status.

use crate::error::RunError;
use crate::run::context::RunContext;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

/// Retry attempts for a failed step under [`RecoveryStrategy::Retry`].
pub const MAX_STEP_RETRIES: u32 = 3;

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    /// Created but not started.
    Uninitialized,
    /// Actively being driven.
    Running,
    /// Suspended; the only state from which `Running` may be re-entered.
    Paused,
    /// All steps done, no failed branch. Terminal.
    Completed,
    /// Unrecoverable failure or exceeded limit. Terminal.
    Failed,
    /// Externally cancelled, distinct from `Failed`. Terminal.
    Cancelled,
}

impl RunState {
    /// Whether this state is final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether a transition to `next` is legal.
    pub fn can_transition_to(&self, next: RunState) -> bool {
        match self {
            Self::Uninitialized => next == Self::Running,
            Self::Running => matches!(
                next,
                Self::Completed | Self::Failed | Self::Paused | Self::Cancelled
            ),
            Self::Paused => matches!(next, Self::Running | Self::Cancelled),
            Self::Completed | Self::Failed | Self::Cancelled => false,
        }
    }
}

/// What the engine does with a failed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryStrategy {
    /// Re-attempt the step, up to [`MAX_STEP_RETRIES`] times.
    Retry,
    /// Mark the step skipped and continue.
    Skip,
    /// Fail the branch, and the run if the branch is top-level.
    Abort,
}

/// Per-run execution limits and behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Maximum settled (completed + failed + skipped) steps.
    pub max_steps: u32,
    /// Maximum location-stack depth.
    pub max_depth: usize,
    /// Wall-clock limit for the whole run.
    pub max_time: Duration,
    /// Credit limit for the whole run.
    pub max_cost: u64,
    /// Whether fork branches are driven concurrently.
    pub parallelization: bool,
    /// Checkpoint every N settled steps.
    pub checkpoint_interval: u32,
    /// Failure handling for steps.
    pub recovery_strategy: RecoveryStrategy,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_steps: 100,
            max_depth: 4,
            max_time: Duration::from_secs(3600),
            max_cost: 1000,
            parallelization: false,
            checkpoint_interval: 5,
            recovery_strategy: RecoveryStrategy::Retry,
        }
    }
}

/// A pointer to a specific node within a routine's step graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    /// Unique id of this location instance.
    pub id: String,
    /// Routine the node belongs to.
    pub routine_id: String,
    /// Node identifier within the routine.
    pub node_id: String,
    /// Node index in the routine's top-level sequence.
    pub index: usize,
}

impl Location {
    /// Creates a location with a fresh id.
    pub fn new(routine_id: impl Into<String>, node_id: impl Into<String>, index: usize) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            routine_id: routine_id.into(),
            node_id: node_id.into(),
            index,
        }
    }
}

/// Stack of locations, outermost first. Depth equals length and is bounded
/// by `RunConfig::max_depth`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationStack {
    /// Locations, outermost first.
    pub locations: Vec<Location>,
}

impl LocationStack {
    /// Current nesting depth.
    pub fn depth(&self) -> usize {
        self.locations.len()
    }

    /// Pushes a nested location.
    pub fn push(&mut self, location: Location) {
        self.locations.push(location);
    }

    /// Pops the innermost location.
    pub fn pop(&mut self) -> Option<Location> {
        self.locations.pop()
    }
}

/// Lifecycle state of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepState {
    /// Not yet started.
    Pending,
    /// In flight.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully.
    Failed,
    /// Skipped under [`RecoveryStrategy::Skip`].
    Skipped,
}

/// Status of one step within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepStatus {
    /// Step identifier.
    pub id: String,
    /// Current lifecycle state.
    pub state: StepState,
    /// When the step started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the step settled; only set on a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Step result; present only when `Completed`.
    pub result: Option<Value>,
    /// Failure description.
    pub error: Option<String>,
}

impl StepStatus {
    /// Creates a pending status.
    pub fn pending(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: StepState::Pending,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        }
    }

    /// Marks the step running.
    pub fn start(&mut self) {
        self.state = StepState::Running;
        self.started_at = Some(Utc::now());
    }

    /// Marks the step completed with its result.
    pub fn complete(&mut self, result: Value) {
        self.state = StepState::Completed;
        self.completed_at = Some(Utc::now());
        self.result = Some(result);
    }

    /// Marks the step failed.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.state = StepState::Failed;
        self.completed_at = Some(Utc::now());
        self.error = Some(error.into());
    }

    /// Marks the step skipped.
    pub fn skip(&mut self) {
        self.state = StepState::Skipped;
        self.completed_at = Some(Utc::now());
    }
}

/// Execution state of a branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BranchState {
    /// Not yet started.
    Pending,
    /// Steps in flight.
    Running,
    /// Every step settled successfully (completed or skipped).
    Completed,
    /// A step failed and the recovery strategy does not retry.
    Failed,
}

/// One concurrently forked sub-path of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchExecution {
    /// Branch identifier.
    pub id: String,
    /// The fork node this branch belongs to.
    pub parent_step_id: String,
    /// Statuses of the branch's steps, in order.
    pub steps: Vec<StepStatus>,
    /// Derived execution state.
    pub state: BranchState,
    /// Whether the branch ran concurrently with its siblings.
    pub parallel: bool,
}

impl BranchExecution {
    /// Creates a pending branch.
    pub fn new(id: impl Into<String>, parent_step_id: impl Into<String>, parallel: bool) -> Self {
        Self {
            id: id.into(),
            parent_step_id: parent_step_id.into(),
            steps: Vec::new(),
            state: BranchState::Pending,
            parallel,
        }
    }

    /// Recomputes the derived state from the step statuses.
    pub fn recompute_state(&mut self, recovery: RecoveryStrategy) {
        if self.steps.iter().any(|s| s.state == StepState::Failed)
            && recovery != RecoveryStrategy::Retry
        {
            self.state = BranchState::Failed;
        } else if !self.steps.is_empty()
            && self
                .steps
                .iter()
                .all(|s| matches!(s.state, StepState::Completed | StepState::Skipped))
        {
            self.state = BranchState::Completed;
        } else if self.steps.iter().any(|s| s.state == StepState::Failed) {
            // Retry recovery: retries are already exhausted by the time a
            // status lands here, so a remaining failure fails the branch.
            self.state = BranchState::Failed;
        } else if self.steps.iter().any(|s| s.state != StepState::Pending) {
            self.state = BranchState::Running;
        } else {
            self.state = BranchState::Pending;
        }
    }
}

/// Progress tracking for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunProgress {
    /// Total leaf steps; may grow for dynamically sized routines.
    pub total_steps: u32,
    /// Steps that completed.
    pub completed_steps: u32,
    /// Steps that failed.
    pub failed_steps: u32,
    /// Steps that were skipped.
    pub skipped_steps: u32,
    /// Credits consumed so far, failures included.
    pub credits_used: u64,
    /// The node the engine is currently evaluating.
    pub current_location: Option<Location>,
    /// Nesting of fork locations, outermost first.
    pub location_stack: LocationStack,
    /// Top-level step statuses, in execution order.
    pub steps: Vec<StepStatus>,
    /// Branch executions, in creation order.
    pub branches: Vec<BranchExecution>,
}

impl RunProgress {
    /// Steps that have settled (completed, failed, or skipped).
    pub fn settled_steps(&self) -> u32 {
        self.completed_steps + self.failed_steps + self.skipped_steps
    }
}

/// One execution instance of a routine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// Run identifier.
    pub id: String,
    /// The routine this run instantiates.
    pub routine_id: String,
    /// Lifecycle state.
    pub state: RunState,
    /// Execution limits and behavior.
    pub config: RunConfig,
    /// Progress tracking.
    pub progress: RunProgress,
    /// Variables, blackboard, and scopes.
    pub context: RunContext,
    /// Set when the run leaves `Uninitialized`.
    pub started_at: Option<DateTime<Utc>>,
    /// Set iff the state is terminal.
    pub completed_at: Option<DateTime<Utc>>,
    /// Human-readable failure description.
    pub error: Option<String>,
}

impl Run {
    /// Creates an uninitialized run with a fresh id.
    pub fn new(routine_id: impl Into<String>, config: RunConfig) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            routine_id: routine_id.into(),
            state: RunState::Uninitialized,
            config,
            progress: RunProgress::default(),
            context: RunContext::default(),
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    /// Transitions the run to `next`, maintaining the timestamp invariants.
    ///
    /// # Errors
    /// Returns [`RunError::InvalidTransition`] for an illegal transition.
    pub fn transition_to(&mut self, next: RunState) -> Result<(), RunError> {
        if !self.state.can_transition_to(next) {
            return Err(RunError::InvalidTransition { from: self.state, to: next });
        }
        if self.state == RunState::Uninitialized {
            self.started_at = Some(Utc::now());
        }
        self.state = next;
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in [RunState::Completed, RunState::Failed, RunState::Cancelled] {
            assert!(terminal.is_terminal());
            for next in [
                RunState::Uninitialized,
                RunState::Running,
                RunState::Paused,
                RunState::Completed,
                RunState::Failed,
                RunState::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_paused_is_only_reentry_to_running() {
        assert!(RunState::Paused.can_transition_to(RunState::Running));
        assert!(!RunState::Completed.can_transition_to(RunState::Running));
        assert!(!RunState::Cancelled.can_transition_to(RunState::Running));
        assert!(!RunState::Failed.can_transition_to(RunState::Running));
    }

    #[test]
    fn test_transition_maintains_timestamp_invariants() {
        let mut run = Run::new("routine-1", RunConfig::default());
        assert!(run.started_at.is_none());

        run.transition_to(RunState::Running).unwrap();
        assert!(run.started_at.is_some());
        assert!(run.completed_at.is_none());

        run.transition_to(RunState::Completed).unwrap();
        assert!(run.completed_at.is_some());
    }

    #[test]
    fn test_invalid_transition_is_rejected() {
        let mut run = Run::new("routine-1", RunConfig::default());
        let err = run.transition_to(RunState::Completed).unwrap_err();
        assert!(matches!(
            err,
            RunError::InvalidTransition { from: RunState::Uninitialized, to: RunState::Completed }
        ));
        assert_eq!(run.state, RunState::Uninitialized);
    }

    #[test]
    fn test_step_status_lifecycle() {
        let mut status = StepStatus::pending("s1");
        assert!(status.completed_at.is_none());

        status.start();
        assert_eq!(status.state, StepState::Running);
        assert!(status.started_at.is_some());
        assert!(status.completed_at.is_none());

        status.complete(serde_json::json!({"out": 1}));
        assert_eq!(status.state, StepState::Completed);
        assert!(status.completed_at.is_some());
        assert!(status.result.is_some());
    }

    #[test]
    fn test_branch_state_derivation() {
        let mut branch = BranchExecution::new("b1", "fork-1", false);
        let mut s1 = StepStatus::pending("s1");
        s1.start();
        s1.complete(Value::Null);
        let mut s2 = StepStatus::pending("s2");
        s2.skip();
        branch.steps = vec![s1, s2];

        branch.recompute_state(RecoveryStrategy::Skip);
        assert_eq!(branch.state, BranchState::Completed);

        let mut failed = StepStatus::pending("s3");
        failed.fail("boom");
        branch.steps.push(failed);
        branch.recompute_state(RecoveryStrategy::Abort);
        assert_eq!(branch.state, BranchState::Failed);
    }
}

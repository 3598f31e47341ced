//! Run data model, context scopes, routine definitions, and the engine.

pub mod context;
pub mod engine;
pub mod routine;
pub mod types;

pub use context::{ContextScope, RunContext};
pub use engine::{MAX_PARALLEL_BRANCHES, RunEngine};
pub use routine::{
    BranchDefinition, OutputField, OutputFieldType, Routine, RoutineError, RoutineNode,
    RoutineSource, StepDefinition,
};
pub use types::{
    BranchExecution, BranchState, Location, LocationStack, MAX_STEP_RETRIES, RecoveryStrategy,
    Run, RunConfig, RunProgress, RunState, StepState, StepStatus,
};

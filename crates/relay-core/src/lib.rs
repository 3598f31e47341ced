//! Relay execution core.
//!
//! Drives a multi-step, possibly branching routine (a "run") to completion
//! under strict resource budgets. The core combines three tightly coupled
//! pieces: the run state machine ([`run`]), the pluggable per-step execution
//! strategies ([`strategy`]), and circuit-breaker-protected resource
//! providers ([`provider`]).

pub mod breaker;
pub mod error;
pub mod provider;
pub mod run;
pub mod strategy;

pub use breaker::{BreakerError, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use error::RunError;
pub use provider::{
    DiscoveryStatus, ProviderBackend, ProviderEvent, ResourceHealth, ResourceProvider,
};
pub use run::{
    BranchDefinition, BranchExecution, BranchState, ContextScope, Location, LocationStack,
    OutputField, OutputFieldType, RecoveryStrategy, Routine, RoutineNode, RoutineSource, Run,
    RunConfig, RunContext, RunEngine, RunProgress, RunState, StepDefinition, StepState,
    StepStatus,
};
pub use strategy::{
    ConversationalStrategy, DeterministicStrategy, ExecutionContext, ExecutionLimits,
    ExecutionStrategy, FourPhaseStrategy, StepError, StepExecutionKind, StepExecutionResult,
    StrategyDeps, StrategyRegistry, StrategyRegistryConfig,
};

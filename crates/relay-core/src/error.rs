//! Crate-level error taxonomy for run execution.
//!
//! Step-level failures travel as [`StepError`](crate::strategy::StepError)
//! values inside results, never as `Err`. `RunError` covers what can go wrong
//! around the driving loop itself; only the engine puts a run into a terminal
//! `Failed` state.

use crate::run::routine::RoutineError;
use crate::run::types::RunState;
use relay_abstraction::RunStoreError;
use thiserror::Error;

/// Errors surfaced by the run engine and state machine.
#[derive(Error, Debug)]
pub enum RunError {
    /// A configured run limit was exceeded. Always fatal.
    #[error("Run limit exceeded: {0}")]
    LimitExceeded(String),

    /// The run was cancelled from outside.
    #[error("Run cancelled")]
    Cancelled,

    /// The routine definition could not be resolved.
    #[error(transparent)]
    RoutineResolution(#[from] RoutineError),

    /// An illegal run state transition was attempted.
    #[error("Invalid run state transition: {from:?} -> {to:?}")]
    InvalidTransition {
        /// State the run was in.
        from: RunState,
        /// State that was requested.
        to: RunState,
    },

    /// The run store failed.
    #[error(transparent)]
    Store(#[from] RunStoreError),
}

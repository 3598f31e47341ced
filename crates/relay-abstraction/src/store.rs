//! Run persistence interface.
//!
//! The engine checkpoints progress and context at configured intervals and on
//! state transitions; the storage format belongs to the store implementation.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Errors from the run store.
#[derive(Error, Debug)]
pub enum RunStoreError {
    /// Run not found in the store.
    #[error("Run not found: {0}")]
    NotFound(String),

    /// Checkpoint write failed.
    #[error("Checkpoint failed: {0}")]
    CheckpointFailed(String),
}

/// A persisted run snapshot, as the store last saw it.
#[derive(Debug, Clone)]
pub struct RunSnapshot {
    /// The run identifier.
    pub run_id: String,
    /// Serialized progress at checkpoint time.
    pub progress: Value,
    /// Serialized context at checkpoint time.
    pub context: Value,
}

/// Run persistence collaborator.
///
/// Progress and context are passed as JSON values so the store stays
/// format-agnostic.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Persists a progress/context checkpoint for a run.
    ///
    /// # Errors
    /// Returns `RunStoreError` if the write fails.
    async fn checkpoint(
        &self,
        run_id: &str,
        progress: Value,
        context: Value,
    ) -> Result<(), RunStoreError>;

    /// Loads the last persisted snapshot of a run.
    ///
    /// # Errors
    /// Returns `RunStoreError::NotFound` if the run was never checkpointed.
    async fn load(&self, run_id: &str) -> Result<RunSnapshot, RunStoreError>;
}

//! Collaborator abstraction layer for Relay.
//!
//! This crate defines the narrow interfaces through which the execution core
//! talks to the outside world: model invocation, message persistence, run
//! checkpointing, and output validation. The core treats every one of these
//! as an opaque, unreliable dependency.

pub mod invoker;
pub mod messages;
pub mod mock;
pub mod store;
pub mod validation;

pub use invoker::{
    InvocationBudget, InvocationError, InvocationRequest, InvocationResponse, ModelInvoker,
};
pub use messages::{ChatMessage, MessageRole, MessageStore, MessageStoreError};
pub use mock::MockInvoker;
pub use store::{RunSnapshot, RunStore, RunStoreError};
pub use validation::{ValidationEngine, ValidationResult, ValidationSummary};

//! Routine definitions: the step graph a run instantiates.

use crate::strategy::StepExecutionKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

/// Primitive type declared for an expected step output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputFieldType {
    /// Coerced by keyword sniffing.
    Boolean,
    /// Coerced by first-matching-integer extraction.
    Integer,
    /// Coerced by first-matching-number extraction.
    Number,
    /// Passed through as-is.
    Text,
}

/// An output field a step declares it will produce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputField {
    /// Machine name of the output.
    pub name: String,
    /// Optional human-facing display name.
    pub display_name: Option<String>,
    /// Declared primitive type; `None` means untyped.
    pub field_type: Option<OutputFieldType>,
}

impl OutputField {
    /// Creates an untyped output field.
    pub fn untyped(name: impl Into<String>) -> Self {
        Self { name: name.into(), display_name: None, field_type: None }
    }

    /// Creates a typed output field.
    pub fn typed(name: impl Into<String>, field_type: OutputFieldType) -> Self {
        Self { name: name.into(), display_name: None, field_type: Some(field_type) }
    }
}

/// One unit of work within a routine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Step identifier, unique within the routine.
    pub id: String,
    /// Step name.
    pub name: String,
    /// Step description.
    pub description: String,
    /// Additional instructions for the executing strategy.
    pub instructions: Option<String>,
    /// Explicitly declared execution kind; the primary dispatch signal.
    pub kind: Option<StepExecutionKind>,
    /// Step subtype, a secondary dispatch signal (e.g. "discussion").
    pub subtype: Option<String>,
    /// Declared step inputs.
    pub inputs: HashMap<String, Value>,
    /// Declared expected outputs.
    pub expected_outputs: Vec<OutputField>,
}

impl StepDefinition {
    /// Creates a minimal step definition.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            instructions: None,
            kind: None,
            subtype: None,
            inputs: HashMap::new(),
            expected_outputs: Vec::new(),
        }
    }

    /// Sets the explicit execution kind.
    #[must_use]
    pub fn with_kind(mut self, kind: StepExecutionKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Adds an input value.
    #[must_use]
    pub fn with_input(mut self, name: impl Into<String>, value: Value) -> Self {
        self.inputs.insert(name.into(), value);
        self
    }

    /// Adds an expected output.
    #[must_use]
    pub fn with_output(mut self, output: OutputField) -> Self {
        self.expected_outputs.push(output);
        self
    }
}

/// A forked sub-sequence of the routine graph.
///
/// A branch holds full routine nodes, so forks nest: a branch may itself
/// fork into further branches, down to the run's depth limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchDefinition {
    /// Branch identifier.
    pub id: String,
    /// Nodes executed in order within the branch.
    pub nodes: Vec<RoutineNode>,
}

impl BranchDefinition {
    /// Creates a branch from nodes.
    pub fn new(id: impl Into<String>, nodes: Vec<RoutineNode>) -> Self {
        Self { id: id.into(), nodes }
    }

    /// Creates a branch from a flat step sequence.
    pub fn from_steps(id: impl Into<String>, steps: Vec<StepDefinition>) -> Self {
        Self { id: id.into(), nodes: steps.into_iter().map(RoutineNode::Step).collect() }
    }
}

/// One node in a routine's step graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RoutineNode {
    /// A single step.
    Step(StepDefinition),
    /// A fork into branches, potentially executed in parallel.
    Fork {
        /// Fork identifier (the parent step id of the branches).
        id: String,
        /// The forked branches.
        branches: Vec<BranchDefinition>,
    },
}

/// A workflow definition that a run instantiates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Routine {
    /// Routine identifier.
    pub id: String,
    /// Routine name.
    pub name: String,
    /// Ordered step graph.
    pub nodes: Vec<RoutineNode>,
}

impl Routine {
    /// Creates a routine from nodes.
    pub fn new(id: impl Into<String>, name: impl Into<String>, nodes: Vec<RoutineNode>) -> Self {
        Self { id: id.into(), name: name.into(), nodes }
    }

    /// Counts the leaf steps in the graph, descending into nested forks.
    pub fn leaf_step_count(&self) -> u32 {
        count_leaf_steps(&self.nodes)
    }
}

fn count_leaf_steps(nodes: &[RoutineNode]) -> u32 {
    nodes
        .iter()
        .map(|node| match node {
            RoutineNode::Step(_) => 1,
            RoutineNode::Fork { branches, .. } => {
                branches.iter().map(|b| count_leaf_steps(&b.nodes)).sum()
            }
        })
        .sum()
}

/// Error resolving a routine definition.
#[derive(Error, Debug)]
pub enum RoutineError {
    /// No routine with the given id.
    #[error("Routine not found: {0}")]
    NotFound(String),

    /// The definition could not be loaded or parsed.
    #[error("Failed to resolve routine: {0}")]
    ResolutionFailed(String),
}

/// Collaborator that resolves a routine id to its step graph.
#[async_trait]
pub trait RoutineSource: Send + Sync {
    /// Resolves a routine definition.
    ///
    /// # Errors
    /// Returns `RoutineError` if the routine cannot be resolved.
    async fn resolve(&self, routine_id: &str) -> Result<Routine, RoutineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leaf_step_count_counts_branch_steps() {
        let routine = Routine::new(
            "routine-1",
            "Test",
            vec![
                RoutineNode::Step(StepDefinition::new("s1", "Step 1")),
                RoutineNode::Fork {
                    id: "fork-1".to_string(),
                    branches: vec![
                        BranchDefinition::from_steps(
                            "b1",
                            vec![
                                StepDefinition::new("s2", "Step 2"),
                                StepDefinition::new("s3", "Step 3"),
                            ],
                        ),
                        BranchDefinition::from_steps(
                            "b2",
                            vec![StepDefinition::new("s4", "Step 4")],
                        ),
                    ],
                },
                RoutineNode::Step(StepDefinition::new("s5", "Step 5")),
            ],
        );

        assert_eq!(routine.leaf_step_count(), 5);
    }

    #[test]
    fn test_leaf_step_count_descends_into_nested_forks() {
        let inner = RoutineNode::Fork {
            id: "inner".to_string(),
            branches: vec![
                BranchDefinition::from_steps("b2", vec![StepDefinition::new("s2", "Step 2")]),
                BranchDefinition::from_steps("b3", vec![StepDefinition::new("s3", "Step 3")]),
            ],
        };
        let routine = Routine::new(
            "routine-1",
            "Nested",
            vec![RoutineNode::Fork {
                id: "outer".to_string(),
                branches: vec![
                    BranchDefinition::new(
                        "b1",
                        vec![RoutineNode::Step(StepDefinition::new("s1", "Step 1")), inner],
                    ),
                    BranchDefinition::from_steps("b4", vec![StepDefinition::new("s4", "Step 4")]),
                ],
            }],
        );

        assert_eq!(routine.leaf_step_count(), 4);
    }
}

//! Output validation interface, consumed by the refine phase.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Result of evaluating one validation rule against a step output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    /// Name of the rule that was evaluated.
    pub rule: String,
    /// Whether the output satisfied the rule.
    pub passed: bool,
    /// Human-readable explanation.
    pub message: String,
}

/// Aggregate view over a set of validation results.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ValidationSummary {
    /// Score in `[0.0, 1.0]` — fraction of rules passed.
    pub score: f64,
    /// Whether the output passed overall.
    pub overall_passed: bool,
}

/// Validation collaborator.
///
/// Synchronous by design: validation frameworks evaluate in-memory rules and
/// have no business suspending the strategy.
pub trait ValidationEngine: Send + Sync {
    /// Validates a step output against a named framework.
    fn validate(&self, result: &Value, framework: &str) -> Vec<ValidationResult>;

    /// Summarizes a set of validation results.
    fn summarize(&self, results: &[ValidationResult]) -> ValidationSummary;

    /// Suggests corrective rewrites for a failing output.
    fn suggest_improvements(&self, result: &Value, results: &[ValidationResult]) -> Vec<String>;
}

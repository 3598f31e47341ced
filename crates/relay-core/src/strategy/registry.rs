//! Strategy registration and dispatch.
//!
//! Dispatch is explicit-first: a step that declares an execution kind is
//! routed to the strategy registered for that kind, full stop. Heuristic
//! `can_handle` probing is opt-in and only consulted for steps that declare
//! nothing. The deterministic strategy is the final fallback either way.

use super::{
    ConversationalStrategy, DeterministicStrategy, ExecutionStrategy, FourPhaseStrategy,
};
use crate::run::routine::StepDefinition;
use std::sync::Arc;
use tracing::debug;

/// Dispatch configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct StrategyRegistryConfig {
    /// Probe `can_handle` for steps without an explicit kind. Off by
    /// default: heuristics make dispatch depend on step wording.
    pub heuristic_dispatch: bool,
}

/// Holds the registered strategies and routes steps to them.
pub struct StrategyRegistry {
    strategies: Vec<Arc<dyn ExecutionStrategy>>,
    fallback: Arc<dyn ExecutionStrategy>,
    config: StrategyRegistryConfig,
}

impl StrategyRegistry {
    /// Creates a registry with the three built-in strategies and the
    /// deterministic strategy as fallback.
    pub fn new(config: StrategyRegistryConfig) -> Self {
        Self {
            strategies: vec![
                Arc::new(FourPhaseStrategy::new()),
                Arc::new(ConversationalStrategy::new()),
            ],
            fallback: Arc::new(DeterministicStrategy::new()),
            config,
        }
    }

    /// Registers an additional strategy. Later registrations win explicit
    /// dispatch for their kind.
    pub fn register(&mut self, strategy: Arc<dyn ExecutionStrategy>) {
        self.strategies.insert(0, strategy);
    }

    /// Resolves the strategy for a step.
    pub fn resolve(&self, step: &StepDefinition) -> Arc<dyn ExecutionStrategy> {
        if let Some(kind) = step.kind {
            if kind == self.fallback.kind() {
                return Arc::clone(&self.fallback);
            }
            if let Some(strategy) = self.strategies.iter().find(|s| s.kind() == kind) {
                return Arc::clone(strategy);
            }
            debug!(step_id = %step.id, ?kind, "No strategy registered for kind, falling back");
            return Arc::clone(&self.fallback);
        }

        if self.config.heuristic_dispatch
            && let Some(strategy) = self.strategies.iter().find(|s| s.can_handle(step))
        {
            debug!(
                step_id = %step.id,
                kind = ?strategy.kind(),
                "Heuristic dispatch selected strategy"
            );
            return Arc::clone(strategy);
        }

        Arc::clone(&self.fallback)
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::new(StrategyRegistryConfig::default())
    }
}

//! Run-scoped variable context with arena-based lexical scopes.
//!
//! Scopes are held in a flat map keyed by id, with parents referenced by id
//! rather than by object link, so scope trees cannot form ownership cycles.
//! A lookup walks from the active scope through its ancestors and finally
//! falls back to the run-level variables.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// One lexical scope in the arena.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextScope {
    /// Scope identifier; the arena key.
    pub id: String,
    /// Human-facing scope name.
    pub name: String,
    /// Parent scope id; a lookup key, never an owning reference.
    pub parent_id: Option<String>,
    /// Variables bound in this scope.
    pub variables: HashMap<String, Value>,
}

/// Variables, free-form notes, and scopes owned exclusively by one run.
///
/// Strategies receive values derived from this context for one step and must
/// not retain them past the call; branch tasks never mutate it directly —
/// they return outputs that the coordinator merges.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunContext {
    /// Flat run-level variables, mutated as step outputs are folded in.
    pub variables: HashMap<String, Value>,
    /// Cross-step free-form notes.
    pub blackboard: HashMap<String, Value>,
    /// Scope arena keyed by scope id.
    pub scopes: HashMap<String, ContextScope>,
    /// The innermost active scope, if any.
    pub active_scope: Option<String>,
}

impl RunContext {
    /// Opens a new scope nested under the active one and makes it active.
    /// Returns the new scope id.
    pub fn push_scope(&mut self, name: impl Into<String>) -> String {
        let id = Uuid::new_v4().to_string();
        let scope = ContextScope {
            id: id.clone(),
            name: name.into(),
            parent_id: self.active_scope.clone(),
            variables: HashMap::new(),
        };
        self.scopes.insert(id.clone(), scope);
        self.active_scope = Some(id.clone());
        id
    }

    /// Closes the active scope, making its parent active. The scope stays in
    /// the arena so checkpoints retain it.
    pub fn pop_scope(&mut self) -> Option<String> {
        let active = self.active_scope.take()?;
        self.active_scope = self.scopes.get(&active).and_then(|s| s.parent_id.clone());
        Some(active)
    }

    /// Binds a variable in the active scope, or at run level when no scope
    /// is open.
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        match self.active_scope.as_ref().and_then(|id| self.scopes.get_mut(id)) {
            Some(scope) => {
                scope.variables.insert(name, value);
            }
            None => {
                self.variables.insert(name, value);
            }
        }
    }

    /// Resolves a variable by walking from the active scope through its
    /// ancestors, then the run-level variables. Inner bindings shadow outer
    /// ones.
    pub fn resolve(&self, name: &str) -> Option<&Value> {
        let mut current = self.active_scope.as_deref();
        while let Some(id) = current {
            let scope = self.scopes.get(id)?;
            if let Some(value) = scope.variables.get(name) {
                return Some(value);
            }
            current = scope.parent_id.as_deref();
        }
        self.variables.get(name)
    }

    /// A flattened view of every variable visible from the active scope,
    /// outer bindings first so inner ones win.
    pub fn visible_variables(&self) -> HashMap<String, Value> {
        let mut chain = Vec::new();
        let mut current = self.active_scope.as_deref();
        while let Some(id) = current {
            let Some(scope) = self.scopes.get(id) else { break };
            chain.push(scope);
            current = scope.parent_id.as_deref();
        }

        let mut visible = self.variables.clone();
        for scope in chain.iter().rev() {
            for (name, value) in &scope.variables {
                visible.insert(name.clone(), value.clone());
            }
        }
        visible
    }
}

//! Pluggable per-tool logic.
//!
//! A [`ToolAdapter`] owns everything that depends on what a step *says*:
//! classifying content, pulling out evidence/assumptions/risks, and phrasing
//! a next-step hint. The analyzer never inspects content itself.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::storage::{Step, StepType};

use super::KeywordAdapter;

/// Domain-specific extraction merged into a step's metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extraction {
    /// Statements offered as evidence.
    #[serde(default)]
    pub evidence: Vec<String>,
    /// Statements taken as given.
    #[serde(default)]
    pub assumptions: Vec<String>,
    /// Statements flagging something that could go wrong.
    #[serde(default)]
    pub risks: Vec<String>,
}

impl Extraction {
    /// Whether nothing was extracted.
    pub fn is_empty(&self) -> bool {
        self.evidence.is_empty() && self.assumptions.is_empty() && self.risks.is_empty()
    }
}

/// Tool-specific strategy consulted by the progressive analyzer.
#[cfg_attr(test, mockall::automock)]
pub trait ToolAdapter: Send + Sync {
    /// Step type hint for this content. `None` defers to the default
    /// positional classifier.
    fn classify(&self, content: &str, prior_steps: &[Step]) -> Option<StepType>;

    /// Evidence, assumptions and risks found in the content.
    fn extract(&self, content: &str, prior_steps: &[Step]) -> Extraction;

    /// Next-step hint after a step of `step_type`.
    fn suggest(&self, step_type: StepType, content: &str) -> String;
}

/// Adapters keyed by tool name. Cheap to clone.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn ToolAdapter>>,
}

impl AdapterRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in keyword adapters for the non-generic tools.
    pub fn with_builtin_adapters() -> Self {
        let mut registry = Self::new();
        registry.register("debugging_approach", Arc::new(KeywordAdapter::debugging()));
        registry.register("mental_model", Arc::new(KeywordAdapter::mental_model()));
        registry.register(
            "collaborative_reasoning",
            Arc::new(KeywordAdapter::collaborative()),
        );
        registry.register("decision_framework", Arc::new(KeywordAdapter::decision()));
        registry
    }

    /// Register (or replace) the adapter for a tool
    pub fn register(&mut self, tool_name: impl Into<String>, adapter: Arc<dyn ToolAdapter>) {
        self.adapters.insert(tool_name.into(), adapter);
    }

    /// Adapter for a tool, if any.
    pub fn get(&self, tool_name: &str) -> Option<Arc<dyn ToolAdapter>> {
        self.adapters.get(tool_name).cloned()
    }

    /// Registered tool names, sorted.
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("tools", &self.tool_names())
            .finish()
    }
}

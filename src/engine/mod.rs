//! Progressive reasoning engine.
//!
//! One generic [`ProgressiveAnalyzer`] drives every tool. Tool-specific
//! behavior lives behind the [`ToolAdapter`] trait; everything else
//! (classification fallback, confidence, progress, branch and revision
//! checks) is shared.
//!
//! - [`classify_step`], [`compute_confidence`], [`compute_progress`]: pure step math
//! - [`ProgressiveAnalyzer`]: validates, classifies and persists one step
//! - [`SessionOrchestrator`]: request boundary, folds errors into responses
//! - [`current_chain`]: read-side view with revisions applied

mod adapter;
mod analyzer;
mod chain;
mod classify;
mod keyword;
mod orchestrator;
mod types;

pub use adapter::{AdapterRegistry, Extraction, ToolAdapter};
pub use analyzer::{AnalyzerSettings, ProgressiveAnalyzer};
pub use chain::current_chain;
pub use classify::{
    base_confidence, classify_step, compute_confidence, compute_progress, default_suggestion,
    MAX_CONFIDENCE, MIN_CONFIDENCE,
};
pub use keyword::KeywordAdapter;
pub use orchestrator::{
    BranchSummary, SessionOrchestrator, SessionSummary, SessionView, StepView,
};
pub use types::{Progress, ProgressiveStepRequest, ProgressiveStepResponse, ResponseStatus};

/// Tools served by the engine, in catalogue order.
pub const PROGRESSIVE_TOOLS: [&str; 5] = [
    "sequential_thinking",
    "debugging_approach",
    "mental_model",
    "collaborative_reasoning",
    "decision_framework",
];

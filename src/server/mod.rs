//! Server module for MCP protocol handling.
//!
//! This module provides:
//! - MCP server implementation over stdio
//! - Tool call handlers and routing
//! - Shared application state management

mod handlers;
mod mcp;

pub use handlers::*;
pub use mcp::*;

use std::sync::Arc;

use crate::config::Config;
use crate::engine::{AdapterRegistry, SessionOrchestrator};
use crate::storage::Storage;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Config,
    /// Session and step storage backend.
    pub storage: Arc<dyn Storage>,
    /// Request boundary for every progressive tool.
    pub orchestrator: SessionOrchestrator,
}

impl AppState {
    /// Create new application state with the built-in tool adapters
    pub fn new(config: Config, storage: Arc<dyn Storage>) -> Self {
        Self::with_adapters(config, storage, AdapterRegistry::with_builtin_adapters())
    }

    /// Create application state with a custom adapter registry
    pub fn with_adapters(
        config: Config,
        storage: Arc<dyn Storage>,
        adapters: AdapterRegistry,
    ) -> Self {
        tracing::info!(
            adapters = ?adapters.tool_names(),
            strict_sequence = config.engine.strict_sequence,
            "AppState initializing"
        );

        let orchestrator =
            SessionOrchestrator::new(storage.clone(), adapters, config.engine.clone());

        Self {
            config,
            storage,
            orchestrator,
        }
    }
}

/// Shared application state handle
pub type SharedState = Arc<AppState>;

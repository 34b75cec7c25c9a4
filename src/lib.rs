//! # Progressive Reasoning Server
//!
//! A Model Context Protocol (MCP) server that drives cognitive reasoning tools
//! one step at a time, persisting every step so sessions can be resumed,
//! branched and revised.
//!
//! ## Features
//!
//! - **Progressive tools**: sequential thinking, debugging, mental models,
//!   collaborative reasoning and decision frameworks share one engine
//! - **Branching**: alternate step sequences forking from any earlier step
//! - **Revisions**: new steps that supersede earlier ones without mutating them
//! - **Atomic numbering**: concurrent writes of the same step never both succeed
//! - **Pluggable adapters**: per-tool classification and extraction behind a trait
//!
//! ## Architecture
//!
//! ```text
//! MCP Client → McpServer → SessionOrchestrator → ProgressiveAnalyzer
//!                                                   ↓            ↓
//!                                        SessionStore/StepStore  ToolAdapter
//!                                           (SQLite | memory)
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use progressive_reasoning::{AppState, Config, McpServer};
//! use progressive_reasoning::storage::open_storage;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let storage = open_storage(&config.database).await?;
//!     let state = Arc::new(AppState::new(config, storage));
//!     McpServer::new(state).run().await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

/// Configuration management for the MCP server.
pub mod config;
/// Progressive analyzer, tool adapters and the session orchestrator.
pub mod engine;
/// Error types and result aliases for the application.
pub mod error;
/// MCP server implementation and request handling.
pub mod server;
/// Session and step persistence.
pub mod storage;

pub use config::Config;
pub use engine::{ProgressiveStepRequest, ProgressiveStepResponse, SessionOrchestrator};
pub use error::{AppError, AppResult};
pub use server::{AppState, McpServer, SharedState};

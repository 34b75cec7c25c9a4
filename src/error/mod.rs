use thiserror::Error;

/// Application-level errors
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("MCP protocol error: {0}")]
    Mcp(#[from] McpError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Storage layer errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database connection failed: {message}")]
    Connection { message: String },

    #[error("Query failed: {message}")]
    Query { message: String },

    #[error("Migration failed: {message}")]
    Migration { message: String },

    #[error("Session already exists: {session_id}")]
    DuplicateSession { session_id: String },

    #[error("Session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("Step {step_number} already exists in session {session_id} ({})", branch_label(.branch_id))]
    StepConflict {
        session_id: String,
        branch_id: Option<String>,
        step_number: u32,
    },

    #[error("Invalid step: {reason}")]
    InvalidStep { reason: String },

    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// Errors raised while processing a progressive step request.
///
/// Every variant maps onto a stable [`EngineError::code`] that is reported
/// back to callers in the structured step response.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Validation failed: {field} - {reason}")]
    Validation { field: String, reason: String },

    #[error("Conflict: step {step_number} already exists in session {session_id} ({})", branch_label(.branch_id))]
    Conflict {
        session_id: String,
        branch_id: Option<String>,
        step_number: u32,
    },

    #[error("Not found: {what}")]
    NotFound { what: String },

    #[error("Store error: {0}")]
    Store(StorageError),
}

impl EngineError {
    /// Shorthand for a validation failure on a request field.
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation { .. } => "validation",
            EngineError::Conflict { .. } => "conflict",
            EngineError::NotFound { .. } => "not_found",
            EngineError::Store(_) => "store_error",
        }
    }
}

impl From<StorageError> for EngineError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::StepConflict {
                session_id,
                branch_id,
                step_number,
            } => EngineError::Conflict {
                session_id,
                branch_id,
                step_number,
            },
            StorageError::SessionNotFound { session_id } => EngineError::NotFound {
                what: format!("session {}", session_id),
            },
            StorageError::InvalidStep { reason } => EngineError::Validation {
                field: "step".to_string(),
                reason,
            },
            other => EngineError::Store(other),
        }
    }
}

/// MCP protocol errors
#[derive(Debug, Error)]
pub enum McpError {
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Unknown tool: {tool_name}")]
    UnknownTool { tool_name: String },

    #[error("Invalid parameters for {tool_name}: {message}")]
    InvalidParameters { tool_name: String, message: String },

    #[error("Tool execution failed: {message}")]
    ExecutionFailed { message: String },

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<AppError> for McpError {
    fn from(err: AppError) -> Self {
        McpError::ExecutionFailed {
            message: err.to_string(),
        }
    }
}

impl From<EngineError> for McpError {
    fn from(err: EngineError) -> Self {
        McpError::ExecutionFailed {
            message: err.to_string(),
        }
    }
}

fn branch_label(branch_id: &Option<String>) -> String {
    match branch_id {
        Some(id) => format!("branch {}", id),
        None => "main line".to_string(),
    }
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Result type alias for MCP operations
pub type McpResult<T> = Result<T, McpError>;

use std::env;
use std::path::PathBuf;

use crate::error::AppError;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub engine: EngineConfig,
}

/// Which persistence backend drives the session and step stores
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StorageBackend {
    #[default]
    Sqlite,
    Memory,
}

impl std::str::FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sqlite" => Ok(StorageBackend::Sqlite),
            "memory" => Ok(StorageBackend::Memory),
            _ => Err(format!("Unknown storage backend: {}", s)),
        }
    }
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub backend: StorageBackend,
    pub path: PathBuf,
    pub max_connections: u32,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, PartialEq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Progressive engine behavior
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Reject step numbers that skip ahead of `latest + 1`.
    pub strict_sequence: bool,
    /// Default age used by session cleanup.
    pub session_max_age_hours: u64,
    /// Default page size for session listings.
    pub session_list_limit: u32,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, AppError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let backend = env::var("STORAGE_BACKEND")
            .unwrap_or_else(|_| "sqlite".to_string())
            .parse::<StorageBackend>()
            .map_err(|message| AppError::Config { message })?;

        let database = DatabaseConfig {
            backend,
            path: PathBuf::from(
                env::var("DATABASE_PATH").unwrap_or_else(|_| "./data/reasoning.db".to_string()),
            ),
            max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(5),
        };

        let logging = LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "pretty".to_string())
                .to_lowercase()
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        };

        let engine = EngineConfig {
            strict_sequence: env::var("ENGINE_STRICT_SEQUENCE")
                .ok()
                .and_then(|s| parse_bool(&s))
                .unwrap_or(false),
            session_max_age_hours: env::var("SESSION_MAX_AGE_HOURS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(168),
            session_list_limit: env::var("SESSION_LIST_LIMIT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(50),
        };

        Ok(Config {
            database,
            logging,
            engine,
        })
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sqlite,
            path: PathBuf::from("./data/reasoning.db"),
            max_connections: 5,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            strict_sequence: false,
            session_max_age_hours: 168,
            session_list_limit: 50,
        }
    }
}

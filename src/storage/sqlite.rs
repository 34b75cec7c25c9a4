use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteRow,
};
use sqlx::{QueryBuilder, Sqlite};
use std::str::FromStr;
use tracing::{debug, info};

use super::{
    BranchInfo, NewStep, Session, SessionFilter, SessionPatch, SessionStore, Step, StepQuery,
    StepStore, StepType,
};
use crate::config::DatabaseConfig;
use crate::error::{StorageError, StorageResult};

/// Static migrator that embeds migrations at compile time
static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Main-line steps are stored under this branch key.
const MAIN_LINE: &str = "";

const SESSION_COLUMNS: &str = "id, tool_name, created_at, updated_at, metadata, active";

const STEP_COLUMNS: &str = "id, session_id, step_number, total_steps, content, step_type, \
     confidence, branch_id, parent_branch_id, branch_from_step, revises_step, is_revision, \
     next_step_needed, metadata, created_at";

/// SQLite-backed storage implementation
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Create a new SQLite storage instance
    pub async fn new(config: &DatabaseConfig) -> StorageResult<Self> {
        if config.path.as_os_str() == ":memory:" {
            return Self::new_in_memory().await;
        }

        // Ensure parent directory exists
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Connection {
                message: format!("Failed to create database directory: {}", e),
            })?;
        }

        let database_url = format!("sqlite://{}?mode=rwc", config.path.display());

        let options = SqliteConnectOptions::from_str(&database_url)
            .map_err(|e| StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to connect to database: {}", e),
            })?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// Create a private in-memory database.
    ///
    /// The pool holds exactly one connection that never expires, since every
    /// SQLite `:memory:` connection is its own database.
    pub async fn new_in_memory() -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            })?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to open in-memory database: {}", e),
            })?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// Run database migrations using embedded sqlx migrations
    async fn run_migrations(&self) -> StorageResult<()> {
        info!("Running database migrations...");

        MIGRATOR.run(&self.pool).await.map_err(|e| StorageError::Migration {
            message: format!("Failed to run migrations: {}", e),
        })?;

        info!("Database migrations completed successfully");
        Ok(())
    }

    /// Get the underlying pool for advanced queries
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn session_exists(conn: &mut SqliteConnection, id: &str) -> StorageResult<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(conn)
            .await?;
        Ok(found.is_some())
    }
}

#[async_trait]
impl SessionStore for SqliteStorage {
    async fn create_session(&self, session: &Session) -> StorageResult<Session> {
        let metadata = encode_json(session.metadata.as_ref())?;

        sqlx::query(
            r#"
            INSERT INTO sessions (id, tool_name, created_at, updated_at, metadata, active)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.id)
        .bind(&session.tool_name)
        .bind(encode_timestamp(&session.created_at))
        .bind(encode_timestamp(&session.updated_at))
        .bind(&metadata)
        .bind(session.active)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StorageError::DuplicateSession {
                    session_id: session.id.clone(),
                }
            } else {
                e.into()
            }
        })?;

        Ok(session.clone())
    }

    async fn get_session(&self, id: &str) -> StorageResult<Option<Session>> {
        let row: Option<SessionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM sessions WHERE id = ?",
            SESSION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Session::try_from).transpose()
    }

    async fn get_or_create_session(&self, id: &str, tool_name: &str) -> StorageResult<Session> {
        let fresh = Session::with_id(id, tool_name);
        let now = encode_timestamp(&fresh.created_at);

        let inserted = sqlx::query(
            r#"
            INSERT INTO sessions (id, tool_name, created_at, updated_at, metadata, active)
            VALUES (?, ?, ?, ?, NULL, 1)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(id)
        .bind(tool_name)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() > 0 {
            debug!(session_id = %id, tool = %tool_name, "Creating session");
        }

        self.get_session(id)
            .await?
            .ok_or_else(|| StorageError::SessionNotFound {
                session_id: id.to_string(),
            })
    }

    async fn update_session(
        &self,
        id: &str,
        patch: &SessionPatch,
    ) -> StorageResult<Option<Session>> {
        let metadata = encode_json(patch.metadata.as_ref())?;

        let result = sqlx::query(
            r#"
            UPDATE sessions
            SET metadata = COALESCE(?, metadata),
                active = COALESCE(?, active),
                updated_at = MAX(?, created_at)
            WHERE id = ?
            "#,
        )
        .bind(&metadata)
        .bind(patch.active)
        .bind(encode_timestamp(&Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        self.get_session(id).await
    }

    async fn list_sessions(
        &self,
        filter: &SessionFilter,
        limit: u32,
        offset: u32,
    ) -> StorageResult<Vec<Session>> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {} FROM sessions WHERE 1 = 1", SESSION_COLUMNS));
        if let Some(tool_name) = &filter.tool_name {
            builder.push(" AND tool_name = ").push_bind(tool_name.clone());
        }
        if let Some(active) = filter.active {
            builder.push(" AND active = ").push_bind(active);
        }
        builder
            .push(" ORDER BY created_at DESC, id ASC LIMIT ")
            .push_bind(i64::from(limit))
            .push(" OFFSET ")
            .push_bind(i64::from(offset));

        let rows = builder
            .build_query_as::<SessionRow>()
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Session::try_from).collect()
    }

    async fn delete_session(&self, id: &str) -> StorageResult<bool> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM steps WHERE session_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn cleanup_older_than(&self, age: Duration) -> StorageResult<u64> {
        let cutoff = encode_timestamp(&(Utc::now() - age));
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "DELETE FROM steps WHERE session_id IN (SELECT id FROM sessions WHERE updated_at < ?)",
        )
        .bind(&cutoff)
        .execute(&mut *tx)
        .await?;
        let result = sqlx::query("DELETE FROM sessions WHERE updated_at < ?")
            .bind(&cutoff)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl StepStore for SqliteStorage {
    async fn save_step(&self, step: &NewStep) -> StorageResult<Step> {
        step.validate()?;

        let metadata = encode_json(step.metadata.as_ref())?;
        let branch_key = step.branch_id.as_deref().unwrap_or(MAIN_LINE);
        let created_at = Utc::now();
        let created_at_text = encode_timestamp(&created_at);

        // The INSERT is the first statement so the transaction takes the write
        // lock immediately; the guard and the insert are one atomic statement.
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO steps (
                session_id, step_number, total_steps, content, step_type, confidence,
                branch_id, parent_branch_id, branch_from_step, revises_step,
                is_revision, next_step_needed, metadata, created_at
            )
            SELECT ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?
            WHERE EXISTS (SELECT 1 FROM sessions WHERE id = ?)
              AND COALESCE(
                    (SELECT MAX(step_number) FROM steps WHERE session_id = ? AND branch_id = ?),
                    0
                  ) < ?
            "#,
        )
        .bind(&step.session_id)
        .bind(i64::from(step.step_number))
        .bind(i64::from(step.total_steps))
        .bind(&step.content)
        .bind(step.step_type.as_str())
        .bind(step.confidence)
        .bind(branch_key)
        .bind(&step.parent_branch_id)
        .bind(step.branch_from_step.map(i64::from))
        .bind(step.revises_step.map(i64::from))
        .bind(step.is_revision)
        .bind(step.next_step_needed)
        .bind(&metadata)
        .bind(&created_at_text)
        .bind(&step.session_id)
        .bind(&step.session_id)
        .bind(branch_key)
        .bind(i64::from(step.step_number))
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                conflict(step)
            } else {
                e.into()
            }
        })?;

        if inserted.rows_affected() == 0 {
            let session_exists = Self::session_exists(&mut tx, &step.session_id).await?;
            tx.rollback().await?;
            return Err(if session_exists {
                conflict(step)
            } else {
                StorageError::SessionNotFound {
                    session_id: step.session_id.clone(),
                }
            });
        }

        let id = inserted.last_insert_rowid();

        sqlx::query("UPDATE sessions SET updated_at = MAX(?, created_at) WHERE id = ?")
            .bind(&created_at_text)
            .bind(&step.session_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(Step::from_new(id, step, created_at))
    }

    async fn get_step_by_number(
        &self,
        session_id: &str,
        branch_id: Option<&str>,
        step_number: u32,
    ) -> StorageResult<Option<Step>> {
        let row: Option<StepRow> = sqlx::query_as(&format!(
            "SELECT {} FROM steps WHERE session_id = ? AND branch_id = ? AND step_number = ?",
            STEP_COLUMNS
        ))
        .bind(session_id)
        .bind(branch_id.unwrap_or(MAIN_LINE))
        .bind(i64::from(step_number))
        .fetch_optional(&self.pool)
        .await?;

        row.map(Step::try_from).transpose()
    }

    async fn list_steps(
        &self,
        session_id: &str,
        branch_id: Option<&str>,
    ) -> StorageResult<Vec<Step>> {
        let rows: Vec<StepRow> = sqlx::query_as(&format!(
            "SELECT {} FROM steps WHERE session_id = ? AND branch_id = ? ORDER BY step_number ASC",
            STEP_COLUMNS
        ))
        .bind(session_id)
        .bind(branch_id.unwrap_or(MAIN_LINE))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Step::try_from).collect()
    }

    async fn list_all_steps(&self, session_id: &str) -> StorageResult<Vec<Step>> {
        let rows: Vec<StepRow> = sqlx::query_as(&format!(
            "SELECT {} FROM steps WHERE session_id = ? ORDER BY branch_id ASC, step_number ASC",
            STEP_COLUMNS
        ))
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Step::try_from).collect()
    }

    async fn latest_step(
        &self,
        session_id: &str,
        branch_id: Option<&str>,
    ) -> StorageResult<Option<Step>> {
        let row: Option<StepRow> = sqlx::query_as(&format!(
            "SELECT {} FROM steps WHERE session_id = ? AND branch_id = ? \
             ORDER BY step_number DESC LIMIT 1",
            STEP_COLUMNS
        ))
        .bind(session_id)
        .bind(branch_id.unwrap_or(MAIN_LINE))
        .fetch_optional(&self.pool)
        .await?;

        row.map(Step::try_from).transpose()
    }

    async fn count_steps(&self, session_id: &str) -> StorageResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM steps WHERE session_id = ?")
            .bind(session_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(count.max(0) as u64)
    }

    async fn search_steps(&self, query: &StepQuery) -> StorageResult<Vec<Step>> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {} FROM steps WHERE 1 = 1", STEP_COLUMNS));
        if let Some(session_id) = &query.session_id {
            builder.push(" AND session_id = ").push_bind(session_id.clone());
        }
        if let Some(text) = &query.text {
            builder
                .push(" AND instr(LOWER(content), ")
                .push_bind(text.to_lowercase())
                .push(") > 0");
        }
        if let Some(step_type) = query.step_type {
            builder.push(" AND step_type = ").push_bind(step_type.as_str());
        }
        if let Some(min_confidence) = query.min_confidence {
            builder.push(" AND confidence >= ").push_bind(min_confidence);
        }
        builder.push(" ORDER BY id ASC");
        if let Some(limit) = query.limit {
            builder.push(" LIMIT ").push_bind(i64::from(limit));
        }

        let rows = builder
            .build_query_as::<StepRow>()
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Step::try_from).collect()
    }

    async fn list_branches(&self, session_id: &str) -> StorageResult<Vec<BranchInfo>> {
        let rows: Vec<SqliteRow> = sqlx::query(
            r#"
            SELECT branch_id, COUNT(*) AS step_count, MAX(step_number) AS latest_step_number
            FROM steps
            WHERE session_id = ?
            GROUP BY branch_id
            ORDER BY branch_id ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> StorageResult<BranchInfo> {
                use sqlx::Row;
                let branch_id: String = row.try_get("branch_id")?;
                let step_count: i64 = row.try_get("step_count")?;
                let latest: i64 = row.try_get("latest_step_number")?;
                Ok(BranchInfo {
                    branch_id: decode_branch(branch_id),
                    step_count: step_count.max(0) as u64,
                    latest_step_number: decode_u32("latest_step_number", latest)?,
                })
            })
            .collect()
    }

    async fn delete_session_steps(&self, session_id: &str) -> StorageResult<u64> {
        let result = sqlx::query("DELETE FROM steps WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

fn conflict(step: &NewStep) -> StorageError {
    StorageError::StepConflict {
        session_id: step.session_id.clone(),
        branch_id: step.branch_id.clone(),
        step_number: step.step_number,
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// Fixed-width UTC timestamps so lexical order in SQL matches time order.
fn encode_timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_timestamp(field: &str, value: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Query {
            message: format!("Invalid {} timestamp '{}': {}", field, value, e),
        })
}

fn encode_json(value: Option<&serde_json::Value>) -> StorageResult<Option<String>> {
    value
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| StorageError::Query {
            message: format!("Failed to encode metadata: {}", e),
        })
}

fn decode_json(value: Option<String>) -> Option<serde_json::Value> {
    value.and_then(|s| serde_json::from_str(&s).ok())
}

fn decode_u32(field: &str, value: i64) -> StorageResult<u32> {
    u32::try_from(value).map_err(|_| StorageError::Query {
        message: format!("Column {} out of range: {}", field, value),
    })
}

fn decode_branch(value: String) -> Option<String> {
    if value == MAIN_LINE {
        None
    } else {
        Some(value)
    }
}

// Internal row types for SQLx mapping
#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    tool_name: String,
    created_at: String,
    updated_at: String,
    metadata: Option<String>,
    active: bool,
}

impl TryFrom<SessionRow> for Session {
    type Error = StorageError;

    fn try_from(row: SessionRow) -> StorageResult<Self> {
        Ok(Self {
            created_at: decode_timestamp("created_at", &row.created_at)?,
            updated_at: decode_timestamp("updated_at", &row.updated_at)?,
            id: row.id,
            tool_name: row.tool_name,
            metadata: decode_json(row.metadata),
            active: row.active,
        })
    }
}

#[derive(sqlx::FromRow)]
struct StepRow {
    id: i64,
    session_id: String,
    step_number: i64,
    total_steps: i64,
    content: String,
    step_type: String,
    confidence: f64,
    branch_id: String,
    parent_branch_id: Option<String>,
    branch_from_step: Option<i64>,
    revises_step: Option<i64>,
    is_revision: bool,
    next_step_needed: bool,
    metadata: Option<String>,
    created_at: String,
}

impl TryFrom<StepRow> for Step {
    type Error = StorageError;

    fn try_from(row: StepRow) -> StorageResult<Self> {
        let step_type = StepType::from_str(&row.step_type)
            .map_err(|message| StorageError::Query { message })?;

        Ok(Self {
            id: row.id,
            session_id: row.session_id,
            step_number: decode_u32("step_number", row.step_number)?,
            total_steps: decode_u32("total_steps", row.total_steps)?,
            content: row.content,
            step_type,
            confidence: row.confidence,
            branch_id: decode_branch(row.branch_id),
            parent_branch_id: row.parent_branch_id,
            branch_from_step: row
                .branch_from_step
                .map(|v| decode_u32("branch_from_step", v))
                .transpose()?,
            revises_step: row
                .revises_step
                .map(|v| decode_u32("revises_step", v))
                .transpose()?,
            is_revision: row.is_revision,
            next_step_needed: row.next_step_needed,
            metadata: decode_json(row.metadata),
            created_at: decode_timestamp("created_at", &row.created_at)?,
        })
    }
}

//! Postgres-backed checkpoint store.
//!
//! Schema (created by [`PostgresCheckpointStore::ensure_schema`]):
//!
//! ```sql
//! CREATE TABLE stream_checkpoints (
//!     stream_name     TEXT        NOT NULL,
//!     job_name        TEXT        NOT NULL,
//!     resume_position TEXT        NOT NULL,
//!     updated_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     PRIMARY KEY (stream_name, job_name)
//! );
//! ```

use async_trait::async_trait;
use sqlx::{PgPool, Row};

use changefeed_core::{JobName, ResumePosition, StreamName};

use super::{CheckpointError, CheckpointStore};

pub const DEFAULT_TABLE: &str = "stream_checkpoints";

#[derive(Debug, Clone)]
pub struct PostgresCheckpointStore {
    pool: PgPool,
    table: String,
}

impl PostgresCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            table: DEFAULT_TABLE.to_string(),
        }
    }

    /// Use a custom table name.
    ///
    /// The name is interpolated into SQL, so only `[A-Za-z0-9_]` is accepted.
    pub fn with_table(mut self, table: impl Into<String>) -> Result<Self, CheckpointError> {
        let table = table.into();
        if !is_valid_identifier(&table) {
            return Err(CheckpointError::Storage(format!(
                "invalid checkpoint table name {table:?}"
            )));
        }
        self.table = table;
        Ok(self)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create the checkpoint table if it does not exist.
    pub async fn ensure_schema(&self) -> Result<(), CheckpointError> {
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                stream_name     TEXT        NOT NULL,
                job_name        TEXT        NOT NULL,
                resume_position TEXT        NOT NULL,
                updated_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (stream_name, job_name)
            )
            "#,
            table = self.table
        );
        sqlx::query(&ddl)
            .execute(&self.pool)
            .await
            .map_err(storage_error)?;
        Ok(())
    }
}

fn is_valid_identifier(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn storage_error(err: sqlx::Error) -> CheckpointError {
    CheckpointError::Storage(err.to_string())
}

#[async_trait]
impl CheckpointStore for PostgresCheckpointStore {
    async fn get(
        &self,
        stream: &StreamName,
        job: &JobName,
    ) -> Result<Option<ResumePosition>, CheckpointError> {
        let sql = format!(
            r#"
            SELECT resume_position
            FROM {table}
            WHERE stream_name = $1 AND job_name = $2
            "#,
            table = self.table
        );

        let row = sqlx::query(&sql)
            .bind(stream.as_str())
            .bind(job.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_error)?;

        match row {
            Some(row) => {
                let token: String = row.try_get("resume_position").map_err(storage_error)?;
                Ok(Some(ResumePosition::new(token)))
            }
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        stream: &StreamName,
        job: &JobName,
        position: &ResumePosition,
    ) -> Result<(), CheckpointError> {
        let sql = format!(
            r#"
            INSERT INTO {table} (stream_name, job_name, resume_position)
            VALUES ($1, $2, $3)
            ON CONFLICT (stream_name, job_name)
            DO UPDATE SET
                resume_position = EXCLUDED.resume_position,
                updated_at = NOW()
            "#,
            table = self.table
        );

        sqlx::query(&sql)
            .bind(stream.as_str())
            .bind(job.as_str())
            .bind(position.as_str())
            .execute(&self.pool)
            .await
            .map_err(storage_error)?;
        Ok(())
    }
}

use crate::store::{JobStore, StoreError};
use crate::{JobId, JobRecord, JobStatus, JobUpdate};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Executor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Postgres-backed job store. Records survive a restart, which is what lets
/// the startup sweep find jobs that were interrupted mid-flight.
#[derive(Clone)]
pub struct PgJobStore {
    pool: Arc<PgPool>,
}

#[derive(sqlx::FromRow)]
struct JobRow {
    status: JobStatus,
    cancel_requested: bool,
    working_directory: Option<String>,
    archive_path: Option<String>,
    error_detail: Option<String>,
}

impl From<JobRow> for JobRecord {
    fn from(row: JobRow) -> Self {
        JobRecord {
            status: row.status,
            cancel_requested: row.cancel_requested,
            working_directory: row.working_directory.map(PathBuf::from),
            archive_path: row.archive_path.map(PathBuf::from),
            error_detail: row.error_detail,
        }
    }
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

impl PgJobStore {
    #[instrument(name = "db.connect", skip(url))]
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;

        (&pool).execute(include_str!("setup.sql")).await?;

        Ok(PgJobStore {
            pool: Arc::new(pool),
        })
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    #[instrument(name = "db.create", skip_all, fields(job_id = %id))]
    async fn create(&self, id: JobId, record: JobRecord) -> Result<(), StoreError> {
        let result = sqlx::query(
            "INSERT INTO download_jobs \
                (id, status, cancel_requested, working_directory, archive_path, error_detail) \
            VALUES ($1, $2, $3, $4, $5, $6) \
            ON CONFLICT (id) DO NOTHING",
        )
        .bind(id)
        .bind(record.status)
        .bind(record.cancel_requested)
        .bind(record.working_directory.as_deref().map(path_text))
        .bind(record.archive_path.as_deref().map(path_text))
        .bind(record.error_detail)
        .execute(&*self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists(id));
        }
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(
            "SELECT status, cancel_requested, working_directory, archive_path, error_detail \
            FROM download_jobs \
            WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(row.map(JobRecord::from))
    }

    #[instrument(name = "db.set_field", skip_all, fields(job_id = %id))]
    async fn set_field(&self, id: JobId, update: JobUpdate) -> Result<(), StoreError> {
        debug!("Updating job {:?}", update);
        let query = match update {
            JobUpdate::Status(status) => {
                sqlx::query("UPDATE download_jobs SET status = $2 WHERE id = $1")
                    .bind(id)
                    .bind(status)
            }
            JobUpdate::CancelRequested => {
                sqlx::query("UPDATE download_jobs SET cancel_requested = TRUE WHERE id = $1")
                    .bind(id)
            }
            JobUpdate::WorkingDirectory(path) => {
                sqlx::query("UPDATE download_jobs SET working_directory = $2 WHERE id = $1")
                    .bind(id)
                    .bind(path_text(&path))
            }
            JobUpdate::Done { archive_path } => sqlx::query(
                "UPDATE download_jobs \
                    SET status = 'done', \
                    archive_path = $2 \
                WHERE id = $1",
            )
            .bind(id)
            .bind(path_text(&archive_path)),
            JobUpdate::Failed { error_detail } => sqlx::query(
                "UPDATE download_jobs \
                    SET status = 'failed', \
                    error_detail = $2 \
                WHERE id = $1",
            )
            .bind(id)
            .bind(error_detail),
        };

        let result = query.execute(&*self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn exists(&self, id: JobId) -> Result<bool, StoreError> {
        let found: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM download_jobs WHERE id = $1)")
                .bind(id)
                .fetch_one(&*self.pool)
                .await?;
        Ok(found)
    }

    #[instrument(name = "db.delete", skip_all, fields(job_id = %id))]
    async fn delete(&self, id: JobId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM download_jobs WHERE id = $1")
            .bind(id)
            .execute(&*self.pool)
            .await?;
        Ok(())
    }

    async fn list_ids(&self) -> Result<Vec<JobId>, StoreError> {
        Ok(
            sqlx::query_scalar("SELECT id FROM download_jobs ORDER BY created_at ASC")
                .fetch_all(&*self.pool)
                .await?,
        )
    }
}

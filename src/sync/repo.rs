use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::sync::dto::{JobStatus, SyncJob};

/// Persistence boundary for sync jobs.
///
/// Contract highlights:
/// - `create_if_no_active` is atomic: under concurrent calls for the same
///   user exactly one job is created while any non-terminal job exists.
/// - `advance` applies only while the job is non-terminal and moving
///   forward (status order and progress both non-decreasing); transitions
///   into `error` bypass the progress guard. A blocked advance returns
///   `None` and leaves the row untouched.
/// - Only `completed` sets `completed_at`.
#[async_trait]
pub trait SyncJobStore: Send + Sync {
    async fn create_if_no_active(&self, user_id: Uuid) -> anyhow::Result<Option<SyncJob>>;

    async fn get(&self, job_id: Uuid) -> anyhow::Result<Option<SyncJob>>;

    async fn active_for_user(&self, user_id: Uuid) -> anyhow::Result<Option<SyncJob>>;

    async fn advance(
        &self,
        job_id: Uuid,
        status: JobStatus,
        progress: i32,
        message: &str,
        stage_data: Option<serde_json::Value>,
    ) -> anyhow::Result<Option<SyncJob>>;

    /// Marks a non-terminal job cancelled; returns false if it was already
    /// terminal.
    async fn cancel(&self, job_id: Uuid) -> anyhow::Result<bool>;

    /// Newest-first page of the user's jobs plus the unfiltered total.
    async fn history(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
        status: Option<JobStatus>,
    ) -> anyhow::Result<(Vec<SyncJob>, i64)>;

    /// Deletes terminal jobs beyond the newest `keep`; never touches a
    /// non-terminal job.
    async fn prune(&self, user_id: Uuid, keep: i64) -> anyhow::Result<u64>;

    async fn last_completed_at(&self, user_id: Uuid) -> anyhow::Result<Option<OffsetDateTime>>;
}

const JOB_COLUMNS: &str =
    "id, user_id, status, progress, message, stage_data, created_at, updated_at, completed_at";

pub struct PgSyncJobStore {
    db: PgPool,
}

impl PgSyncJobStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SyncJobStore for PgSyncJobStore {
    async fn create_if_no_active(&self, user_id: Uuid) -> anyhow::Result<Option<SyncJob>> {
        // Insertion races resolve against the partial unique index on
        // (user_id) over non-terminal rows, not a read-then-write check.
        let job = sqlx::query_as::<_, SyncJob>(&format!(
            r#"
            INSERT INTO sync_jobs (id, user_id, status, progress, message)
            VALUES ($1, $2, 'starting', 0, 'Sync job queued')
            ON CONFLICT (user_id) WHERE status NOT IN ('completed', 'error', 'cancelled')
                DO NOTHING
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(user_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(job)
    }

    async fn get(&self, job_id: Uuid) -> anyhow::Result<Option<SyncJob>> {
        let job = sqlx::query_as::<_, SyncJob>(&format!(
            r#"SELECT {JOB_COLUMNS} FROM sync_jobs WHERE id = $1"#
        ))
        .bind(job_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(job)
    }

    async fn active_for_user(&self, user_id: Uuid) -> anyhow::Result<Option<SyncJob>> {
        let job = sqlx::query_as::<_, SyncJob>(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM sync_jobs
            WHERE user_id = $1 AND status NOT IN ('completed', 'error', 'cancelled')
            "#
        ))
        .bind(user_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(job)
    }

    async fn advance(
        &self,
        job_id: Uuid,
        status: JobStatus,
        progress: i32,
        message: &str,
        stage_data: Option<serde_json::Value>,
    ) -> anyhow::Result<Option<SyncJob>> {
        // Enum comparison follows declaration order, so `status <= $2`
        // rejects backwards stage transitions atomically.
        let job = sqlx::query_as::<_, SyncJob>(&format!(
            r#"
            UPDATE sync_jobs
            SET status = $2,
                progress = $3,
                message = $4,
                stage_data = COALESCE($5, stage_data),
                updated_at = now(),
                completed_at = CASE
                    WHEN $2 = 'completed'::sync_job_status THEN now()
                    ELSE completed_at
                END
            WHERE id = $1
              AND status NOT IN ('completed', 'error', 'cancelled')
              AND ($2 = 'error'::sync_job_status OR (progress <= $3 AND status <= $2))
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id)
        .bind(status)
        .bind(progress)
        .bind(message)
        .bind(stage_data)
        .fetch_optional(&self.db)
        .await?;
        Ok(job)
    }

    async fn cancel(&self, job_id: Uuid) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sync_jobs
            SET status = 'cancelled', message = 'Sync cancelled', updated_at = now()
            WHERE id = $1 AND status NOT IN ('completed', 'error', 'cancelled')
            "#,
        )
        .bind(job_id)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn history(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
        status: Option<JobStatus>,
    ) -> anyhow::Result<(Vec<SyncJob>, i64)> {
        let (jobs, total) = match status {
            Some(status) => {
                let jobs = sqlx::query_as::<_, SyncJob>(&format!(
                    r#"
                    SELECT {JOB_COLUMNS} FROM sync_jobs
                    WHERE user_id = $1 AND status = $2
                    ORDER BY created_at DESC
                    LIMIT $3 OFFSET $4
                    "#
                ))
                .bind(user_id)
                .bind(status)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.db)
                .await?;
                let total: i64 = sqlx::query_scalar(
                    r#"SELECT COUNT(*) FROM sync_jobs WHERE user_id = $1 AND status = $2"#,
                )
                .bind(user_id)
                .bind(status)
                .fetch_one(&self.db)
                .await?;
                (jobs, total)
            }
            None => {
                let jobs = sqlx::query_as::<_, SyncJob>(&format!(
                    r#"
                    SELECT {JOB_COLUMNS} FROM sync_jobs
                    WHERE user_id = $1
                    ORDER BY created_at DESC
                    LIMIT $2 OFFSET $3
                    "#
                ))
                .bind(user_id)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.db)
                .await?;
                let total: i64 =
                    sqlx::query_scalar(r#"SELECT COUNT(*) FROM sync_jobs WHERE user_id = $1"#)
                        .bind(user_id)
                        .fetch_one(&self.db)
                        .await?;
                (jobs, total)
            }
        };
        Ok((jobs, total))
    }

    async fn prune(&self, user_id: Uuid, keep: i64) -> anyhow::Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM sync_jobs
            WHERE user_id = $1
              AND status IN ('completed', 'error', 'cancelled')
              AND id NOT IN (
                  SELECT id FROM sync_jobs
                  WHERE user_id = $1 AND status IN ('completed', 'error', 'cancelled')
                  ORDER BY created_at DESC
                  LIMIT $2
              )
            "#,
        )
        .bind(user_id)
        .bind(keep)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected())
    }

    async fn last_completed_at(&self, user_id: Uuid) -> anyhow::Result<Option<OffsetDateTime>> {
        let at: Option<OffsetDateTime> = sqlx::query_scalar(
            r#"SELECT max(completed_at) FROM sync_jobs WHERE user_id = $1 AND status = 'completed'"#,
        )
        .bind(user_id)
        .fetch_one(&self.db)
        .await?;
        Ok(at)
    }
}

/// In-memory store with the same contract, for tests and single-process
/// fakes. One mutex serializes check-and-insert, which is what makes
/// `create_if_no_active` atomic here.
#[derive(Default)]
pub struct InMemorySyncJobStore {
    jobs: Mutex<HashMap<Uuid, SyncJob>>,
}

impl InMemorySyncJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SyncJobStore for InMemorySyncJobStore {
    async fn create_if_no_active(&self, user_id: Uuid) -> anyhow::Result<Option<SyncJob>> {
        let mut jobs = self.jobs.lock().expect("job store lock poisoned");
        let has_active = jobs
            .values()
            .any(|j| j.user_id == user_id && !j.status.is_terminal());
        if has_active {
            return Ok(None);
        }
        let now = OffsetDateTime::now_utc();
        let job = SyncJob {
            id: Uuid::new_v4(),
            user_id,
            status: JobStatus::Starting,
            progress: 0,
            message: "Sync job queued".into(),
            stage_data: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        jobs.insert(job.id, job.clone());
        Ok(Some(job))
    }

    async fn get(&self, job_id: Uuid) -> anyhow::Result<Option<SyncJob>> {
        Ok(self
            .jobs
            .lock()
            .expect("job store lock poisoned")
            .get(&job_id)
            .cloned())
    }

    async fn active_for_user(&self, user_id: Uuid) -> anyhow::Result<Option<SyncJob>> {
        Ok(self
            .jobs
            .lock()
            .expect("job store lock poisoned")
            .values()
            .find(|j| j.user_id == user_id && !j.status.is_terminal())
            .cloned())
    }

    async fn advance(
        &self,
        job_id: Uuid,
        status: JobStatus,
        progress: i32,
        message: &str,
        stage_data: Option<serde_json::Value>,
    ) -> anyhow::Result<Option<SyncJob>> {
        let mut jobs = self.jobs.lock().expect("job store lock poisoned");
        let Some(job) = jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        if job.status.is_terminal() {
            return Ok(None);
        }
        let forward = progress >= job.progress && status.order_index() >= job.status.order_index();
        if status != JobStatus::Error && !forward {
            return Ok(None);
        }

        let now = OffsetDateTime::now_utc();
        job.status = status;
        job.progress = progress;
        job.message = message.to_string();
        if let Some(data) = stage_data {
            job.stage_data = Some(data);
        }
        job.updated_at = now;
        if status == JobStatus::Completed {
            job.completed_at = Some(now);
        }
        Ok(Some(job.clone()))
    }

    async fn cancel(&self, job_id: Uuid) -> anyhow::Result<bool> {
        let mut jobs = self.jobs.lock().expect("job store lock poisoned");
        match jobs.get_mut(&job_id) {
            Some(job) if !job.status.is_terminal() => {
                job.status = JobStatus::Cancelled;
                job.message = "Sync cancelled".into();
                job.updated_at = OffsetDateTime::now_utc();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn history(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
        status: Option<JobStatus>,
    ) -> anyhow::Result<(Vec<SyncJob>, i64)> {
        let jobs = self.jobs.lock().expect("job store lock poisoned");
        let mut matching: Vec<SyncJob> = jobs
            .values()
            .filter(|j| j.user_id == user_id && status.map_or(true, |s| j.status == s))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = matching.len() as i64;
        let page = matching
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect();
        Ok((page, total))
    }

    async fn prune(&self, user_id: Uuid, keep: i64) -> anyhow::Result<u64> {
        let mut jobs = self.jobs.lock().expect("job store lock poisoned");
        let mut terminal: Vec<(Uuid, OffsetDateTime)> = jobs
            .values()
            .filter(|j| j.user_id == user_id && j.status.is_terminal())
            .map(|j| (j.id, j.created_at))
            .collect();
        terminal.sort_by(|a, b| b.1.cmp(&a.1));
        let stale: Vec<Uuid> = terminal
            .into_iter()
            .skip(keep.max(0) as usize)
            .map(|(id, _)| id)
            .collect();
        for id in &stale {
            jobs.remove(id);
        }
        Ok(stale.len() as u64)
    }

    async fn last_completed_at(&self, user_id: Uuid) -> anyhow::Result<Option<OffsetDateTime>> {
        Ok(self
            .jobs
            .lock()
            .expect("job store lock poisoned")
            .values()
            .filter(|j| j.user_id == user_id && j.status == JobStatus::Completed)
            .filter_map(|j| j.completed_at)
            .max())
    }
}

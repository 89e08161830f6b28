use std::sync::Arc;

use thiserror::Error;
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::RateLimitPolicy;
use crate::credentials::dto::PlainCredentials;
use crate::ratelimit::RateLimiter;
use crate::state::AppState;
use crate::sync::dto::{JobStatus, JobSummary, SyncJob};
use crate::sync::pipeline::{StageData, StageWorker, PIPELINE};
use crate::sync::repo::SyncJobStore;

/// Terminal jobs kept per user after opportunistic pruning.
const PRUNE_KEEP: i64 = 5;

#[derive(Debug, Error)]
pub enum SyncError {
    /// A non-terminal job already exists; carries it so pollers can attach.
    #[error("a sync job is already active for this user")]
    Conflict { job: Box<SyncJob> },
    #[error("sync trigger rate limit exceeded")]
    RateLimited { reset_at: OffsetDateTime },
    /// Covers both a missing job id and a job owned by someone else.
    #[error("job not found")]
    NotFound,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Creates, advances, and reports on per-user background sync jobs.
///
/// Triggering is fire-and-forget: the pipeline runs as a detached task and
/// clients observe progress exclusively by polling.
pub struct Orchestrator {
    jobs: Arc<dyn SyncJobStore>,
    stages: Arc<dyn StageWorker>,
    limiter: Arc<dyn RateLimiter>,
    trigger_policy: RateLimitPolicy,
}

impl Orchestrator {
    pub fn new(
        jobs: Arc<dyn SyncJobStore>,
        stages: Arc<dyn StageWorker>,
        limiter: Arc<dyn RateLimiter>,
        trigger_policy: RateLimitPolicy,
    ) -> Self {
        Self {
            jobs,
            stages,
            limiter,
            trigger_policy,
        }
    }

    pub fn from_state(state: &AppState) -> Self {
        Self::new(
            state.jobs.clone(),
            state.stages.clone(),
            state.limiter.clone(),
            state.config.limits.sync_trigger,
        )
    }

    pub async fn trigger(
        &self,
        user_id: Uuid,
        credentials: PlainCredentials,
        force: bool,
    ) -> Result<SyncJob, SyncError> {
        let decision = self.limiter.check(
            &format!("sync-trigger:{user_id}"),
            self.trigger_policy.max_attempts,
            self.trigger_policy.window(),
        );
        if !decision.allowed {
            return Err(SyncError::RateLimited {
                reset_at: decision.reset_at,
            });
        }

        if force {
            if let Some(active) = self.jobs.active_for_user(user_id).await? {
                // Best effort: a cancel failure is logged but does not block
                // the new job.
                match self.jobs.cancel(active.id).await {
                    Ok(true) => info!(job_id = %active.id, "force trigger cancelled active job"),
                    Ok(false) => {}
                    Err(e) => {
                        warn!(job_id = %active.id, error = %e, "failed to cancel active job")
                    }
                }
            }
        }

        // One retry covers the window where the blocking job reached a
        // terminal state between the failed insert and the conflict lookup.
        for _ in 0..2 {
            if let Some(job) = self.jobs.create_if_no_active(user_id).await? {
                info!(job_id = %job.id, user_id = %user_id, "sync job created");
                let jobs = Arc::clone(&self.jobs);
                let stages = Arc::clone(&self.stages);
                let job_id = job.id;
                let credentials = credentials.clone();
                tokio::spawn(async move {
                    run_pipeline(jobs, stages, job_id, user_id, credentials).await;
                });
                return Ok(job);
            }
            if let Some(existing) = self.jobs.active_for_user(user_id).await? {
                return Err(SyncError::Conflict {
                    job: Box::new(existing),
                });
            }
        }

        Err(SyncError::Internal(anyhow::anyhow!(
            "could not create a sync job or find the active one"
        )))
    }

    /// A job the requester does not own reads as missing, so outsiders
    /// cannot probe which job ids exist.
    pub async fn get_status(&self, requester: Uuid, job_id: Uuid) -> Result<SyncJob, SyncError> {
        match self.jobs.get(job_id).await? {
            Some(job) if job.user_id == requester => Ok(job),
            _ => Err(SyncError::NotFound),
        }
    }

    pub async fn cancel(&self, requester: Uuid, job_id: Uuid) -> Result<bool, SyncError> {
        let job = self.get_status(requester, job_id).await?;
        Ok(self.jobs.cancel(job.id).await?)
    }

    pub async fn history(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
        status: Option<JobStatus>,
    ) -> Result<(Vec<JobSummary>, i64), SyncError> {
        let limit = limit.clamp(1, 50);
        let offset = offset.max(0);
        let (jobs, total) = self.jobs.history(user_id, limit, offset, status).await?;
        Ok((jobs.into_iter().map(summarize).collect(), total))
    }
}

fn summarize(job: SyncJob) -> JobSummary {
    let duration_ms = job
        .status
        .is_terminal()
        .then(|| (job.updated_at - job.created_at).whole_milliseconds() as i64);
    JobSummary { job, duration_ms }
}

async fn run_pipeline(
    jobs: Arc<dyn SyncJobStore>,
    stages: Arc<dyn StageWorker>,
    job_id: Uuid,
    user_id: Uuid,
    credentials: PlainCredentials,
) {
    if !enter_stage(&jobs, job_id, JobStatus::Starting, None).await {
        return;
    }

    let mut prior: Option<StageData> = None;
    for stage in PIPELINE {
        // Cooperative cancellation: abort before the next stage's work
        // rather than completing over an externally cancelled job.
        match jobs.get(job_id).await {
            Ok(Some(job)) if job.status == JobStatus::Cancelled => {
                info!(job_id = %job_id, "job cancelled; aborting pipeline");
                return;
            }
            Ok(Some(_)) => {}
            Ok(None) => {
                warn!(job_id = %job_id, "job disappeared mid-pipeline");
                return;
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "failed to read job state; aborting");
                return;
            }
        }

        let prior_json = prior.as_ref().and_then(|d| serde_json::to_value(d).ok());
        if !enter_stage(&jobs, job_id, stage, prior_json).await {
            return;
        }

        match stages.run(stage, &credentials, prior.as_ref()).await {
            Ok(data) => prior = Some(data),
            Err(e) => {
                warn!(job_id = %job_id, stage = stage.as_str(), error = %e, "stage failed");
                let advanced = jobs
                    .advance(
                        job_id,
                        JobStatus::Error,
                        stage.progress_target(),
                        &e.to_string(),
                        None,
                    )
                    .await;
                if let Err(e) = advanced {
                    warn!(job_id = %job_id, error = %e, "failed to record stage failure");
                }
                finish(&jobs, user_id).await;
                return;
            }
        }
    }

    let final_json = prior.as_ref().and_then(|d| serde_json::to_value(d).ok());
    match jobs
        .advance(
            job_id,
            JobStatus::Completed,
            JobStatus::Completed.progress_target(),
            JobStatus::Completed.running_message(),
            final_json,
        )
        .await
    {
        Ok(Some(_)) => info!(job_id = %job_id, user_id = %user_id, "sync completed"),
        Ok(None) => info!(job_id = %job_id, "job cancelled before completion"),
        Err(e) => warn!(job_id = %job_id, error = %e, "failed to record completion"),
    }
    finish(&jobs, user_id).await;
}

/// Advances into `stage` at its canonical progress. Returns false when the
/// transition was rejected, which means the job was cancelled or otherwise
/// moved under us; the pipeline aborts in that case.
async fn enter_stage(
    jobs: &Arc<dyn SyncJobStore>,
    job_id: Uuid,
    stage: JobStatus,
    stage_data: Option<serde_json::Value>,
) -> bool {
    match jobs
        .advance(
            job_id,
            stage,
            stage.progress_target(),
            stage.running_message(),
            stage_data,
        )
        .await
    {
        Ok(Some(_)) => true,
        Ok(None) => {
            info!(job_id = %job_id, stage = stage.as_str(), "stage transition rejected; aborting pipeline");
            false
        }
        Err(e) => {
            warn!(job_id = %job_id, stage = stage.as_str(), error = %e, "failed to advance job; aborting");
            false
        }
    }
}

async fn finish(jobs: &Arc<dyn SyncJobStore>, user_id: Uuid) {
    if let Err(e) = jobs.prune(user_id, PRUNE_KEEP).await {
        warn!(user_id = %user_id, error = %e, "job pruning failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::InMemoryRateLimiter;
    use crate::sync::pipeline::CourseRef;
    use crate::sync::repo::InMemorySyncJobStore;
    use async_trait::async_trait;
    use std::time::Duration;

    fn canned(stage: JobStatus) -> StageData {
        match stage {
            JobStatus::CreatingTables => StageData::Tables {
                created: vec!["courses".into(), "course_items".into()],
            },
            JobStatus::FetchingCourses => StageData::Courses {
                courses: vec![CourseRef {
                    id: "c1".into(),
                    name: "Intro to Systems".into(),
                }],
            },
            JobStatus::AnalyzingContent => StageData::Analysis {
                items_analyzed: 4,
                course_count: 1,
            },
            JobStatus::ClassifyingData => StageData::Classification {
                assignments: 2,
                exams: 1,
                lectures: 1,
                other: 0,
            },
            _ => StageData::Saved { records_written: 4 },
        }
    }

    struct InstantWorker;

    #[async_trait]
    impl StageWorker for InstantWorker {
        async fn run(
            &self,
            stage: JobStatus,
            _credentials: &PlainCredentials,
            _prior: Option<&StageData>,
        ) -> anyhow::Result<StageData> {
            Ok(canned(stage))
        }
    }

    struct SlowWorker {
        delay: Duration,
    }

    #[async_trait]
    impl StageWorker for SlowWorker {
        async fn run(
            &self,
            stage: JobStatus,
            _credentials: &PlainCredentials,
            _prior: Option<&StageData>,
        ) -> anyhow::Result<StageData> {
            tokio::time::sleep(self.delay).await;
            Ok(canned(stage))
        }
    }

    struct FailingWorker {
        fail_at: JobStatus,
        message: &'static str,
    }

    #[async_trait]
    impl StageWorker for FailingWorker {
        async fn run(
            &self,
            stage: JobStatus,
            _credentials: &PlainCredentials,
            _prior: Option<&StageData>,
        ) -> anyhow::Result<StageData> {
            if stage == self.fail_at {
                anyhow::bail!("{}", self.message);
            }
            Ok(canned(stage))
        }
    }

    fn credentials() -> PlainCredentials {
        PlainCredentials {
            username: "alice".into(),
            password: "p@ss1".into(),
            institution_id: "bgu".into(),
        }
    }

    fn orchestrator(
        stages: Arc<dyn StageWorker>,
        max_triggers: u32,
    ) -> (Orchestrator, Arc<InMemorySyncJobStore>) {
        let store = Arc::new(InMemorySyncJobStore::new());
        let orch = Orchestrator::new(
            store.clone(),
            stages,
            Arc::new(InMemoryRateLimiter::new()),
            RateLimitPolicy {
                max_attempts: max_triggers,
                window_minutes: 10,
            },
        );
        (orch, store)
    }

    async fn wait_terminal(store: &InMemorySyncJobStore, job_id: Uuid) -> SyncJob {
        for _ in 0..400 {
            let job = store.get(job_id).await.expect("get").expect("job exists");
            if job.status.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {job_id} never reached a terminal state");
    }

    #[tokio::test]
    async fn pipeline_runs_to_completion() {
        let (orch, store) = orchestrator(Arc::new(InstantWorker), 5);
        let user = Uuid::new_v4();

        let job = orch.trigger(user, credentials(), false).await.expect("trigger");
        assert_eq!(job.status, JobStatus::Starting);

        let done = wait_terminal(&store, job.id).await;
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.progress, 100);
        assert_eq!(done.message, "Synchronization completed successfully");
        assert!(done.completed_at.is_some());

        let data = done.stage_data.expect("final stage data persisted");
        assert_eq!(data["stage"], "saved");
        assert_eq!(data["records_written"], 4);
    }

    #[tokio::test]
    async fn second_trigger_conflicts_with_active_job() {
        let (orch, store) = orchestrator(
            Arc::new(SlowWorker {
                delay: Duration::from_millis(50),
            }),
            5,
        );
        let user = Uuid::new_v4();

        let first = orch.trigger(user, credentials(), false).await.expect("first trigger");
        let second = orch.trigger(user, credentials(), false).await;

        match second {
            Err(SyncError::Conflict { job }) => {
                assert_eq!(job.id, first.id);
                assert!(!job.status.is_terminal());
            }
            other => panic!("expected conflict, got {other:?}"),
        }

        wait_terminal(&store, first.id).await;
    }

    #[tokio::test]
    async fn concurrent_triggers_create_exactly_one_job() {
        let (orch, store) = orchestrator(
            Arc::new(SlowWorker {
                delay: Duration::from_millis(50),
            }),
            5,
        );
        let user = Uuid::new_v4();

        let (a, b) = tokio::join!(
            orch.trigger(user, credentials(), false),
            orch.trigger(user, credentials(), false)
        );

        let results = [a, b];
        let created = results.iter().filter(|r| r.is_ok()).count();
        let conflicts = results
            .iter()
            .filter(|r| matches!(**r, Err(SyncError::Conflict { .. })))
            .count();
        assert_eq!(created, 1);
        assert_eq!(conflicts, 1);

        let job = results
            .into_iter()
            .find_map(|r| r.ok())
            .expect("one trigger succeeded");
        wait_terminal(&store, job.id).await;
    }

    #[tokio::test]
    async fn force_trigger_cancels_the_active_job() {
        let (orch, store) = orchestrator(
            Arc::new(SlowWorker {
                delay: Duration::from_millis(50),
            }),
            5,
        );
        let user = Uuid::new_v4();

        let first = orch.trigger(user, credentials(), false).await.expect("first");
        let second = orch.trigger(user, credentials(), true).await.expect("forced");
        assert_ne!(first.id, second.id);

        let old = store.get(first.id).await.expect("get").expect("job");
        assert_eq!(old.status, JobStatus::Cancelled);

        let done = wait_terminal(&store, second.id).await;
        assert_eq!(done.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn trigger_is_rate_limited() {
        let (orch, store) = orchestrator(Arc::new(InstantWorker), 1);
        let user = Uuid::new_v4();

        let first = orch.trigger(user, credentials(), false).await.expect("first");
        wait_terminal(&store, first.id).await;

        match orch.trigger(user, credentials(), false).await {
            Err(SyncError::RateLimited { .. }) => {}
            other => panic!("expected rate limit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn retrigger_after_completion_is_allowed() {
        let (orch, store) = orchestrator(Arc::new(InstantWorker), 5);
        let user = Uuid::new_v4();

        let first = orch.trigger(user, credentials(), false).await.expect("first");
        wait_terminal(&store, first.id).await;

        let second = orch.trigger(user, credentials(), false).await.expect("second");
        assert_ne!(first.id, second.id);
        wait_terminal(&store, second.id).await;
    }

    #[tokio::test]
    async fn stage_failure_terminates_into_error() {
        let (orch, store) = orchestrator(
            Arc::new(FailingWorker {
                fail_at: JobStatus::AnalyzingContent,
                message: "institution timeout",
            }),
            5,
        );
        let user = Uuid::new_v4();

        let job = orch.trigger(user, credentials(), false).await.expect("trigger");
        let done = wait_terminal(&store, job.id).await;

        assert_eq!(done.status, JobStatus::Error);
        assert_eq!(done.message, "institution timeout");
        assert_eq!(done.progress, JobStatus::AnalyzingContent.progress_target());
        assert!(done.completed_at.is_none(), "error jobs leave completed_at unset");
    }

    #[tokio::test]
    async fn cancellation_aborts_the_pipeline_cooperatively() {
        let (orch, store) = orchestrator(
            Arc::new(SlowWorker {
                delay: Duration::from_millis(40),
            }),
            5,
        );
        let user = Uuid::new_v4();

        let job = orch.trigger(user, credentials(), false).await.expect("trigger");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(orch.cancel(user, job.id).await.expect("cancel"));

        let done = wait_terminal(&store, job.id).await;
        assert_eq!(done.status, JobStatus::Cancelled);

        // Give the worker time to finish its in-flight stage; the pipeline
        // must not overwrite the cancellation.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let after = store.get(job.id).await.expect("get").expect("job");
        assert_eq!(after.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn foreign_and_unknown_jobs_read_as_not_found() {
        let (orch, store) = orchestrator(Arc::new(InstantWorker), 5);
        let owner = Uuid::new_v4();
        let outsider = Uuid::new_v4();

        let job = orch.trigger(owner, credentials(), false).await.expect("trigger");
        wait_terminal(&store, job.id).await;

        assert!(matches!(
            orch.get_status(outsider, job.id).await,
            Err(SyncError::NotFound)
        ));
        assert!(matches!(
            orch.get_status(owner, Uuid::new_v4()).await,
            Err(SyncError::NotFound)
        ));
        assert!(orch.get_status(owner, job.id).await.is_ok());
    }

    #[tokio::test]
    async fn store_rejects_backwards_transitions() {
        let store = InMemorySyncJobStore::new();
        let user = Uuid::new_v4();
        let job = store.create_if_no_active(user).await.expect("create").expect("job");

        let advanced = store
            .advance(job.id, JobStatus::FetchingCourses, 35, "fetching", None)
            .await
            .expect("advance");
        assert!(advanced.is_some());

        // Status regression.
        assert!(store
            .advance(job.id, JobStatus::CreatingTables, 40, "tables", None)
            .await
            .expect("advance")
            .is_none());
        // Progress regression within the same stage.
        assert!(store
            .advance(job.id, JobStatus::FetchingCourses, 20, "fetching", None)
            .await
            .expect("advance")
            .is_none());

        let unchanged = store.get(job.id).await.expect("get").expect("job");
        assert_eq!(unchanged.status, JobStatus::FetchingCourses);
        assert_eq!(unchanged.progress, 35);
    }

    #[tokio::test]
    async fn error_transition_reports_free_form_progress() {
        let store = InMemorySyncJobStore::new();
        let user = Uuid::new_v4();
        let job = store.create_if_no_active(user).await.expect("create").expect("job");

        store
            .advance(job.id, JobStatus::FetchingCourses, 35, "fetching", None)
            .await
            .expect("advance")
            .expect("applied");
        store
            .advance(job.id, JobStatus::Error, 42, "institution timeout", None)
            .await
            .expect("advance")
            .expect("error applies despite the progress guard");

        let done = store.get(job.id).await.expect("get").expect("job");
        assert_eq!(done.status, JobStatus::Error);
        assert_eq!(done.progress, 42);
        assert_eq!(done.message, "institution timeout");
        assert!(done.completed_at.is_none());
    }

    #[tokio::test]
    async fn history_is_newest_first_with_durations_for_terminal_jobs() {
        let orch = {
            let store = Arc::new(InMemorySyncJobStore::new());
            Orchestrator::new(
                store.clone(),
                Arc::new(InstantWorker),
                Arc::new(InMemoryRateLimiter::new()),
                RateLimitPolicy {
                    max_attempts: 100,
                    window_minutes: 10,
                },
            )
        };
        let store = orch.jobs.clone();
        let user = Uuid::new_v4();

        for _ in 0..2 {
            let job = store.create_if_no_active(user).await.expect("create").expect("job");
            store
                .advance(job.id, JobStatus::Completed, 100, "done", None)
                .await
                .expect("advance");
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        let active = store.create_if_no_active(user).await.expect("create").expect("job");

        let (jobs, total) = orch.history(user, 10, 0, None).await.expect("history");
        assert_eq!(total, 3);
        assert_eq!(jobs[0].job.id, active.id);
        assert!(jobs[0].duration_ms.is_none());
        assert!(jobs[1].duration_ms.is_some());
        assert!(jobs[2].duration_ms.is_some());

        let (completed_only, completed_total) = orch
            .history(user, 10, 0, Some(JobStatus::Completed))
            .await
            .expect("history");
        assert_eq!(completed_total, 2);
        assert!(completed_only.iter().all(|j| j.job.status == JobStatus::Completed));
    }

    #[tokio::test]
    async fn orchestrator_wires_up_from_app_state() {
        use crate::state::AppState;

        let state = AppState::fake();
        let orch = Orchestrator::from_state(&state);
        let user = Uuid::new_v4();

        let job = orch.trigger(user, credentials(), false).await.expect("trigger");
        for _ in 0..400 {
            let current = state.jobs.get(job.id).await.expect("get").expect("job");
            if current.status.is_terminal() {
                assert_eq!(current.status, JobStatus::Completed);
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job never completed against the fake state");
    }

    #[tokio::test]
    async fn prune_keeps_newest_terminal_jobs_and_active_ones() {
        let store = InMemorySyncJobStore::new();
        let user = Uuid::new_v4();

        let mut terminal_ids = Vec::new();
        for _ in 0..7 {
            let job = store.create_if_no_active(user).await.expect("create").expect("job");
            store
                .advance(job.id, JobStatus::Completed, 100, "done", None)
                .await
                .expect("advance");
            terminal_ids.push(job.id);
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        let active = store.create_if_no_active(user).await.expect("create").expect("job");

        let removed = store.prune(user, PRUNE_KEEP).await.expect("prune");
        assert_eq!(removed, 2);

        // The two oldest terminal jobs are gone, the rest remain.
        assert!(store.get(terminal_ids[0]).await.expect("get").is_none());
        assert!(store.get(terminal_ids[1]).await.expect("get").is_none());
        for id in &terminal_ids[2..] {
            assert!(store.get(*id).await.expect("get").is_some());
        }
        assert!(store.get(active.id).await.expect("get").is_some());
    }
}

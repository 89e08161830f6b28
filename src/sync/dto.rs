use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// Job lifecycle. Work stages are ordered and cannot be skipped; `error`
/// is reachable from any non-terminal stage, `cancelled` only through
/// explicit cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "sync_job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Starting,
    CreatingTables,
    FetchingCourses,
    AnalyzingContent,
    ClassifyingData,
    SavingToDatabase,
    Completed,
    Error,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::CreatingTables => "creating_tables",
            Self::FetchingCourses => "fetching_courses",
            Self::AnalyzingContent => "analyzing_content",
            Self::ClassifyingData => "classifying_data",
            Self::SavingToDatabase => "saving_to_database",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Cancelled)
    }

    /// Position in the fixed sequence; used to reject backwards transitions.
    pub fn order_index(self) -> u8 {
        match self {
            Self::Starting => 0,
            Self::CreatingTables => 1,
            Self::FetchingCourses => 2,
            Self::AnalyzingContent => 3,
            Self::ClassifyingData => 4,
            Self::SavingToDatabase => 5,
            Self::Completed => 6,
            Self::Error => 7,
            Self::Cancelled => 8,
        }
    }

    /// Canonical progress reported when a job enters this stage.
    pub fn progress_target(self) -> i32 {
        match self {
            Self::Starting => 5,
            Self::CreatingTables => 15,
            Self::FetchingCourses => 35,
            Self::AnalyzingContent => 55,
            Self::ClassifyingData => 75,
            Self::SavingToDatabase => 90,
            Self::Completed => 100,
            Self::Error | Self::Cancelled => 0,
        }
    }

    pub fn running_message(self) -> &'static str {
        match self {
            Self::Starting => "Starting data synchronization",
            Self::CreatingTables => "Preparing workspace tables",
            Self::FetchingCourses => "Fetching courses from the university system",
            Self::AnalyzingContent => "Analyzing course content",
            Self::ClassifyingData => "Classifying extracted data",
            Self::SavingToDatabase => "Processing and storing data",
            Self::Completed => "Synchronization completed successfully",
            Self::Error => "Synchronization failed",
            Self::Cancelled => "Sync cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct SyncJob {
    pub id: Uuid,
    pub user_id: Uuid,
    pub status: JobStatus,
    pub progress: i32,
    pub message: String,
    pub stage_data: Option<serde_json::Value>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TriggerRequest {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Serialize)]
pub struct TriggerResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
}

/// 409 payload carrying the already-active job, so pollers can attach to it.
#[derive(Debug, Serialize)]
pub struct ConflictResponse {
    pub error: String,
    pub job_id: Uuid,
    pub status: JobStatus,
    pub progress: i32,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub status: Option<JobStatus>,
}

#[derive(Debug, Serialize)]
pub struct JobSummary {
    #[serde(flatten)]
    pub job: SyncJob,
    /// Wall time from creation to the last update; only set once terminal.
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct HistoryPage {
    pub jobs: Vec<JobSummary>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

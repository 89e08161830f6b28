use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tracing::{error, instrument, warn};
use uuid::Uuid;

use crate::{
    credentials::{dto::PlainCredentials, repo::EncryptedCredential},
    session::jwt::AuthUser,
    state::AppState,
    sync::{
        dto::{
            CancelResponse, ConflictResponse, HistoryPage, HistoryQuery, TriggerRequest,
            TriggerResponse,
        },
        services::{Orchestrator, SyncError},
    },
    vault::EncryptedPayload,
};

pub fn sync_routes() -> Router<AppState> {
    Router::new()
        .route("/sync", post(trigger_sync))
        .route("/sync/jobs/:id", get(job_status))
        .route("/sync/jobs/:id/cancel", post(cancel_job))
        .route("/sync/history", get(sync_history))
}

/// Fire-and-forget trigger: returns 202 with the job id immediately, 409
/// with the active job when one exists, 429 when the trigger budget is
/// exhausted. Clients poll `/sync/jobs/:id` for progress.
#[instrument(skip(state, payload))]
pub async fn trigger_sync(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    payload: Option<Json<TriggerRequest>>,
) -> Result<Response, (StatusCode, String)> {
    let force = payload.map(|Json(p)| p.force).unwrap_or(false);

    let Some(record) = EncryptedCredential::find_by_user(&state.db, user_id)
        .await
        .map_err(|e| {
            error!(error = %e, "credential lookup failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        })?
    else {
        return Err((
            StatusCode::BAD_REQUEST,
            "No stored university credentials; complete setup first".into(),
        ));
    };

    let payload_enc = EncryptedPayload {
        encrypted_username: record.encrypted_username.clone(),
        encrypted_password: record.encrypted_password.clone(),
        auth_tag: record.auth_tag.clone(),
        iv: record.iv.clone(),
    };
    let (username, password) = state.vault.decrypt(&payload_enc).map_err(|e| {
        warn!(user_id = %user_id, error = %e, "stored credentials unusable");
        (
            StatusCode::BAD_REQUEST,
            "Stored credentials are unusable; please re-enter them".into(),
        )
    })?;

    let credentials = PlainCredentials {
        username,
        password,
        institution_id: record.institution_id.clone(),
    };

    let orchestrator = Orchestrator::from_state(&state);
    match orchestrator.trigger(user_id, credentials, force).await {
        Ok(job) => Ok((
            StatusCode::ACCEPTED,
            Json(TriggerResponse {
                job_id: job.id,
                status: job.status,
            }),
        )
            .into_response()),
        Err(SyncError::Conflict { job }) => Ok((
            StatusCode::CONFLICT,
            Json(ConflictResponse {
                error: "A sync job is already running".into(),
                job_id: job.id,
                status: job.status,
                progress: job.progress,
            }),
        )
            .into_response()),
        Err(SyncError::RateLimited { reset_at }) => Err((
            StatusCode::TOO_MANY_REQUESTS,
            format!("Sync trigger limit reached; retry after {reset_at}"),
        )),
        Err(SyncError::NotFound) => Err((StatusCode::NOT_FOUND, "Job not found".into())),
        Err(SyncError::Internal(e)) => {
            error!(error = %e, "sync trigger failed");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to start sync".into(),
            ))
        }
    }
}

fn map_sync_error(e: SyncError) -> (StatusCode, String) {
    match e {
        SyncError::NotFound => (StatusCode::NOT_FOUND, "Job not found".into()),
        SyncError::Conflict { .. } => (
            StatusCode::CONFLICT,
            "A sync job is already running".into(),
        ),
        SyncError::RateLimited { reset_at } => (
            StatusCode::TOO_MANY_REQUESTS,
            format!("Rate limit exceeded; retry after {reset_at}"),
        ),
        SyncError::Internal(e) => {
            error!(error = %e, "sync operation failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "Sync operation failed".into())
        }
    }
}

#[instrument(skip(state))]
pub async fn job_status(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(job_id): Path<Uuid>,
) -> Result<Response, (StatusCode, String)> {
    let orchestrator = Orchestrator::from_state(&state);
    let job = orchestrator
        .get_status(user_id, job_id)
        .await
        .map_err(map_sync_error)?;
    Ok(Json(job).into_response())
}

#[instrument(skip(state))]
pub async fn cancel_job(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(job_id): Path<Uuid>,
) -> Result<Json<CancelResponse>, (StatusCode, String)> {
    let orchestrator = Orchestrator::from_state(&state);
    let cancelled = orchestrator
        .cancel(user_id, job_id)
        .await
        .map_err(map_sync_error)?;
    Ok(Json(CancelResponse { cancelled }))
}

#[instrument(skip(state))]
pub async fn sync_history(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryPage>, (StatusCode, String)> {
    let limit = query.limit.unwrap_or(10);
    let offset = query.offset.unwrap_or(0);

    let orchestrator = Orchestrator::from_state(&state);
    let (jobs, total) = orchestrator
        .history(user_id, limit, offset, query.status)
        .await
        .map_err(map_sync_error)?;

    Ok(Json(HistoryPage {
        jobs,
        total,
        limit: limit.clamp(1, 50),
        offset: offset.max(0),
    }))
}

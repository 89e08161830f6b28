use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, State},
    http::StatusCode,
    routing::post,
    Json, Router,
};
use time::OffsetDateTime;
use tracing::{error, info, instrument, warn};

use crate::{
    credentials::{
        dto::{CredentialsRequest, RevalidateResponse, SaveCredentialsResponse, ValidationResponse},
        repo::{attempt_kind, EncryptedCredential},
        services::{self, CredentialError},
    },
    ratelimit::Decision,
    session::{jwt::AuthUser, repo::User, services as session_services},
    state::AppState,
};

pub fn credential_routes() -> Router<AppState> {
    Router::new()
        .route("/validate-credentials", post(validate_arbitrary))
        .route("/credentials/test", post(test_credentials))
        .route("/credentials/revalidate", post(revalidate_credentials))
        .route("/credentials", post(save_credentials).delete(revoke_credentials))
}

fn rate_limited(decision: &Decision) -> (StatusCode, String) {
    (
        StatusCode::TOO_MANY_REQUESTS,
        format!("Too many attempts; retry after {}", decision.reset_at),
    )
}

fn map_credential_error(e: CredentialError) -> (StatusCode, String) {
    match e {
        CredentialError::InstitutionNotSupported(id) => (
            StatusCode::BAD_REQUEST,
            format!("Institution {id} is not supported"),
        ),
        CredentialError::Internal(e) => {
            error!(error = %e, "credential validation failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "Validation failed".into())
        }
    }
}

fn validation_response(report: services::ValidationReport) -> ValidationResponse {
    ValidationResponse {
        success: report.success,
        message: report.message,
        institution_id: report.institution.id.to_string(),
        institution_name: report.institution.name.to_string(),
        response_time_ms: report.response_time_ms,
    }
}

/// Pre-session credential check, keyed by client IP with a tight budget.
#[instrument(skip(state, payload))]
pub async fn validate_arbitrary(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(payload): Json<CredentialsRequest>,
) -> Result<Json<ValidationResponse>, (StatusCode, String)> {
    let policy = state.config.limits.anonymous_credential_test;
    let decision = state.limiter.check(
        &format!("cred-check:{}", addr.ip()),
        policy.max_attempts,
        policy.window(),
    );
    if !decision.allowed {
        warn!(ip = %addr.ip(), "anonymous credential check rate limited");
        return Err(rate_limited(&decision));
    }

    let report = services::validate(
        &state,
        &addr.ip().to_string(),
        attempt_kind::CREDENTIAL_TEST,
        &payload.username,
        &payload.password,
        &payload.institution_id,
    )
    .await
    .map_err(map_credential_error)?;

    Ok(Json(validation_response(report)))
}

/// Authenticated "test my credentials" call, keyed by user.
#[instrument(skip(state, payload))]
pub async fn test_credentials(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(payload): Json<CredentialsRequest>,
) -> Result<Json<ValidationResponse>, (StatusCode, String)> {
    let policy = state.config.limits.credential_test;
    let decision = state.limiter.check(
        &format!("cred-test:{user_id}"),
        policy.max_attempts,
        policy.window(),
    );
    if !decision.allowed {
        warn!(user_id = %user_id, "credential test rate limited");
        return Err(rate_limited(&decision));
    }

    let report = services::validate(
        &state,
        &user_id.to_string(),
        attempt_kind::CREDENTIAL_TEST,
        &payload.username,
        &payload.password,
        &payload.institution_id,
    )
    .await
    .map_err(map_credential_error)?;

    Ok(Json(validation_response(report)))
}

/// Validates, encrypts, and stores the credential pair, completing stage 2.
/// A successful save clears the user's test limiter so an immediate sync
/// trigger is not penalized.
#[instrument(skip(state, payload))]
pub async fn save_credentials(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(payload): Json<CredentialsRequest>,
) -> Result<Json<SaveCredentialsResponse>, (StatusCode, String)> {
    let policy = state.config.limits.credential_test;
    let limiter_key = format!("cred-test:{user_id}");
    let decision = state
        .limiter
        .check(&limiter_key, policy.max_attempts, policy.window());
    if !decision.allowed {
        warn!(user_id = %user_id, "credential save rate limited");
        return Err(rate_limited(&decision));
    }

    let report = services::validate(
        &state,
        &user_id.to_string(),
        attempt_kind::CREDENTIAL_TEST,
        &payload.username,
        &payload.password,
        &payload.institution_id,
    )
    .await
    .map_err(map_credential_error)?;

    if !report.success {
        return Err((StatusCode::UNPROCESSABLE_ENTITY, report.message));
    }

    let encrypted = state
        .vault
        .encrypt(&payload.username, &payload.password)
        .map_err(|e| {
            error!(error = %e, "credential encryption failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to store credentials".into())
        })?;

    let institution = report.institution;
    EncryptedCredential::upsert(
        &state.db,
        user_id,
        institution.id,
        &encrypted,
        true,
        Some(OffsetDateTime::now_utc()),
    )
    .await
    .map_err(|e| {
        error!(error = %e, "credential upsert failed");
        (StatusCode::INTERNAL_SERVER_ERROR, "Failed to store credentials".into())
    })?;

    User::set_setup_complete(&state.db, user_id, true, Some(institution.id))
        .await
        .map_err(|e| {
            error!(error = %e, "setup flag update failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to store credentials".into())
        })?;

    state.limiter.reset(&limiter_key);
    info!(user_id = %user_id, institution = institution.id, "credentials stored");

    let session = session_services::derive_session(&state, user_id)
        .await
        .map_err(|e| {
            error!(error = %e, "session refresh after save failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        })?
        .map(|(_, view)| view)
        .ok_or((StatusCode::UNAUTHORIZED, "User not found".to_string()))?;

    Ok(Json(SaveCredentialsResponse {
        success: true,
        message: "Credentials validated and stored".into(),
        session,
    }))
}

/// Re-runs validation for the stored credential and persists the outcome.
/// A corrupted stored secret degrades to `valid: false` instead of erroring.
#[instrument(skip(state))]
pub async fn revalidate_credentials(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<RevalidateResponse>, (StatusCode, String)> {
    let policy = state.config.limits.credential_test;
    let decision = state.limiter.check(
        &format!("cred-test:{user_id}"),
        policy.max_attempts,
        policy.window(),
    );
    if !decision.allowed {
        warn!(user_id = %user_id, "credential revalidation rate limited");
        return Err(rate_limited(&decision));
    }

    let valid = services::revalidate_stored(&state, user_id).await.map_err(|e| {
        error!(error = %e, "credential revalidation failed");
        (StatusCode::INTERNAL_SERVER_ERROR, "Revalidation failed".into())
    })?;

    Ok(Json(RevalidateResponse { valid }))
}

/// Explicit revocation: deletes the stored credential and drops the user
/// back to stage 1. This is the only stage-2 to stage-1 transition.
#[instrument(skip(state))]
pub async fn revoke_credentials(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<StatusCode, (StatusCode, String)> {
    let removed = EncryptedCredential::delete_for_user(&state.db, user_id)
        .await
        .map_err(|e| {
            error!(error = %e, "credential revocation failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        })?;

    User::set_setup_complete(&state.db, user_id, false, None)
        .await
        .map_err(|e| {
            error!(error = %e, "setup flag clear failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        })?;

    info!(user_id = %user_id, removed, "institution access revoked");
    Ok(StatusCode::NO_CONTENT)
}

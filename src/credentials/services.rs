use thiserror::Error;
use time::{Duration, OffsetDateTime};
use tracing::{info, warn};
use uuid::Uuid;

use crate::credentials::repo::{attempt_kind, AuthAttempt, EncryptedCredential};
use crate::institutions::{self, Institution};
use crate::state::AppState;
use crate::vault::{CredentialVault, EncryptedPayload};

/// A credential older than this needs revalidation, independent of whether
/// the last check succeeded.
pub const REVALIDATION_MAX_AGE_DAYS: i64 = 30;

pub fn needs_revalidation(last_validated_at: Option<OffsetDateTime>) -> bool {
    match last_validated_at {
        None => true,
        Some(at) => OffsetDateTime::now_utc() - at > Duration::days(REVALIDATION_MAX_AGE_DAYS),
    }
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("institution `{0}` is not supported")]
    InstitutionNotSupported(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug)]
pub struct ValidationReport {
    pub success: bool,
    pub message: String,
    pub institution: &'static Institution,
    pub response_time_ms: i64,
}

/// Decides whether a (username, password, institution) triple currently
/// authenticates. Exactly one auth attempt row is written per invocation,
/// success or failure, before returning. Never retries.
pub async fn validate(
    state: &AppState,
    identifier: &str,
    kind: &'static str,
    username: &str,
    password: &str,
    institution_id: &str,
) -> Result<ValidationReport, CredentialError> {
    let Some(institution) = institutions::find(institution_id) else {
        AuthAttempt::record(
            &state.db,
            identifier,
            kind,
            None,
            false,
            Some("institution not supported"),
            0,
        )
        .await?;
        return Err(CredentialError::InstitutionNotSupported(
            institution_id.to_string(),
        ));
    };

    let started = std::time::Instant::now();
    let outcome = state
        .provider
        .authenticate(username, password, institution)
        .await;
    let response_time_ms = started.elapsed().as_millis() as i64;

    AuthAttempt::record(
        &state.db,
        identifier,
        kind,
        Some(institution.id),
        outcome.success,
        (!outcome.success).then_some(outcome.message.as_str()),
        response_time_ms as i32,
    )
    .await?;

    if outcome.success {
        info!(identifier, institution = institution.id, response_time_ms, "credential validation succeeded");
    } else {
        warn!(identifier, institution = institution.id, message = %outcome.message, "credential validation failed");
    }

    Ok(ValidationReport {
        success: outcome.success,
        message: outcome.message,
        institution,
        response_time_ms,
    })
}

/// Re-checks the stored credential and persists the updated validity.
///
/// Corruption of the stored secret degrades the user to "needs re-entry"
/// instead of failing the caller: any structural or decryption failure
/// marks the record invalid and returns `false`.
pub async fn revalidate_stored(state: &AppState, user_id: Uuid) -> anyhow::Result<bool> {
    let Some(record) = EncryptedCredential::find_by_user(&state.db, user_id).await? else {
        return Ok(false);
    };

    let payload = EncryptedPayload {
        encrypted_username: record.encrypted_username.clone(),
        encrypted_password: record.encrypted_password.clone(),
        auth_tag: record.auth_tag.clone(),
        iv: record.iv.clone(),
    };

    if !CredentialVault::validate_structure(&payload) {
        warn!(user_id = %user_id, "stored credential is structurally invalid; marking invalid");
        EncryptedCredential::set_validity(&state.db, user_id, &record.institution_id, false, None)
            .await?;
        return Ok(false);
    }

    let (username, password) = match state.vault.decrypt(&payload) {
        Ok(pair) => pair,
        Err(e) => {
            warn!(user_id = %user_id, error = %e, "stored credential failed decryption; marking invalid");
            EncryptedCredential::set_validity(
                &state.db,
                user_id,
                &record.institution_id,
                false,
                None,
            )
            .await?;
            return Ok(false);
        }
    };

    let report = match validate(
        state,
        &user_id.to_string(),
        attempt_kind::REVALIDATION,
        &username,
        &password,
        &record.institution_id,
    )
    .await
    {
        Ok(report) => report,
        Err(CredentialError::InstitutionNotSupported(_)) => {
            EncryptedCredential::set_validity(
                &state.db,
                user_id,
                &record.institution_id,
                false,
                None,
            )
            .await?;
            return Ok(false);
        }
        Err(CredentialError::Internal(e)) => return Err(e),
    };

    EncryptedCredential::set_validity(
        &state.db,
        user_id,
        &record.institution_id,
        report.success,
        Some(OffsetDateTime::now_utc()),
    )
    .await?;

    Ok(report.success)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staleness_boundary_is_thirty_days() {
        let now = OffsetDateTime::now_utc();
        assert!(!needs_revalidation(Some(now - Duration::days(29))));
        assert!(needs_revalidation(Some(now - Duration::days(31))));
    }

    #[test]
    fn never_validated_needs_revalidation() {
        assert!(needs_revalidation(None));
    }
}

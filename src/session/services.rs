use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use crate::credentials::repo::{attempt_kind, AuthAttempt, EncryptedCredential};
use crate::credentials::services::needs_revalidation;
use crate::institutions;
use crate::session::dto::{AuthStage, SessionView};
use crate::session::repo::User;
use crate::state::AppState;

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

#[derive(Debug, Error)]
pub enum LoginError {
    #[error("identity token could not be verified")]
    InvalidToken(#[source] anyhow::Error),
    #[error("email domain `{0}` is not associated with a supported institution")]
    DomainNotSupported(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Pure projection of persisted state into the unified identity view.
///
/// Deriving a session never mutates anything: a missing credential record
/// reads as stage 1, and an invalidated credential clears
/// `has_valid_credentials` without demoting the persisted stage.
pub fn project(
    user: &User,
    credential: Option<&EncryptedCredential>,
    last_sync_at: Option<OffsetDateTime>,
) -> SessionView {
    let stage = if user.setup_complete && credential.is_some() {
        AuthStage::Stage2Complete
    } else {
        AuthStage::Stage1Complete
    };

    let institution_id = credential
        .map(|c| c.institution_id.clone())
        .or_else(|| user.institution_id.clone());
    let institution_name = institution_id
        .as_deref()
        .and_then(institutions::find)
        .map(|i| i.name.to_string());

    SessionView {
        stage,
        institution_id,
        institution_name,
        has_valid_credentials: credential.map_or(false, |c| c.is_valid),
        needs_revalidation: credential.map_or(false, |c| needs_revalidation(c.last_validated_at)),
        last_sync_at,
    }
}

pub async fn derive_session(
    state: &AppState,
    user_id: Uuid,
) -> anyhow::Result<Option<(User, SessionView)>> {
    let Some(user) = User::find_by_id(&state.db, user_id).await? else {
        return Ok(None);
    };
    let credential = EncryptedCredential::find_by_user(&state.db, user_id).await?;
    let last_sync_at = state.jobs.last_completed_at(user_id).await?;
    let view = project(&user, credential.as_ref(), last_sync_at);
    Ok(Some((user, view)))
}

/// Completes stage 1: verifies the identity token, matches the email domain
/// to a supported institution, and creates the user row if absent. Every
/// outcome, including a domain rejection, leaves one auth attempt record.
pub async fn login_stage1(
    state: &AppState,
    id_token: &str,
) -> Result<(User, SessionView), LoginError> {
    let identity = state
        .verifier
        .verify(id_token)
        .await
        .map_err(LoginError::InvalidToken)?;

    tracing::debug!(subject = %identity.subject, "identity token verified");
    let email = identity.email.trim().to_lowercase();
    if !is_valid_email(&email) {
        return Err(LoginError::InvalidToken(anyhow::anyhow!(
            "identity token carried a malformed email"
        )));
    }

    let Some(institution) = institutions::find_by_email_domain(&email) else {
        let domain = email.rsplit_once('@').map(|(_, d)| d).unwrap_or(&email);
        warn!(email = %email, "stage-1 login rejected: unsupported email domain");
        AuthAttempt::record(
            &state.db,
            &email,
            attempt_kind::DOMAIN_REJECTED,
            None,
            false,
            Some("email domain not associated with a supported institution"),
            0,
        )
        .await?;
        return Err(LoginError::DomainNotSupported(domain.to_string()));
    };

    let user = User::upsert_by_email(&state.db, &email, institution.id).await?;
    AuthAttempt::record(
        &state.db,
        &email,
        attempt_kind::STAGE1_LOGIN,
        Some(institution.id),
        true,
        None,
        0,
    )
    .await?;
    info!(user_id = %user.id, institution = institution.id, "stage-1 login complete");

    let credential = EncryptedCredential::find_by_user(&state.db, user.id).await?;
    let last_sync_at = state.jobs.last_completed_at(user.id).await?;
    let view = project(&user, credential.as_ref(), last_sync_at);
    Ok((user, view))
}

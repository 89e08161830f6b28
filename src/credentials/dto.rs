use serde::{Deserialize, Serialize};

use crate::session::dto::SessionView;

/// Request body for testing or saving a university credential pair.
#[derive(Debug, Deserialize)]
pub struct CredentialsRequest {
    pub username: String,
    pub password: String,
    pub institution_id: String,
}

/// Decrypted credential pair handed to the validator and the sync
/// pipeline. Lives only in memory; persistence goes through the vault.
#[derive(Debug, Clone)]
pub struct PlainCredentials {
    pub username: String,
    pub password: String,
    pub institution_id: String,
}

/// Outcome of a credential validation, as returned to the client.
#[derive(Debug, Serialize)]
pub struct ValidationResponse {
    pub success: bool,
    pub message: String,
    pub institution_id: String,
    pub institution_name: String,
    pub response_time_ms: i64,
}

/// Returned after a successful save, carrying the refreshed identity view.
#[derive(Debug, Serialize)]
pub struct SaveCredentialsResponse {
    pub success: bool,
    pub message: String,
    pub session: SessionView,
}

/// Result of re-checking the stored credential against the institution.
#[derive(Debug, Serialize)]
pub struct RevalidateResponse {
    pub valid: bool,
}

use jsonwebtoken::{DecodingKey, EncodingKey};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use time::OffsetDateTime;
use uuid::Uuid;

/// Where a user sits in the two-stage login flow.
///
/// `Stage1Complete` means the identity-provider login succeeded for a
/// supported email domain; `Stage2Complete` additionally requires a
/// validated, stored university credential.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuthStage {
    Unauthenticated,
    Stage1Complete,
    Stage2Complete,
}

/// JWT claims carried by the session token.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: Uuid,
    pub email: String,
    pub stage: AuthStage,
    pub institution: Option<String>,
    pub exp: usize,
    pub iat: usize,
    pub iss: String,
    pub aud: String,
}

/// Holds JWT signing and verification keys with config data.
#[derive(Clone)]
pub struct JwtKeys {
    pub encoding: EncodingKey,
    pub decoding: DecodingKey,
    pub issuer: String,
    pub audience: String,
    pub ttl: Duration,
}

/// Request body for the stage-1 (Google) login.
#[derive(Debug, Deserialize)]
pub struct GoogleLoginRequest {
    pub id_token: String,
}

/// Read-only projection of a user's authentication state.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SessionView {
    pub stage: AuthStage,
    pub institution_id: Option<String>,
    pub institution_name: Option<String>,
    pub has_valid_credentials: bool,
    pub needs_revalidation: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_sync_at: Option<OffsetDateTime>,
}

/// Public part of the user returned to the client.
#[derive(Debug, Serialize)]
pub struct PublicUser {
    pub id: Uuid,
    pub email: String,
}

/// Response returned after login or session refresh.
#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub token: String,
    pub user: PublicUser,
    pub session: SessionView,
}

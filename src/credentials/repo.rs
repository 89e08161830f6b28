use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::vault::EncryptedPayload;

/// Kinds recorded in the append-only auth attempt trail.
pub mod attempt_kind {
    pub const STAGE1_LOGIN: &str = "stage1_login";
    pub const DOMAIN_REJECTED: &str = "domain_rejected";
    pub const CREDENTIAL_TEST: &str = "credential_test";
    pub const REVALIDATION: &str = "revalidation";
}

/// One encrypted credential record per (user, institution) pair.
///
/// Written only through the vault's output; `is_valid` is flipped by the
/// validator, never by the vault itself.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EncryptedCredential {
    pub user_id: Uuid,
    pub institution_id: String,
    #[serde(skip_serializing)]
    pub encrypted_username: String,
    #[serde(skip_serializing)]
    pub encrypted_password: String,
    #[serde(skip_serializing)]
    pub auth_tag: String,
    #[serde(skip_serializing)]
    pub iv: String,
    pub is_valid: bool,
    pub last_validated_at: Option<OffsetDateTime>,
    pub expires_at: Option<OffsetDateTime>,
    pub updated_at: OffsetDateTime,
}

impl EncryptedCredential {
    pub async fn find_by_user(db: &PgPool, user_id: Uuid) -> anyhow::Result<Option<Self>> {
        let record = sqlx::query_as::<_, Self>(
            r#"
            SELECT user_id, institution_id, encrypted_username, encrypted_password,
                   auth_tag, iv, is_valid, last_validated_at, expires_at, updated_at
            FROM university_credentials
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(db)
        .await?;
        Ok(record)
    }

    pub async fn upsert(
        db: &PgPool,
        user_id: Uuid,
        institution_id: &str,
        payload: &EncryptedPayload,
        is_valid: bool,
        last_validated_at: Option<OffsetDateTime>,
    ) -> anyhow::Result<Self> {
        let record = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO university_credentials
                (user_id, institution_id, encrypted_username, encrypted_password,
                 auth_tag, iv, is_valid, last_validated_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, now())
            ON CONFLICT (user_id, institution_id) DO UPDATE SET
                encrypted_username = EXCLUDED.encrypted_username,
                encrypted_password = EXCLUDED.encrypted_password,
                auth_tag = EXCLUDED.auth_tag,
                iv = EXCLUDED.iv,
                is_valid = EXCLUDED.is_valid,
                last_validated_at = EXCLUDED.last_validated_at,
                updated_at = now()
            RETURNING user_id, institution_id, encrypted_username, encrypted_password,
                      auth_tag, iv, is_valid, last_validated_at, expires_at, updated_at
            "#,
        )
        .bind(user_id)
        .bind(institution_id)
        .bind(&payload.encrypted_username)
        .bind(&payload.encrypted_password)
        .bind(&payload.auth_tag)
        .bind(&payload.iv)
        .bind(is_valid)
        .bind(last_validated_at)
        .fetch_one(db)
        .await?;
        Ok(record)
    }

    pub async fn set_validity(
        db: &PgPool,
        user_id: Uuid,
        institution_id: &str,
        is_valid: bool,
        last_validated_at: Option<OffsetDateTime>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE university_credentials
            SET is_valid = $3,
                last_validated_at = COALESCE($4, last_validated_at),
                updated_at = now()
            WHERE user_id = $1 AND institution_id = $2
            "#,
        )
        .bind(user_id)
        .bind(institution_id)
        .bind(is_valid)
        .bind(last_validated_at)
        .execute(db)
        .await?;
        Ok(())
    }

    /// Removes the stored credential on explicit revocation.
    pub async fn delete_for_user(db: &PgPool, user_id: Uuid) -> anyhow::Result<u64> {
        let result = sqlx::query(r#"DELETE FROM university_credentials WHERE user_id = $1"#)
            .bind(user_id)
            .execute(db)
            .await?;
        Ok(result.rows_affected())
    }
}

/// Append-only audit trail of authentication attempts.
pub struct AuthAttempt;

impl AuthAttempt {
    pub async fn record(
        db: &PgPool,
        identifier: &str,
        kind: &str,
        institution_id: Option<&str>,
        success: bool,
        error_message: Option<&str>,
        response_time_ms: i32,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO auth_attempts
                (identifier, kind, institution_id, success, error_message, response_time_ms)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(identifier)
        .bind(kind)
        .bind(institution_id)
        .bind(success)
        .bind(error_message)
        .bind(response_time_ms)
        .execute(db)
        .await?;
        Ok(())
    }
}

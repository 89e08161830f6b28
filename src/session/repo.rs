use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub institution_id: Option<String>,
    pub setup_complete: bool,
    pub created_at: OffsetDateTime,
}

impl User {
    pub async fn find_by_id(db: &PgPool, id: Uuid) -> anyhow::Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, email, institution_id, setup_complete, created_at
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(db)
        .await?;
        Ok(user)
    }

    /// Creates the user on first stage-1 login; subsequent logins return the
    /// existing row. The institution learned from the email domain is only
    /// filled in when not already set.
    pub async fn upsert_by_email(
        db: &PgPool,
        email: &str,
        institution_id: &str,
    ) -> anyhow::Result<User> {
        let user = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (email, institution_id)
            VALUES ($1, $2)
            ON CONFLICT (email) DO UPDATE
                SET institution_id = COALESCE(users.institution_id, EXCLUDED.institution_id)
            RETURNING id, email, institution_id, setup_complete, created_at
            "#,
        )
        .bind(email)
        .bind(institution_id)
        .fetch_one(db)
        .await?;
        Ok(user)
    }

    /// Flips the stage-2 marker. Set on a validated credential save, cleared
    /// on revocation.
    pub async fn set_setup_complete(
        db: &PgPool,
        id: Uuid,
        setup_complete: bool,
        institution_id: Option<&str>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE users
            SET setup_complete = $2,
                institution_id = COALESCE($3, institution_id)
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(setup_complete)
        .bind(institution_id)
        .execute(db)
        .await?;
        Ok(())
    }
}

use axum::{
    extract::{FromRef, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use tracing::{error, instrument};

use crate::{
    session::{
        dto::{AuthResponse, GoogleLoginRequest, JwtKeys, PublicUser, SessionView},
        jwt::AuthUser,
        repo::User,
        services::{self, LoginError},
    },
    state::AppState,
};

pub fn session_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/google", post(google_login))
        .route("/auth/session", get(get_session))
        .route("/auth/session/refresh", post(refresh_session))
}

fn sign_response(
    state: &AppState,
    user: User,
    session: SessionView,
) -> Result<Json<AuthResponse>, (StatusCode, String)> {
    let keys = JwtKeys::from_ref(state);
    let token = keys
        .sign(user.id, &user.email, session.stage, session.institution_id.as_deref())
        .map_err(|e| {
            error!(error = %e, "jwt sign failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        })?;
    Ok(Json(AuthResponse {
        token,
        user: PublicUser {
            id: user.id,
            email: user.email,
        },
        session,
    }))
}

#[instrument(skip(state, payload))]
pub async fn google_login(
    State(state): State<AppState>,
    Json(payload): Json<GoogleLoginRequest>,
) -> Result<Json<AuthResponse>, (StatusCode, String)> {
    let (user, session) = match services::login_stage1(&state, &payload.id_token).await {
        Ok(ok) => ok,
        Err(LoginError::InvalidToken(_)) => {
            return Err((StatusCode::UNAUTHORIZED, "Invalid identity token".into()));
        }
        Err(LoginError::DomainNotSupported(domain)) => {
            return Err((
                StatusCode::FORBIDDEN,
                format!("Email domain {domain} is not associated with a supported institution"),
            ));
        }
        Err(LoginError::Internal(e)) => {
            error!(error = %e, "stage-1 login failed");
            return Err((StatusCode::INTERNAL_SERVER_ERROR, "Login failed".into()));
        }
    };

    sign_response(&state, user, session)
}

#[instrument(skip(state))]
pub async fn get_session(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<SessionView>, (StatusCode, String)> {
    let derived = services::derive_session(&state, user_id).await.map_err(|e| {
        error!(error = %e, user_id = %user_id, "derive session failed");
        (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?;

    match derived {
        Some((_, view)) => Ok(Json(view)),
        None => Err((StatusCode::UNAUTHORIZED, "User not found".into())),
    }
}

/// The only client-triggered session refresh path, used after a successful
/// institution-credential save so cached identity does not go stale.
#[instrument(skip(state))]
pub async fn refresh_session(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<AuthResponse>, (StatusCode, String)> {
    let derived = services::derive_session(&state, user_id).await.map_err(|e| {
        error!(error = %e, user_id = %user_id, "session refresh failed");
        (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?;

    match derived {
        Some((user, view)) => sign_response(&state, user, view),
        None => Err((StatusCode::UNAUTHORIZED, "User not found".into())),
    }
}

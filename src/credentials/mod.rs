use crate::state::AppState;
use axum::Router;

pub mod dto;
pub mod handlers;
pub mod provider;
pub mod repo;
pub mod services;

pub fn router() -> Router<AppState> {
    handlers::credential_routes()
}

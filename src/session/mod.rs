use crate::state::AppState;
use axum::Router;

pub mod dto;
pub mod google;
pub mod handlers;
pub mod jwt;
pub mod repo;
pub mod services;

pub fn router() -> Router<AppState> {
    handlers::session_routes()
}

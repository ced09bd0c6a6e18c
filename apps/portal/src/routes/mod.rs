pub mod health;

use axum::{
    routing::{get, post},
    Router,
};

use crate::auth::handlers;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        // Session
        .route("/api/v1/session", get(handlers::handle_get_session))
        .route("/api/v1/auth/sign-in", post(handlers::handle_sign_in))
        .route("/api/v1/auth/sign-up", post(handlers::handle_sign_up))
        .route("/api/v1/auth/sign-out", post(handlers::handle_sign_out))
        // Role
        .route(
            "/api/v1/role",
            get(handlers::handle_get_role).put(handlers::handle_select_role),
        )
        .route("/api/v1/role/refresh", post(handlers::handle_refresh_role))
        // Identifiers carried alongside identity
        .route(
            "/api/v1/identifiers/:name",
            get(handlers::handle_get_identifier).put(handlers::handle_put_identifier),
        )
        .with_state(state)
}

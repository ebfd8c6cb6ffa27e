pub mod health;

use axum::{
    routing::{get, post},
    Router,
};

use crate::conversation::handlers;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        .route(
            "/api/v1/assistant-turn",
            post(handlers::handle_assistant_turn),
        )
        .route(
            "/api/v1/conversations/:analysis_id/thread",
            get(handlers::handle_locate_thread),
        )
        .route(
            "/api/v1/conversations/:analysis_id/context",
            get(handlers::handle_get_context),
        )
        .route(
            "/api/v1/conversations/:analysis_id/messages",
            get(handlers::handle_list_messages),
        )
        .with_state(state)
}

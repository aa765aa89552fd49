//! API layer -- axum routes, handlers, and error mapping.

mod error;
mod routes;
pub mod state;

use axum::Router;
use tower_http::trace::TraceLayer;

use self::state::AppState;

pub use self::error::ApiError;

/// Build the application router with all API routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", routes::api_routes())
        .fallback(fallback)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn fallback() -> (axum::http::StatusCode, &'static str) {
    (axum::http::StatusCode::NOT_FOUND, "not found")
}

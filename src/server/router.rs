use axum::extract::DefaultBodyLimit;
use axum::routing::get;
use axum::Router;
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::app_state::AppState;
use crate::server::constants::MULTIPART_OVERHEAD_BYTES;
use crate::server::handlers;

/// Construct the application's HTTP router with all routes and middleware configured.
pub fn build_router(state: AppState) -> Router {
    let body_limit = state
        .config()
        .storage
        .max_payload_bytes
        .saturating_add(MULTIPART_OVERHEAD_BYTES) as usize;

    Router::new()
        .route(
            "/",
            get(handlers::usage_handler).post(handlers::upload_handler),
        )
        .route(
            "/:code",
            get(handlers::fetch_handler)
                .post(handlers::upload_handler)
                .delete(handlers::delete_handler),
        )
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(DefaultBodyLimit::max(body_limit))
                .layer(RequestBodyLimitLayer::new(body_limit)),
        )
        .with_state(state)
}

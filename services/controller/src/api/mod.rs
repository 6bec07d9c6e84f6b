//! HTTP API handlers and routing.

mod cloud_init;
pub mod error;
mod health;

use axum::{body::Body, extract::MatchedPath, http::Request, Router};
use tower_http::trace::TraceLayer;
use tracing::{info_span, Span};

pub use health::HealthResponse;

use crate::state::AppState;

/// Create the router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(health::routes())
        .merge(cloud_init::routes())
        .layer(TraceLayer::new_for_http().make_span_with(request_span))
        .with_state(state)
}

/// Request span keyed by the route template. Provisioning tokens travel in
/// the path, so the raw URI is never recorded.
fn request_span(request: &Request<Body>) -> Span {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(MatchedPath::as_str)
        .unwrap_or("unmatched");
    info_span!("http_request", method = %request.method(), route = %route)
}

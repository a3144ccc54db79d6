//! C11 — the HTTP surface: routes, request/response shapes, and the
//! rate-limiting middleware that sits in front of them.
//!
//! Grounded in the teacher's `main.rs::build_router` (a flat `Router::new()`
//! with routes merged in, security/CORS/trace/body-limit layered on top) —
//! the teacher's `Extension`-per-service wiring is replaced by one
//! `AppState` extracted via `State`, matching how `state.rs` is structured
//! here.

pub mod dto;
pub mod handlers;
pub mod middleware;

#[cfg(test)]
mod tests;

use axum::extract::DefaultBodyLimit;
use axum::http::HeaderValue;
use axum::routing::{get, post};
use axum::Router;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, TraceLayer};

use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    let max_body_bytes = state.settings.limits.max_body_bytes;
    let cors = build_cors(&state.settings.cors_origins);

    Router::new()
        .route("/", get(handlers::health))
        .route("/api/health", get(handlers::health))
        .route("/api/config", get(handlers::config))
        .route("/api/retriever/filters", get(handlers::filters))
        .route("/query", post(handlers::query))
        .route("/api/query", post(handlers::query))
        .route("/api/ask/stream", post(handlers::ask_stream))
        .route("/api/ask/async", post(handlers::ask_async))
        .route("/api/ask/async/{id}", get(handlers::ask_async_status))
        .route("/api/queue/stats", get(handlers::queue_stats))
        .route("/api/feedback", post(handlers::feedback))
        .route("/api/cache/stats", get(handlers::cache_stats))
        .route("/api/cache/clear", post(handlers::cache_clear))
        .layer(axum::middleware::from_fn_with_state(state.clone(), middleware::rate_limit))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(cors)
        .layer(TraceLayer::new_for_http().make_span_with(DefaultMakeSpan::default().include_headers(true)))
        .layer(CatchPanicLayer::new())
        .with_state(state)
}

fn build_cors(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::permissive();
    }
    let allow: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allow))
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any)
}

//! Per-IP rate limiting, applied ahead of every route `build_router`
//! registers. Grounded in the teacher's `security::middleware` (an
//! `axum::middleware::from_fn` gate in front of the whole protected
//! router), swapped for a `governor` token bucket keyed by client IP
//! instead of the teacher's header/IP-whitelist checks.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::ApiError;
use crate::state::AppState;

pub async fn rate_limit(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    if state.rate_limit.check(addr.ip()) {
        next.run(request).await
    } else {
        ApiError::RateLimited.into_response()
    }
}

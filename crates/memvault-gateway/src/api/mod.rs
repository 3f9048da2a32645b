// crates/memvault-gateway/src/api/mod.rs
// HTTP RPC surface: router, auth boundary and per-request deadlines

pub mod error;
pub mod handlers;

use crate::auth::{self, Caller, TokenValidator};
use crate::service::MemoryService;
use axum::{
    Router,
    extract::{DefaultBodyLimit, Request, State},
    http::{HeaderMap, header::AUTHORIZATION},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
};
use memvault_types::ErrorCode;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

pub use error::{ApiError, ApiResult};

/// Header carrying the caller's deadline in milliseconds
pub const TIMEOUT_HEADER: &str = "x-request-timeout-ms";

pub struct AppState {
    pub service: Arc<MemoryService>,
    pub validator: Option<Arc<dyn TokenValidator>>,
    pub default_timeout: Duration,
    pub max_timeout: Duration,
}

/// Budget for one request: the header value capped at `max`, else `default`.
pub fn request_deadline(headers: &HeaderMap, default: Duration, max: Duration) -> Duration {
    headers
        .get(TIMEOUT_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .map(|ms| Duration::from_millis(ms).min(max))
        .unwrap_or(default)
}

/// Room for JSON escaping and the embedding on top of the largest content
const BODY_OVERHEAD: usize = 1024 * 1024;

pub fn router(state: Arc<AppState>) -> Router {
    let body_limit = state
        .service
        .limits()
        .max_content_bytes
        .saturating_mul(2)
        .saturating_add(BODY_OVERHEAD);

    let rpc = Router::new()
        .route("/v1/memories", post(handlers::store_memory))
        .route("/v1/memories/search", post(handlers::search_memories))
        .route("/v1/memories/recent", get(handlers::recent_memories))
        .route("/v1/memories/query", post(handlers::query_memories))
        .route(
            "/v1/memories/{id}",
            get(handlers::get_memory)
                .delete(handlers::delete_memory)
                .patch(handlers::patch_memory),
        )
        .route("/v1/admin/keys/rotate", post(handlers::rotate_key))
        .route("/v1/admin/keys", get(handlers::list_keys))
        // Layers run bottom-up: the deadline covers token validation too
        .route_layer(middleware::from_fn_with_state(state.clone(), authenticate))
        .route_layer(middleware::from_fn_with_state(state.clone(), deadline));

    Router::new()
        .route("/health", get(handlers::health))
        .merge(rpc)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(DefaultBodyLimit::max(body_limit)),
        )
        .with_state(state)
}

/// Resolve the bearer token into a [`Caller`] extension.
async fn authenticate(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let caller = match &state.validator {
        None => Caller(None),
        Some(validator) => {
            let token = req
                .headers()
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(auth::bearer_token)
                .ok_or_else(|| ApiError::unauthorized("missing bearer token"))?;
            Caller(Some(validator.validate(token).await?))
        }
    };
    req.extensions_mut().insert(caller);
    Ok(next.run(req).await)
}

async fn deadline(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let budget = request_deadline(req.headers(), state.default_timeout, state.max_timeout);
    tokio::time::timeout(budget, next.run(req)).await.map_err(|_| {
        ApiError::new(
            ErrorCode::DeadlineExceeded,
            format!("request exceeded its {}ms deadline", budget.as_millis()),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn deadline_of(headers: &HeaderMap) -> Duration {
        request_deadline(headers, Duration::from_secs(30), Duration::from_secs(120))
    }

    #[test]
    fn test_deadline_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(deadline_of(&headers), Duration::from_secs(30));

        headers.insert(TIMEOUT_HEADER, HeaderValue::from_static("1500"));
        assert_eq!(deadline_of(&headers), Duration::from_millis(1500));

        headers.insert(TIMEOUT_HEADER, HeaderValue::from_static("999999999"));
        assert_eq!(deadline_of(&headers), Duration::from_secs(120));

        headers.insert(TIMEOUT_HEADER, HeaderValue::from_static("soon"));
        assert_eq!(deadline_of(&headers), Duration::from_secs(30));
    }
}

//! HTTP surface: the proxy fallback and the `/_precache` control routes.

mod middleware;

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Request, State},
    http::StatusCode,
    middleware as axum_middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use serde::Serialize;
use tracing::{debug, info};

use crate::{
    cancel::{CancelOnToken, CancellationRegistry},
    handler::{Handler, HandlerError, ProxyRequest},
    precache::{PreCache, PreCacheStats, ResponseStore},
    queue::PriorityTaskQueue,
};

pub use middleware::log_responses;

/// Shared state for the proxy router.
#[derive(Clone)]
pub struct ProxyState {
    /// Entry point of the handler stack.
    pub handler: Arc<dyn Handler>,
    pub precache: Option<Arc<PreCache>>,
    pub registry: Arc<CancellationRegistry>,
    pub max_body_bytes: usize,
}

impl ProxyState {
    /// Assemble `CancelOnToken → PreCache → upstream`, leaving out the
    /// pre-cache when `precache` is `None`.
    pub fn assemble(
        upstream: Arc<dyn Handler>,
        precache: Option<(PriorityTaskQueue, Arc<dyn ResponseStore>)>,
        registry: Arc<CancellationRegistry>,
        max_body_bytes: usize,
    ) -> Self {
        let precache =
            precache.map(|(queue, store)| Arc::new(PreCache::new(upstream.clone(), queue, store)));
        let inner: Arc<dyn Handler> = match &precache {
            Some(layer) => layer.clone() as Arc<dyn Handler>,
            None => upstream,
        };
        let handler = Arc::new(CancelOnToken::new(inner, Arc::clone(&registry)));

        Self {
            handler,
            precache,
            registry,
            max_body_bytes,
        }
    }
}

pub fn build_router(state: ProxyState) -> Router {
    Router::new()
        .route("/_precache/status", get(status))
        .route("/_precache/cancel/{token}", post(cancel))
        .route("/_precache/prioritize/{tag}", post(prioritize))
        .fallback(proxy)
        .layer(axum_middleware::from_fn(log_responses))
        .with_state(state)
}

async fn proxy(State(state): State<ProxyState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let body = match Limited::new(body, state.max_body_bytes).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) if err.downcast_ref::<LengthLimitError>().is_some() => {
            return (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response();
        }
        Err(err) => {
            return HandlerError::invalid(format!("failed to read request body: {err}"))
                .into_response();
        }
    };

    let request = ProxyRequest::new(parts.method, parts.uri, parts.headers, body);
    match state.handler.handle(request).await {
        Ok(response) => response.into_response(),
        Err(err) => err.into_response(),
    }
}

#[derive(Debug, Serialize)]
struct CancelView {
    token: String,
    discarded: usize,
}

/// Revoke a cancellation token and clear the pre-cache.
async fn cancel(State(state): State<ProxyState>, Path(token): Path<String>) -> Response {
    if !state.registry.revoke(&token) {
        return (StatusCode::NOT_FOUND, "unknown cancellation token").into_response();
    }

    let discarded = match &state.precache {
        Some(precache) => precache.clear().await,
        None => 0,
    };
    info!(token = %token, discarded, "cancellation requested");
    Json(CancelView { token, discarded }).into_response()
}

async fn prioritize(State(state): State<ProxyState>, Path(tag): Path<String>) -> Response {
    let Some(precache) = &state.precache else {
        return (StatusCode::SERVICE_UNAVAILABLE, "pre-cache is disabled").into_response();
    };
    debug!(tag = %tag, "prioritize requested");
    precache.queue().prioritize(tag);
    StatusCode::NO_CONTENT.into_response()
}

#[derive(Debug, Serialize)]
struct StatusView {
    enabled: bool,
    concurrency: Option<usize>,
    active_tag: Option<String>,
    #[serde(flatten)]
    stats: Option<PreCacheStats>,
    tokens: Vec<String>,
}

async fn status(State(state): State<ProxyState>) -> Json<StatusView> {
    let view = match &state.precache {
        Some(precache) => StatusView {
            enabled: true,
            concurrency: Some(precache.queue().concurrency().get()),
            active_tag: precache.queue().active_tag(),
            stats: Some(precache.stats().await),
            tokens: state.registry.names(),
        },
        None => StatusView {
            enabled: false,
            concurrency: None,
            active_tag: None,
            stats: None,
            tokens: state.registry.names(),
        },
    };
    Json(view)
}

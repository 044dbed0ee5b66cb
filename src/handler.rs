//! The request/response contract shared by every layer of the proxy.
//!
//! A [`Handler`] turns a fully buffered [`ProxyRequest`] into a
//! [`ProxyResponse`]. The cancellation and pre-cache layers are handlers that
//! wrap another handler; the upstream client sits at the bottom of the stack.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Header carrying the priority of a priming request.
pub const PRE_CACHE_HEADER: &str = "pre-cache";
/// Optional header carrying the steering tag of a priming request.
pub const PRE_CACHE_TAG_HEADER: &str = "pre-cache-tag";
/// Header set on acknowledgement responses.
pub const PRE_CACHE_STATUS_HEADER: &str = "pre-cache-status";
/// Header naming the cancellation token a request opts into.
pub const CANCEL_TOKEN_HEADER: &str = "cancel-token";

/// A cancellation token bound to a request, together with the name it was
/// registered under.
#[derive(Debug, Clone)]
pub struct CancelBinding {
    pub name: String,
    pub token: CancellationToken,
}

impl CancelBinding {
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cancelled_error(&self) -> HandlerError {
        HandlerError::Cancelled {
            token: self.name.clone(),
        }
    }
}

/// A buffered inbound request.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub cancel: Option<CancelBinding>,
}

impl ProxyRequest {
    pub fn new(method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            method,
            uri,
            headers,
            body,
            cancel: None,
        }
    }

    /// Convenience constructor used by tests and internal callers.
    pub fn post(uri: &'static str, body: impl Into<Bytes>) -> Self {
        Self::new(
            Method::POST,
            Uri::from_static(uri),
            HeaderMap::new(),
            body.into(),
        )
    }

    pub fn with_header(mut self, name: &'static str, value: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    /// Returns true once the bound cancellation token (if any) has fired.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelBinding::is_cancelled)
    }
}

/// A buffered response. Cheap to clone; the body is reference counted.
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ProxyResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    pub fn text(status: StatusCode, body: &'static str) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        Self::new(status, headers, Bytes::from_static(body.as_bytes()))
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

impl IntoResponse for ProxyResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// Failures a handler can report.
#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    #[error("request cancelled by token `{token}`")]
    Cancelled { token: String },
    #[error("upstream request failed: {message}")]
    Upstream { message: String },
    #[error("upstream request timed out")]
    Timeout,
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
}

impl HandlerError {
    pub fn upstream(message: impl Into<String>) -> Self {
        Self::Upstream {
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Cancelled { .. } => StatusCode::CONFLICT,
            Self::Upstream { .. } => StatusCode::BAD_GATEWAY,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Self::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
        }
    }

    /// Render the error as the response a client receives.
    ///
    /// Cancellations use the fixed body `canceled` so clients can tell them
    /// apart from genuine failures and drop them silently.
    pub fn to_proxy_response(&self) -> ProxyResponse {
        match self {
            Self::Cancelled { .. } => ProxyResponse::text(self.status(), "canceled"),
            _ => {
                let mut headers = HeaderMap::new();
                headers.insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("text/plain; charset=utf-8"),
                );
                ProxyResponse::new(self.status(), headers, self.to_string())
            }
        }
    }
}

impl IntoResponse for HandlerError {
    fn into_response(self) -> Response {
        if self.is_cancelled() {
            debug!(error = %self, "request cancelled");
        } else {
            warn!(error = %self, status = %self.status(), "request failed");
        }
        self.to_proxy_response().into_response()
    }
}

/// A unit that serves proxy requests.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, request: ProxyRequest) -> Result<ProxyResponse, HandlerError>;
}

#[async_trait]
impl<H> Handler for Arc<H>
where
    H: Handler + ?Sized,
{
    async fn handle(&self, request: ProxyRequest) -> Result<ProxyResponse, HandlerError> {
        (**self).handle(request).await
    }
}

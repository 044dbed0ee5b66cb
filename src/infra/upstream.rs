//! The network handler at the bottom of the stack.

use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, Uri, header};
use reqwest::{Client, Url};
use tracing::{debug, instrument};

use crate::handler::{
    CANCEL_TOKEN_HEADER, Handler, HandlerError, PRE_CACHE_HEADER, PRE_CACHE_TAG_HEADER,
    ProxyRequest, ProxyResponse,
};

use super::error::InfraError;

/// Headers never forwarded upstream.
const OUTBOUND_STRIPPED: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "upgrade",
    "host",
    "content-length",
    "transfer-encoding",
    PRE_CACHE_HEADER,
    PRE_CACHE_TAG_HEADER,
    CANCEL_TOKEN_HEADER,
];

/// Headers dropped from upstream responses; the body is re-framed locally.
const INBOUND_STRIPPED: &[HeaderName] = &[
    header::CONNECTION,
    header::CONTENT_LENGTH,
    header::TRANSFER_ENCODING,
];

/// Forwards buffered requests to a fixed upstream base URL.
#[derive(Clone, Debug)]
pub struct UpstreamHandler {
    client: Client,
    base: Url,
}

impl UpstreamHandler {
    pub fn new(base: Url, timeout: Duration) -> Result<Self, InfraError> {
        let client = Client::builder()
            .user_agent(Self::user_agent())
            .timeout(timeout)
            .build()
            .map_err(|err| InfraError::client(err.to_string()))?;
        Ok(Self { client, base })
    }

    pub fn user_agent() -> &'static str {
        concat!("precache/", env!("CARGO_PKG_VERSION"))
    }

    /// The upstream URL for an inbound URI: the base path followed by the
    /// request path, with the request's query string.
    pub fn target(&self, uri: &Uri) -> Url {
        let mut url = self.base.clone();
        let base_path = self.base.path().trim_end_matches('/');
        url.set_path(&format!("{base_path}{}", uri.path()));
        url.set_query(uri.query());
        url
    }

    async fn forward(&self, request: ProxyRequest) -> Result<ProxyResponse, HandlerError> {
        let url = self.target(&request.uri);
        let response = self
            .client
            .request(request.method, url)
            .headers(outbound_headers(&request.headers))
            .body(request.body)
            .send()
            .await
            .map_err(map_client_error)?;

        let status = response.status();
        let mut headers = response.headers().clone();
        for name in INBOUND_STRIPPED {
            headers.remove(name);
        }
        let body = response.bytes().await.map_err(map_client_error)?;

        debug!(status = %status, bytes = body.len(), "upstream responded");
        Ok(ProxyResponse::new(status, headers, body))
    }
}

#[async_trait]
impl Handler for UpstreamHandler {
    #[instrument(skip_all, fields(method = %request.method, path = %request.uri.path()))]
    async fn handle(&self, request: ProxyRequest) -> Result<ProxyResponse, HandlerError> {
        let Some(binding) = request.cancel.clone() else {
            return self.forward(request).await;
        };
        if binding.is_cancelled() {
            return Err(binding.cancelled_error());
        }

        tokio::select! {
            biased;
            _ = binding.token.cancelled() => {
                debug!(token = %binding.name, "upstream request cancelled");
                Err(binding.cancelled_error())
            }
            result = self.forward(request) => result,
        }
    }
}

fn outbound_headers(headers: &HeaderMap) -> HeaderMap {
    let mut forwarded = headers.clone();
    for name in OUTBOUND_STRIPPED {
        forwarded.remove(*name);
    }
    forwarded
}

fn map_client_error(err: reqwest::Error) -> HandlerError {
    if err.is_timeout() {
        HandlerError::Timeout
    } else {
        HandlerError::upstream(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use axum::{
        Router,
        body::Bytes,
        http::{HeaderValue, StatusCode},
        routing::post,
    };
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::handler::CancelBinding;

    fn handler(base: &str) -> UpstreamHandler {
        UpstreamHandler::new(Url::parse(base).expect("url"), Duration::from_secs(5))
            .expect("client builds")
    }

    async fn spawn_upstream(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        format!("http://{addr}/api/")
    }

    #[test]
    fn target_joins_base_path_and_query() {
        let upstream = handler("http://upstream.example/api/");
        let url = upstream.target(&Uri::from_static("/waveforms/query?format=fb"));
        assert_eq!(
            url.as_str(),
            "http://upstream.example/api/waveforms/query?format=fb"
        );

        let bare = handler("http://upstream.example");
        assert_eq!(
            bare.target(&Uri::from_static("/q")).as_str(),
            "http://upstream.example/q"
        );
    }

    #[test]
    fn control_headers_are_not_forwarded() {
        let mut headers = HeaderMap::new();
        headers.insert(PRE_CACHE_HEADER, HeaderValue::from_static("3"));
        headers.insert(CANCEL_TOKEN_HEADER, HeaderValue::from_static("X"));
        headers.insert(header::HOST, HeaderValue::from_static("proxy.local"));
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));

        let forwarded = outbound_headers(&headers);
        assert_eq!(forwarded.len(), 1);
        assert!(forwarded.contains_key(header::ACCEPT));
    }

    #[tokio::test]
    async fn forwards_body_and_returns_upstream_response() {
        let base = spawn_upstream(Router::new().route(
            "/api/echo",
            post(|body: Bytes| async move { (StatusCode::CREATED, body) }),
        ))
        .await;

        let response = handler(&base)
            .handle(ProxyRequest::post("/echo", "ping").with_header(PRE_CACHE_HEADER, "1"))
            .await
            .expect("upstream reachable");

        assert_eq!(response.status, StatusCode::CREATED);
        assert_eq!(response.body, Bytes::from_static(b"ping"));
        assert!(!response.headers.contains_key(header::CONTENT_LENGTH));
    }

    #[tokio::test]
    async fn cancelled_binding_short_circuits_before_io() {
        let token = CancellationToken::new();
        token.cancel();
        let mut request = ProxyRequest::post("/echo", "ping");
        request.cancel = Some(CancelBinding {
            name: "group".to_string(),
            token,
        });

        // Nothing listens on this port; a cancelled request never dials it.
        let error = handler("http://127.0.0.1:9/")
            .handle(request)
            .await
            .expect_err("cancelled");
        assert!(error.is_cancelled());
    }

    #[tokio::test]
    async fn revocation_interrupts_a_slow_upstream() {
        let base = spawn_upstream(Router::new().route(
            "/api/slow",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                "late"
            }),
        ))
        .await;

        let token = CancellationToken::new();
        let mut request = ProxyRequest::post("/slow", "{}");
        request.cancel = Some(CancelBinding {
            name: "group".to_string(),
            token: token.clone(),
        });

        let upstream = handler(&base);
        let call = tokio::spawn(async move { upstream.handle(request).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();

        let error = call.await.expect("join").expect_err("cancelled");
        assert!(error.is_cancelled());
    }
}

use std::sync::Arc;

use async_trait::async_trait;

use crate::handler::{CANCEL_TOKEN_HEADER, Handler, HandlerError, ProxyRequest, ProxyResponse};

use super::CancellationRegistry;

/// Binds requests that name a registered token to that token's live signal.
///
/// Requests without the header, or naming an unknown token, pass through
/// untouched. Cancellation is cooperative: the wrapped handler decides when to
/// observe the signal.
pub struct CancelOnToken {
    inner: Arc<dyn Handler>,
    registry: Arc<CancellationRegistry>,
}

impl CancelOnToken {
    pub fn new(inner: Arc<dyn Handler>, registry: Arc<CancellationRegistry>) -> Self {
        Self { inner, registry }
    }
}

#[async_trait]
impl Handler for CancelOnToken {
    async fn handle(&self, mut request: ProxyRequest) -> Result<ProxyResponse, HandlerError> {
        if let Some(binding) = request
            .header_str(CANCEL_TOKEN_HEADER)
            .and_then(|name| self.registry.bind(name.trim()))
        {
            request.cancel = Some(binding);
        }
        self.inner.handle(request).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use axum::http::StatusCode;

    use super::*;
    use crate::cancel::CANCEL_ON_INTERVAL_CLOSE;

    #[derive(Default)]
    struct Recording {
        bound: Mutex<Vec<Option<String>>>,
    }

    #[async_trait]
    impl Handler for Recording {
        async fn handle(&self, request: ProxyRequest) -> Result<ProxyResponse, HandlerError> {
            self.bound
                .lock()
                .unwrap()
                .push(request.cancel.as_ref().map(|binding| binding.name.clone()));
            Ok(ProxyResponse::text(StatusCode::OK, "ok"))
        }
    }

    #[tokio::test]
    async fn binds_known_tokens_and_ignores_unknown() {
        let recording = Arc::new(Recording::default());
        let registry = Arc::new(CancellationRegistry::new([CANCEL_ON_INTERVAL_CLOSE]));
        let layer = CancelOnToken::new(recording.clone(), registry);

        let known = ProxyRequest::post("/q", "a")
            .with_header(CANCEL_TOKEN_HEADER, CANCEL_ON_INTERVAL_CLOSE);
        let unknown = ProxyRequest::post("/q", "b").with_header(CANCEL_TOKEN_HEADER, "OTHER");
        let plain = ProxyRequest::post("/q", "c");

        for request in [known, unknown, plain] {
            layer.handle(request).await.expect("handled");
        }

        let bound = recording.bound.lock().unwrap().clone();
        assert_eq!(
            bound,
            vec![Some(CANCEL_ON_INTERVAL_CLOSE.to_string()), None, None]
        );
    }
}

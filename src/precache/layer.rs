//! Speculative priming and one-shot serving in front of another handler.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use bytes::Bytes;
use dashmap::{DashMap, mapref::entry::Entry};
use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use metrics::counter;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::handler::{
    Handler, HandlerError, PRE_CACHE_STATUS_HEADER, ProxyRequest, ProxyResponse,
};
use crate::queue::{PriorityTaskQueue, TaskOptions};

use super::{
    METRIC_HIT, METRIC_MISS, METRIC_PRIME_ACCEPTED, METRIC_PRIME_DUPLICATE, METRIC_PRIME_FAILED,
    METRIC_STORE_ERROR,
    keys::{PrimeMarker, content_hash, prime_marker},
    store::{ResponseStore, StoreError},
};

const STATUS_ACCEPTED: &str = "accepted";
const STATUS_DUPLICATE: &str = "duplicate-ignored";

/// Outcome of a priming job as seen by real requests: the response when
/// priming succeeded, `None` when it failed or was discarded.
type PrimeOutcome = Shared<BoxFuture<'static, Option<ProxyResponse>>>;

struct InFlight {
    generation: u64,
    outcome: PrimeOutcome,
}

type InFlightTable = DashMap<String, InFlight>;

/// Why a priming job produced nothing worth storing.
#[derive(Debug, Error)]
pub enum PrimeError {
    #[error("priming returned non-success status {0}")]
    Status(StatusCode),
    #[error(transparent)]
    Handler(#[from] HandlerError),
}

/// Point-in-time counters for the status endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreCacheStats {
    /// Priming jobs waiting for a slot.
    pub queued: usize,
    /// Priming jobs running under the concurrency limit.
    pub running: usize,
    /// Keys with a queued or running priming job.
    pub in_flight: usize,
    /// Stored responses, or `None` when the store could not be read.
    pub stored: Option<usize>,
}

/// Handler wrapper that primes responses ahead of need and serves each primed
/// response to the first real request that asks for it.
pub struct PreCache {
    inner: Arc<dyn Handler>,
    queue: PriorityTaskQueue,
    store: Arc<dyn ResponseStore>,
    in_flight: Arc<InFlightTable>,
    generation: AtomicU64,
    /// Bumped by every priming job as it leaves the in-flight table.
    settled: Arc<AtomicU64>,
}

impl PreCache {
    pub fn new(
        inner: Arc<dyn Handler>,
        queue: PriorityTaskQueue,
        store: Arc<dyn ResponseStore>,
    ) -> Self {
        Self {
            inner,
            queue,
            store,
            in_flight: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
            settled: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn queue(&self) -> &PriorityTaskQueue {
        &self.queue
    }

    /// Discard every queued priming job and empty the store.
    ///
    /// Jobs already running keep going; a result they produce after this call
    /// is still stored unless the job observes a cancellation first.
    pub async fn clear(&self) -> usize {
        let discarded = self.queue.clear();
        if let Err(err) = self.store.clear().await {
            store_failure("clear", &err);
        }
        info!(discarded, "pre-cache cleared");
        discarded
    }

    pub async fn stats(&self) -> PreCacheStats {
        let stored = match self.store.len().await {
            Ok(len) => Some(len),
            Err(err) => {
                store_failure("len", &err);
                None
            }
        };
        PreCacheStats {
            queued: self.queue.size(),
            running: self.queue.pending(),
            in_flight: self.in_flight.len(),
            stored,
        }
    }

    #[instrument(skip_all, fields(key = %key, priority = marker.priority))]
    async fn prime(
        &self,
        key: String,
        marker: PrimeMarker,
        request: ProxyRequest,
    ) -> Result<ProxyResponse, HandlerError> {
        let vacant = loop {
            if self.in_flight.contains_key(&key) {
                return Ok(self.duplicate(&key));
            }
            let settled = self.settled.load(Ordering::SeqCst);
            if self.is_stored(&key).await {
                return Ok(duplicate_ack());
            }
            match self.in_flight.entry(key.clone()) {
                Entry::Vacant(vacant) if self.settled.load(Ordering::SeqCst) == settled => {
                    break vacant;
                }
                // A job settled while the store was checked; its result may
                // now be stored, so look again.
                Entry::Vacant(_) => continue,
                Entry::Occupied(_) => {}
            }
            return Ok(self.duplicate(&key));
        };

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let guard = InFlightGuard {
            table: Arc::clone(&self.in_flight),
            settled: Arc::clone(&self.settled),
            key: key.clone(),
            generation,
        };
        let inner = Arc::clone(&self.inner);
        let store = Arc::clone(&self.store);
        let job_key = key.clone();

        let mut options = TaskOptions::new().id(key).priority(marker.priority);
        if let Some(tag) = marker.tag {
            options = options.tag(tag);
        }

        // Adding never drops a job, so the vacant entry's shard lock cannot
        // meet the guard's removal on this thread.
        let handle = self.queue.add(
            move || async move {
                let _guard = guard;
                run_prime(inner, store, job_key, request).await
            },
            options,
        );
        vacant.insert(InFlight {
            generation,
            outcome: async move { handle.await.ok() }.boxed().shared(),
        });

        counter!(METRIC_PRIME_ACCEPTED).increment(1);
        debug!("priming job queued");
        Ok(acknowledgement(StatusCode::OK, STATUS_ACCEPTED))
    }

    /// Acknowledge a priming request for a key already being primed, starting
    /// its job at once if it is still waiting for a slot.
    fn duplicate(&self, key: &str) -> ProxyResponse {
        if self.queue.now(key) {
            debug!("duplicate priming forced queued job to run now");
        }
        duplicate_ack()
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn serve(&self, key: String, request: ProxyRequest) -> Result<ProxyResponse, HandlerError> {
        let pending = self
            .in_flight
            .get(&key)
            .map(|entry| entry.outcome.clone());

        if let Some(outcome) = pending {
            if self.queue.now(&key) {
                debug!("forced queued priming job to run now");
            }
            let primed = match request.cancel.as_ref() {
                Some(binding) => {
                    tokio::select! {
                        biased;
                        _ = binding.token.cancelled() => return Err(binding.cancelled_error()),
                        primed = outcome => primed,
                    }
                }
                None => outcome.await,
            };
            if let Some(response) = primed {
                counter!(METRIC_HIT, "source" => "in_flight").increment(1);
                evict(self.store.as_ref(), &key).await;
                return Ok(response);
            }
            debug!("priming produced no response, forwarding");
        } else if let Some(response) = self.stored(&key).await {
            counter!(METRIC_HIT, "source" => "store").increment(1);
            evict(self.store.as_ref(), &key).await;
            return Ok(response);
        }

        counter!(METRIC_MISS).increment(1);
        self.inner.handle(request).await
    }

    async fn is_stored(&self, key: &str) -> bool {
        match self.store.contains(key).await {
            Ok(found) => found,
            Err(err) => {
                store_failure("contains", &err);
                false
            }
        }
    }

    async fn stored(&self, key: &str) -> Option<ProxyResponse> {
        match self.store.get(key).await {
            Ok(found) => found,
            Err(err) => {
                store_failure("get", &err);
                None
            }
        }
    }
}

#[async_trait]
impl Handler for PreCache {
    async fn handle(&self, request: ProxyRequest) -> Result<ProxyResponse, HandlerError> {
        let key = content_hash(&request.body);
        match prime_marker(&request)? {
            Some(marker) => self.prime(key, marker, request).await,
            None => self.serve(key, request).await,
        }
    }
}

async fn run_prime(
    inner: Arc<dyn Handler>,
    store: Arc<dyn ResponseStore>,
    key: String,
    request: ProxyRequest,
) -> Result<ProxyResponse, PrimeError> {
    let failure = match inner.handle(request).await {
        Ok(response) if response.is_success() => {
            if let Err(err) = store.put(&key, &response).await {
                store_failure("put", &err);
            }
            debug!(key = %key, "primed response stored");
            return Ok(response);
        }
        Ok(response) => PrimeError::Status(response.status),
        Err(err) => PrimeError::Handler(err),
    };

    counter!(METRIC_PRIME_FAILED).increment(1);
    evict(store.as_ref(), &key).await;
    Err(failure)
}

async fn evict(store: &dyn ResponseStore, key: &str) {
    if let Err(err) = store.remove(key).await {
        store_failure("remove", &err);
    }
}

fn store_failure(op: &'static str, err: &StoreError) {
    counter!(METRIC_STORE_ERROR, "op" => op).increment(1);
    warn!(op, error = %err, "pre-cache store unavailable, treating as miss");
}

fn acknowledgement(status: StatusCode, value: &'static str) -> ProxyResponse {
    let mut response = if status == StatusCode::NO_CONTENT {
        ProxyResponse::new(status, HeaderMap::new(), Bytes::new())
    } else {
        ProxyResponse::text(status, value)
    };
    response
        .headers
        .insert(PRE_CACHE_STATUS_HEADER, HeaderValue::from_static(value));
    response
}

fn duplicate_ack() -> ProxyResponse {
    counter!(METRIC_PRIME_DUPLICATE).increment(1);
    debug!("priming request ignored, key already primed");
    acknowledgement(StatusCode::NO_CONTENT, STATUS_DUPLICATE)
}

/// Removes a key's in-flight entry when its priming job settles or is
/// discarded. The generation check leaves a newer job under the same key alone.
///
/// `settled` is bumped before the entry is removed, so a priming request that
/// finds the entry gone also sees the bump.
struct InFlightGuard {
    table: Arc<InFlightTable>,
    settled: Arc<AtomicU64>,
    key: String,
    generation: u64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.settled.fetch_add(1, Ordering::SeqCst);
        self.table
            .remove_if(&self.key, |_, entry| entry.generation == self.generation);
    }
}

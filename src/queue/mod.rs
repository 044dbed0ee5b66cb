//! Bounded-concurrency priority scheduler.
//!
//! [`PriorityTaskQueue`] accepts deferred units of work with a priority, an
//! optional grouping tag and an optional identifier, and runs at most
//! `concurrency` of them at a time on the tokio runtime.
//!
//! Admission order is strict priority with FIFO tie-breaks, unless a steering
//! tag set by [`PriorityTaskQueue::prioritize`] selects the most recently queued
//! entry of that tag instead. Completion order is whatever the work's own I/O
//! produces.
//!
//! All bookkeeping happens in short critical sections that never span an
//! `.await`, and queued work is never dropped while the lock is held.

mod sequence;
mod task;

use std::{
    future::Future,
    num::NonZeroUsize,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex},
};

use futures::FutureExt;
use metrics::gauge;
use tracing::{debug, error, warn};

use crate::util::lock::mutex_lock;

use sequence::{OrderedSequence, QueueEntry};
use task::{Job, panic_message};

pub use task::{TaskError, TaskHandle, TaskOptions};

const SOURCE: &str = "queue";
const METRIC_QUEUE_PENDING: &str = "precache_queue_pending";
const METRIC_QUEUE_SIZE: &str = "precache_queue_size";

#[derive(Debug, Default)]
struct QueueState {
    sequence: OrderedSequence,
    /// Entries currently executing under the concurrency limit.
    pending: usize,
    active_tag: Option<String>,
    next_seq: u64,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<QueueState>,
    concurrency: NonZeroUsize,
}

/// A cloneable handle to a shared priority queue.
#[derive(Debug, Clone)]
pub struct PriorityTaskQueue {
    inner: Arc<Inner>,
}

impl PriorityTaskQueue {
    pub fn new(concurrency: NonZeroUsize) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState::default()),
                concurrency,
            }),
        }
    }

    /// Queue `work` and start it as soon as capacity allows.
    ///
    /// Never fails synchronously: failures and panics of the work surface only
    /// through the returned handle, and are logged here as well.
    pub fn add<F, Fut, T, E>(&self, work: F, options: TaskOptions) -> TaskHandle<T, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let (sender, receiver) = tokio::sync::oneshot::channel();
        let TaskOptions { id, tag, priority } = options;
        let log_id = id.clone();
        let log_tag = tag.clone();

        let run: Job = Box::new(move || {
            async move {
                let outcome = match AssertUnwindSafe(async move { work().await })
                    .catch_unwind()
                    .await
                {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(err)) => {
                        warn!(
                            task_id = log_id.as_deref(),
                            task_tag = log_tag.as_deref(),
                            error = %err,
                            "queued task failed"
                        );
                        Err(TaskError::Failed(err))
                    }
                    Err(payload) => {
                        let message = panic_message(payload.as_ref());
                        error!(
                            task_id = log_id.as_deref(),
                            task_tag = log_tag.as_deref(),
                            panic = %message,
                            "queued task panicked"
                        );
                        Err(TaskError::Panicked(message))
                    }
                };
                // The caller may have dropped its handle; the work still counts as done.
                let _ = sender.send(outcome);
            }
            .boxed()
        });

        {
            let mut state = mutex_lock(&self.inner.state, SOURCE, "add");
            let seq = state.next_seq;
            state.next_seq += 1;
            state.sequence.insert(QueueEntry {
                id,
                tag,
                priority,
                seq,
                run,
            });
            gauge!(METRIC_QUEUE_SIZE).set(state.sequence.len() as f64);
        }

        self.inner.start_available();
        TaskHandle::new(receiver)
    }

    /// Prefer the most recently queued entries carrying `tag` from now on.
    ///
    /// The steering lasts until no queued entry carries the tag.
    pub fn prioritize(&self, tag: impl Into<String>) {
        let tag = tag.into();
        debug!(tag = %tag, "queue steering to tag");
        mutex_lock(&self.inner.state, SOURCE, "prioritize").active_tag = Some(tag);
    }

    /// Number of entries that have not started yet.
    pub fn size(&self) -> usize {
        mutex_lock(&self.inner.state, SOURCE, "size").sequence.len()
    }

    /// Number of entries running under the concurrency limit.
    pub fn pending(&self) -> usize {
        mutex_lock(&self.inner.state, SOURCE, "pending").pending
    }

    pub fn concurrency(&self) -> NonZeroUsize {
        self.inner.concurrency
    }

    pub fn active_tag(&self) -> Option<String> {
        mutex_lock(&self.inner.state, SOURCE, "active_tag")
            .active_tag
            .clone()
    }

    /// Whether an entry with `id` is still waiting. The answer can be stale
    /// by the time the caller acts on it.
    pub fn has(&self, id: &str) -> bool {
        mutex_lock(&self.inner.state, SOURCE, "has")
            .sequence
            .contains_id(id)
    }

    /// Start the waiting entry `id` immediately.
    ///
    /// The entry bypasses both the priority order and the concurrency limit and
    /// is not counted in `pending`. Returns false when no such entry is waiting.
    pub fn now(&self, id: &str) -> bool {
        let entry = {
            let mut state = mutex_lock(&self.inner.state, SOURCE, "now");
            let entry = state.sequence.remove_id(id);
            gauge!(METRIC_QUEUE_SIZE).set(state.sequence.len() as f64);
            entry
        };

        match entry {
            Some(entry) => {
                debug!(task_id = id, "forcing queued task to run now");
                tokio::spawn((entry.run)());
                true
            }
            None => false,
        }
    }

    /// Discard every entry that has not started. Running entries are unaffected.
    ///
    /// Returns the number of entries discarded; their handles resolve to
    /// [`TaskError::Discarded`].
    pub fn clear(&self) -> usize {
        let discarded = {
            let mut state = mutex_lock(&self.inner.state, SOURCE, "clear");
            let discarded = state.sequence.drain();
            gauge!(METRIC_QUEUE_SIZE).set(0.0);
            discarded
        };
        let count = discarded.len();
        // Dropped outside the lock: a job's captures may take other locks on drop.
        drop(discarded);
        if count > 0 {
            debug!(count, "discarded queued tasks");
        }
        count
    }
}

impl Inner {
    /// Start entries until the concurrency limit is reached or nothing waits.
    fn start_available(self: &Arc<Self>) {
        loop {
            let entry = {
                let mut state = mutex_lock(&self.state, SOURCE, "start_available");
                if state.pending >= self.concurrency.get() {
                    return;
                }
                let QueueState {
                    sequence,
                    active_tag,
                    ..
                } = &mut *state;
                let Some(entry) = sequence.select(active_tag) else {
                    return;
                };
                state.pending += 1;
                gauge!(METRIC_QUEUE_PENDING).set(state.pending as f64);
                gauge!(METRIC_QUEUE_SIZE).set(state.sequence.len() as f64);
                entry
            };

            let inner = Arc::clone(self);
            tokio::spawn(async move {
                let slot = PendingSlot(Arc::clone(&inner));
                (entry.run)().await;
                drop(slot);
                inner.start_available();
            });
        }
    }
}

/// Releases one unit of concurrency when dropped, whether the task finished
/// or its future was torn down.
struct PendingSlot(Arc<Inner>);

impl Drop for PendingSlot {
    fn drop(&mut self) {
        let mut state = mutex_lock(&self.0.state, SOURCE, "release");
        state.pending = state.pending.saturating_sub(1);
        gauge!(METRIC_QUEUE_PENDING).set(state.pending as f64);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::{Notify, oneshot};

    use super::*;

    fn queue(limit: usize) -> PriorityTaskQueue {
        PriorityTaskQueue::new(NonZeroUsize::new(limit).expect("non-zero limit"))
    }

    #[tokio::test]
    async fn add_resolves_with_work_result() {
        let queue = queue(2);
        let handle = queue.add(|| async { Ok::<_, String>(41 + 1) }, TaskOptions::new());
        assert_eq!(handle.await.expect("task succeeds"), 42);
    }

    #[tokio::test]
    async fn failure_reaches_only_its_own_handle() {
        let queue = queue(1);
        let failing = queue.add(
            || async { Err::<(), _>("boom".to_string()) },
            TaskOptions::new(),
        );
        let healthy = queue.add(|| async { Ok::<_, String>("fine") }, TaskOptions::new());

        let error = failing.await.expect_err("task fails");
        assert_eq!(error.into_failure().as_deref(), Some("boom"));
        assert_eq!(healthy.await.expect("next task still runs"), "fine");
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn panic_is_reported_and_slot_released() {
        let queue = queue(1);
        let panicking = queue.add(
            || async {
                if true {
                    panic!("exploded");
                }
                Ok::<(), String>(())
            },
            TaskOptions::new(),
        );
        let after = queue.add(|| async { Ok::<_, String>(7) }, TaskOptions::new());

        match panicking.await {
            Err(TaskError::Panicked(message)) => assert_eq!(message, "exploded"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(after.await.expect("queue keeps running"), 7);
    }

    #[tokio::test]
    async fn clear_discards_waiting_entries_only() {
        let queue = queue(1);
        let (release, gate) = oneshot::channel::<()>();
        let running = queue.add(
            move || async move {
                let _ = gate.await;
                Ok::<_, String>("ran")
            },
            TaskOptions::new(),
        );
        let waiting = queue.add(|| async { Ok::<_, String>("never") }, TaskOptions::new());

        assert_eq!(queue.size(), 1);
        assert_eq!(queue.clear(), 1);
        assert_eq!(queue.size(), 0);

        release.send(()).expect("gate open");
        assert_eq!(running.await.expect("running task completes"), "ran");
        assert!(waiting.await.expect_err("discarded").is_discarded());
    }

    #[tokio::test]
    async fn has_and_now_bypass_the_limit() {
        let queue = queue(1);
        let blocker = Arc::new(Notify::new());
        let wait = Arc::clone(&blocker);
        let blocking = queue.add(
            move || async move {
                wait.notified().await;
                Ok::<_, String>(())
            },
            TaskOptions::new().id("blocker"),
        );
        let forced = queue.add(
            || async { Ok::<_, String>("forced") },
            TaskOptions::new().id("speculative"),
        );

        assert_eq!(queue.pending(), 1);
        assert!(queue.has("speculative"));
        assert!(!queue.has("blocker"));

        assert!(queue.now("speculative"));
        assert!(!queue.has("speculative"));
        assert_eq!(queue.size(), 0);
        assert_eq!(forced.await.expect("forced task runs"), "forced");
        assert_eq!(queue.pending(), 1);
        assert!(!queue.now("speculative"));

        blocker.notify_one();
        blocking.await.expect("blocker finishes");
    }

    #[tokio::test]
    async fn prioritize_sets_and_clears_active_tag() {
        let queue = queue(1);
        let (release, gate) = oneshot::channel::<()>();
        let first = queue.add(
            move || async move {
                let _ = gate.await;
                Ok::<_, String>(())
            },
            TaskOptions::new(),
        );
        let tagged = queue.add(
            || async { Ok::<_, String>(()) },
            TaskOptions::new().tag("visible"),
        );

        queue.prioritize("visible");
        assert_eq!(queue.active_tag().as_deref(), Some("visible"));

        release.send(()).expect("gate open");
        first.await.expect("first completes");
        tagged.await.expect("tagged completes");

        // Selecting the tagged entry leaves the tag set; the next selection
        // finds nothing tagged and clears it.
        let untagged = queue.add(|| async { Ok::<_, String>(()) }, TaskOptions::new());
        untagged.await.expect("untagged completes");
        assert!(queue.active_tag().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn pending_never_exceeds_limit() {
        let queue = queue(3);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..24)
            .map(|index| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                queue.add(
                    move || async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, String>(index)
                    },
                    TaskOptions::new().priority(index % 4),
                )
            })
            .collect();

        for handle in handles {
            handle.await.expect("task completes");
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(queue.pending(), 0);
        assert_eq!(queue.size(), 0);
    }
}

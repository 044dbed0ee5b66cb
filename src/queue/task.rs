//! Per-task types: scheduling options, the caller's handle, and task failures.

use std::{
    any::Any,
    fmt,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::oneshot;

/// A type-erased unit of work. Calling it produces the future that runs the
/// work and reports the outcome to the caller's [`TaskHandle`].
pub(crate) type Job = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Scheduling options for [`PriorityTaskQueue::add`](super::PriorityTaskQueue::add).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskOptions {
    /// Identifier used by `has` and `now`.
    pub id: Option<String>,
    /// Grouping tag used by `prioritize`.
    pub tag: Option<String>,
    /// Higher runs first. Defaults to zero.
    pub priority: i64,
}

impl TaskOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }
}

/// Why a queued task did not produce a value.
#[derive(Debug, Error)]
pub enum TaskError<E> {
    /// The work ran and returned an error.
    #[error("task failed: {0}")]
    Failed(#[source] E),
    /// The work panicked while running.
    #[error("task panicked: {0}")]
    Panicked(String),
    /// The entry was removed by `clear` before it started.
    #[error("task was discarded before it started")]
    Discarded,
}

impl<E> TaskError<E> {
    pub fn is_discarded(&self) -> bool {
        matches!(self, Self::Discarded)
    }

    /// The error returned by the work, if it ran to completion.
    pub fn into_failure(self) -> Option<E> {
        match self {
            Self::Failed(error) => Some(error),
            _ => None,
        }
    }
}

/// Resolves to the outcome of a task submitted to the queue.
#[must_use = "dropping a TaskHandle does not cancel the task, but its outcome is lost"]
pub struct TaskHandle<T, E> {
    receiver: oneshot::Receiver<Result<T, TaskError<E>>>,
}

impl<T, E> TaskHandle<T, E> {
    pub(crate) fn new(receiver: oneshot::Receiver<Result<T, TaskError<E>>>) -> Self {
        Self { receiver }
    }
}

impl<T, E> fmt::Debug for TaskHandle<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle").finish_non_exhaustive()
    }
}

impl<T, E> Future for TaskHandle<T, E> {
    type Output = Result<T, TaskError<E>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|outcome| outcome.unwrap_or(Err(TaskError::Discarded)))
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

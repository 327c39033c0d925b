// Step Queue
// Runs named async producers one at a time, in insertion order, accumulating
// their outputs under each producer's alias.

use futures::future::{BoxFuture, FutureExt};
use indexmap::IndexMap;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::task::JoinHandle;
use tracing::debug;

/// Raised when two steps share an alias
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Step alias \"{0}\" is already used in this request")]
pub struct DuplicateAlias(pub String);

/// The drain task was cancelled before it settled (runtime shutdown)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Request aborted before all steps settled")]
pub struct Aborted;

type Producer<T, E> = Box<dyn FnOnce(IndexMap<String, T>) -> BoxFuture<'static, Result<T, E>> + Send>;

/// Ordered queue of named producers.
///
/// Each producer receives an owned snapshot of every output accumulated so far.
/// `start` consumes the queue, so nothing can be appended once draining begins.
pub struct StepQueue<T, E> {
    tasks: VecDeque<(String, Producer<T, E>)>,
}

impl<T, E> StepQueue<T, E>
where
    T: Clone + Send + 'static,
    E: Send + 'static,
{
    pub fn new() -> Self {
        Self {
            tasks: VecDeque::new(),
        }
    }

    /// Append a producer. Aliases must be unique within a queue.
    pub fn enqueue<F, Fut>(&mut self, alias: impl Into<String>, producer: F) -> Result<(), DuplicateAlias>
    where
        F: FnOnce(IndexMap<String, T>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let alias = alias.into();
        if self.tasks.iter().any(|(existing, _)| *existing == alias) {
            return Err(DuplicateAlias(alias));
        }
        self.tasks
            .push_back((alias, Box::new(move |results| producer(results).boxed())));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        self.tasks.iter().map(|(alias, _)| alias.as_str())
    }

    /// Start draining on the runtime. No producer runs before this call returns.
    pub fn start(self) -> PendingResults<T, E> {
        PendingResults {
            handle: tokio::spawn(self.drain()),
        }
    }

    async fn drain(mut self) -> Result<IndexMap<String, T>, E> {
        let mut results = IndexMap::with_capacity(self.tasks.len());

        while let Some((alias, producer)) = self.tasks.pop_front() {
            debug!(step = %alias, "Running step");
            match producer(results.clone()).await {
                Ok(output) => {
                    results.insert(alias, output);
                }
                Err(error) => {
                    debug!(
                        step = %alias,
                        abandoned = self.tasks.len(),
                        "Step failed, dropping remaining steps"
                    );
                    self.tasks.clear();
                    return Err(error);
                }
            }
        }

        Ok(results)
    }
}

impl<T, E> Default for StepQueue<T, E>
where
    T: Clone + Send + 'static,
    E: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Settles once with every output, or with the first producer error as-is.
///
/// Dropping it does not stop the drain.
pub struct PendingResults<T, E> {
    handle: JoinHandle<Result<IndexMap<String, T>, E>>,
}

impl<T, E> PendingResults<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// A result that fails without running anything
    pub fn failed(error: E) -> Self {
        Self {
            handle: tokio::spawn(async move { Err(error) }),
        }
    }
}

impl<T, E> Future for PendingResults<T, E>
where
    E: From<Aborted>,
{
    type Output = Result<IndexMap<String, T>, E>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.handle).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(settled)) => Poll::Ready(settled),
            // A panicking producer panics the awaiting caller
            Poll::Ready(Err(e)) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Poll::Ready(Err(_)) => Poll::Ready(Err(E::from(Aborted))),
        }
    }
}

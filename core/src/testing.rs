//! Promises with scripted outcomes, for exercising code that consumes them.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::error::Error;
use crate::executor::{Executor, WorkQueue};
use crate::multipart::MultiPart;
use crate::possibility::Possibility;
use crate::promise::Promise;

/// Builder for a lazy promise that yields a predetermined result.
///
/// ```
/// use std::time::Duration;
/// use roundabout_core::{Possibility, testing::MockPromise};
///
/// let promise = MockPromise::new(Possibility::Value(3))
///     .delay(Duration::from_millis(5))
///     .build();
/// assert_eq!(promise.wait().unwrap(), 3);
/// ```
#[derive(Clone)]
pub struct MockPromise<T> {
    result: Possibility<T>,
    delay: Duration,
    cancellable: bool,
    executor: Option<Arc<dyn Executor>>,
}

impl<T: Clone + Send + 'static> MockPromise<T> {
    /// An empty `result` makes the promise reject with [`Error::EmptyResult`].
    pub fn new(result: Possibility<T>) -> Self {
        Self {
            result,
            delay: Duration::ZERO,
            cancellable: false,
            executor: None,
        }
    }

    /// Time to sleep on the worker before resolving.
    #[must_use]
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Reject with [`Error::Cancelled`] when cancelled before the delay ends.
    #[must_use]
    pub fn cancellable(mut self, cancellable: bool) -> Self {
        self.cancellable = cancellable;
        self
    }

    /// Run on `executor` instead of the common work queue.
    #[must_use]
    pub fn on(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    #[must_use]
    pub fn build(self) -> Promise<T> {
        let Self {
            result,
            delay,
            cancellable,
            executor,
        } = self;
        let executor = executor.unwrap_or_else(|| Arc::new(WorkQueue::common()));

        let promise = Promise::lazy(move |promise: Promise<T>| {
            executor.execute(Box::new(move || {
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
                if cancellable && promise.is_cancelled() {
                    promise.settle_quietly(Err(Error::Cancelled));
                    return;
                }
                let outcome = match result {
                    Possibility::Value(value) => Ok(value),
                    Possibility::Error(err) => Err(err),
                    Possibility::Empty => Err(Error::EmptyResult),
                };
                promise.settle_quietly(outcome);
            }));
        });
        promise.set_name("mock");
        promise
    }

    /// Two mock promises delivering the same result as a multi-part pair.
    #[must_use]
    pub fn build_multipart(self) -> MultiPart<T> {
        MultiPart::new(self.clone().build(), self.build())
    }
}

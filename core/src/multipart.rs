//! Two-stage delivery: a quick first answer, then the authoritative one.
//!
//! A [`MultiPart`] pairs an optional first promise (typically a cached copy)
//! with a second promise (typically the revalidated network payload). The
//! first part is always delivered before the second. A failed first part is
//! logged and skipped; only a failure of the second part reaches the
//! failure callback.

use std::sync::Arc;

use crate::error::Error;
use crate::executor::{Executor, Inline};
use crate::promise::Promise;

/// Which half of a [`MultiPart`] a delivery belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Part {
    First,
    Second,
}

#[derive(Debug, Clone)]
pub struct MultiPart<T: Clone + Send + 'static> {
    first: Option<Promise<T>>,
    second: Promise<T>,
}

impl<T: Clone + Send + 'static> MultiPart<T> {
    pub fn new(first: Promise<T>, second: Promise<T>) -> Self {
        Self {
            first: Some(first),
            second,
        }
    }

    /// A multi-part promise that only ever delivers its second part.
    pub fn second_only(second: Promise<T>) -> Self {
        Self {
            first: None,
            second,
        }
    }

    #[must_use]
    pub fn first(&self) -> Option<&Promise<T>> {
        self.first.as_ref()
    }

    #[must_use]
    pub fn second(&self) -> &Promise<T> {
        &self.second
    }

    /// Cancel both parts.
    pub fn cancel(&self) {
        if let Some(first) = &self.first {
            first.cancel();
        }
        self.second.cancel();
    }

    /// Deliver each part to one callback, tagged with its [`Part`].
    ///
    /// `on_part` runs once or twice.
    pub fn then_each(
        &self,
        on_part: impl Fn(Part, T) + Send + Sync + 'static,
        on_failure: impl FnOnce(Error) + Send + 'static,
        executor: Arc<dyn Executor>,
    ) {
        let on_part = Arc::new(on_part);
        let on_first = {
            let on_part = Arc::clone(&on_part);
            move |value: T| on_part(Part::First, value)
        };
        let on_second = move |value: T| on_part(Part::Second, value);
        self.then_ordinal(on_first, on_second, on_failure, executor);
    }

    /// Deliver the parts to separate callbacks.
    pub fn then_ordinal(
        &self,
        on_first: impl FnOnce(T) + Send + 'static,
        on_second: impl FnOnce(T) + Send + 'static,
        on_failure: impl FnOnce(Error) + Send + 'static,
        executor: Arc<dyn Executor>,
    ) {
        let Some(first) = &self.first else {
            self.second.then_on(on_second, on_failure, executor);
            return;
        };

        // The second part is only observed from inside the first part's
        // task, so it cannot overtake it on a multi-worker executor.
        let second = self.second.clone();
        let deliver: Box<dyn FnOnce(Result<T, Error>) + Send> = Box::new(move |outcome: Result<T, Error>| {
            let task_executor = Arc::clone(&executor);
            executor.execute(Box::new(move || {
                match outcome {
                    Ok(value) => on_first(value),
                    Err(err) => {
                        tracing::debug!(
                            promise = %second.name(),
                            "First part failed, waiting for second: {err}"
                        );
                    }
                }
                second.then_on(on_second, on_failure, task_executor);
            }));
        });
        let deliver_failure = Arc::new(parking_lot::Mutex::new(Some(deliver)));
        let deliver_success = Arc::clone(&deliver_failure);

        first.then_on(
            move |value| {
                if let Some(deliver) = deliver_success.lock().take() {
                    deliver(Ok(value));
                }
            },
            move |err| {
                if let Some(deliver) = deliver_failure.lock().take() {
                    deliver(Err(err));
                }
            },
            Arc::new(Inline),
        );
    }
}

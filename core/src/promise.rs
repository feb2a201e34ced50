//! The single-resolution promise.
//!
//! A [`Promise`] starts out [`PromiseState::Ready`] and is resolved exactly
//! once, by [`Promise::accept`] or [`Promise::reject`]. The incoming value or
//! error runs through the promise's post-processor [`Pipeline`] first; the
//! final possibility decides the terminal state.
//!
//! Observers registered with [`Promise::then`] / [`Promise::then_on`] are
//! dispatched onto their executor after resolution, or immediately when the
//! promise has already resolved. The resolving thread only submits observer
//! tasks and never waits for them.
//!
//! # Locking
//!
//! Each promise guards its state, observers and pipeline with a single
//! mutex. The pipeline and observer callbacks always run with that mutex
//! released, so observers may freely call back into the promise.
//!
//! # Waiting
//!
//! [`Promise::wait`] parks the caller on a condition variable until the
//! promise resolves. Waiting from a worker of a serial [`WorkQueue`] on a
//! promise whose own work is queued behind the waiter deadlocks: the work can
//! never start. Wait from a thread that does not have to run the work.
//!
//! [`WorkQueue`]: crate::WorkQueue

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::error::{Error, IllegalState};
use crate::executor::{self, Executor};
use crate::groups::Cancellable;
use crate::possibility::Possibility;
use crate::processor::{AnyValue, Pipeline, PostProcessor, ProcessContext, downcast_output};

const ANONYMOUS: &str = "<anonymous>";

/// Where a promise is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromiseState {
    Ready,
    AcceptedWithValue,
    RejectedWithError,
}

impl PromiseState {
    #[must_use]
    pub fn is_resolved(self) -> bool {
        self != Self::Ready
    }
}

type SuccessFn<T> = Box<dyn FnOnce(T) + Send>;
type FailureFn = Box<dyn FnOnce(Error) + Send>;
type FireHook<T> = Box<dyn FnOnce(Promise<T>) + Send>;

struct Observer<T> {
    on_success: SuccessFn<T>,
    on_failure: FailureFn,
    executor: Arc<dyn Executor>,
}

impl<T: Send + 'static> Observer<T> {
    fn dispatch(self, outcome: Result<T, Error>) {
        let Self {
            on_success,
            on_failure,
            executor,
        } = self;
        match outcome {
            Ok(value) => executor.execute(Box::new(move || on_success(value))),
            Err(err) => executor.execute(Box::new(move || on_failure(err))),
        }
    }
}

enum Outcome<T> {
    Pending,
    Accepted(T),
    Rejected(Error),
}

impl<T: Clone> Outcome<T> {
    fn snapshot(&self) -> Option<Result<T, Error>> {
        match self {
            Self::Pending => None,
            Self::Accepted(value) => Some(Ok(value.clone())),
            Self::Rejected(err) => Some(Err(err.clone())),
        }
    }
}

struct Inner<T> {
    outcome: Outcome<T>,
    /// Set once `accept`/`reject` has claimed the promise; the pipeline may
    /// still be running.
    settling: bool,
    observers: Vec<Observer<T>>,
    pipeline: Pipeline,
    fire: Option<FireHook<T>>,
    name: String,
    group: Option<String>,
    source_url: Option<String>,
}

impl<T> Inner<T> {
    fn is_open(&self) -> bool {
        !self.settling && matches!(self.outcome, Outcome::Pending)
    }
}

pub(crate) struct Shared<T> {
    inner: Mutex<Inner<T>>,
    resolved: Condvar,
    cancelled: AtomicBool,
}

impl<T: Send + 'static> Cancellable for Shared<T> {
    fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            tracing::debug!(promise = %self.inner.lock().name, "Promise cancelled");
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// A handle to a single-resolution promise.
///
/// Handles are cheap to clone; every clone refers to the same promise.
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone + Send + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Promise<T> {
    /// A ready promise with no post-processors.
    #[must_use]
    pub fn new() -> Self {
        Self::with_parts(Pipeline::new(), None)
    }

    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        let promise = Self::new();
        promise.set_name(name);
        promise
    }

    /// A promise whose work starts on first observation or wait.
    ///
    /// `hook` runs at most once, on the thread that first calls `then`,
    /// `then_on`, `wait` or [`Self::fire`]. It receives a handle to the
    /// promise and is expected to arrange for it to be resolved.
    pub fn lazy(hook: impl FnOnce(Promise<T>) + Send + 'static) -> Self {
        Self::with_parts(Pipeline::new(), Some(Box::new(hook)))
    }

    /// A lazy promise that starts out with `pipeline` as its post-processors.
    pub fn lazy_with_pipeline(
        pipeline: Pipeline,
        hook: impl FnOnce(Promise<T>) + Send + 'static,
    ) -> Self {
        Self::with_parts(pipeline, Some(Box::new(hook)))
    }

    /// A lazy promise that runs `worker` on `executor` once fired.
    ///
    /// If the promise was cancelled before the task starts, the worker is
    /// skipped and the promise rejects with [`Error::Cancelled`].
    pub fn deferred(
        executor: Arc<dyn Executor>,
        worker: impl FnOnce() -> Result<T, Error> + Send + 'static,
    ) -> Self {
        Self::lazy(move |promise: Promise<T>| {
            executor.execute(Box::new(move || {
                let outcome = if promise.is_cancelled() {
                    Err(Error::Cancelled)
                } else {
                    worker()
                };
                promise.settle_quietly(outcome);
            }));
        })
    }

    /// A promise already accepted with `value`.
    #[must_use]
    pub fn accepted(value: T) -> Self {
        let promise = Self::new();
        promise.accept(value);
        promise
    }

    /// A promise already rejected with `error`.
    #[must_use]
    pub fn rejected(error: Error) -> Self {
        let promise = Self::new();
        promise.reject(error);
        promise
    }

    fn with_parts(pipeline: Pipeline, fire: Option<FireHook<T>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    outcome: Outcome::Pending,
                    settling: false,
                    observers: Vec::new(),
                    pipeline,
                    fire,
                    name: ANONYMOUS.to_string(),
                    group: None,
                    source_url: None,
                }),
                resolved: Condvar::new(),
                cancelled: AtomicBool::new(false),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.shared.inner.lock()
    }

    #[must_use]
    pub fn state(&self) -> PromiseState {
        match self.lock().outcome {
            Outcome::Pending => PromiseState::Ready,
            Outcome::Accepted(_) => PromiseState::AcceptedWithValue,
            Outcome::Rejected(_) => PromiseState::RejectedWithError,
        }
    }

    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.state().is_resolved()
    }

    /// The outcome, if the promise has resolved.
    #[must_use]
    pub fn outcome(&self) -> Option<Result<T, Error>> {
        self.lock().outcome.snapshot()
    }

    // ---- resolution ----

    /// Resolve with `value`, run through the post-processors.
    ///
    /// # Panics
    ///
    /// Panics with [`IllegalState::AlreadyResolved`] if the promise was
    /// already resolved. Use [`Self::try_accept`] when racing other resolvers.
    pub fn accept(&self, value: T) {
        if let Err(e) = self.try_accept(value) {
            panic!("accept on promise {:?}: {e}", self.name());
        }
    }

    pub fn try_accept(&self, value: T) -> Result<(), IllegalState> {
        self.settle(Possibility::Value(Box::new(value)))
    }

    /// Resolve with a value of any type.
    ///
    /// The post-processors are expected to turn `value` into a `T`; if the
    /// pipeline output is some other type the promise rejects with
    /// [`Error::TypeMismatch`].
    ///
    /// # Panics
    ///
    /// Panics if the promise was already resolved.
    pub fn accept_raw(&self, value: impl Any + Send) {
        if let Err(e) = self.try_accept_raw(value) {
            panic!("accept on promise {:?}: {e}", self.name());
        }
    }

    pub fn try_accept_raw(&self, value: impl Any + Send) -> Result<(), IllegalState> {
        self.settle(Possibility::Value(Box::new(value)))
    }

    /// Resolve with `error`. Error-observing post-processors may still turn
    /// it into a value.
    ///
    /// # Panics
    ///
    /// Panics if the promise was already resolved.
    pub fn reject(&self, error: Error) {
        if let Err(e) = self.try_reject(error) {
            panic!("reject on promise {:?}: {e}", self.name());
        }
    }

    pub fn try_reject(&self, error: Error) -> Result<(), IllegalState> {
        self.settle(Possibility::Error(error))
    }

    /// Resolve from a `Result`, logging instead of panicking when the
    /// promise was already resolved.
    pub(crate) fn settle_quietly(&self, outcome: Result<T, Error>) {
        let input = match outcome {
            Ok(value) => Possibility::Value(Box::new(value) as AnyValue),
            Err(err) => Possibility::Error(err),
        };
        if let Err(e) = self.settle(input) {
            tracing::debug!(promise = %self.name(), "Ignoring late resolution: {e}");
        }
    }

    fn settle(&self, input: Possibility<AnyValue>) -> Result<(), IllegalState> {
        let (pipeline, name, source_url) = {
            let mut inner = self.lock();
            if !inner.is_open() {
                return Err(IllegalState::AlreadyResolved);
            }
            inner.settling = true;
            (
                inner.pipeline.clone(),
                inner.name.clone(),
                inner.source_url.clone(),
            )
        };

        let context = ProcessContext::new(&name).with_source_url(source_url.as_deref());
        let result = match downcast_output::<T>(pipeline.run(input, &context)) {
            Possibility::Value(value) => Ok(value),
            Possibility::Empty => Err(Error::EmptyResult),
            Possibility::Error(err) => Err(err),
        };

        let observers = {
            let mut inner = self.lock();
            inner.outcome = match &result {
                Ok(value) => Outcome::Accepted(value.clone()),
                Err(err) => Outcome::Rejected(err.clone()),
            };
            inner.fire = None;
            std::mem::take(&mut inner.observers)
        };
        self.shared.resolved.notify_all();

        match &result {
            Ok(_) => tracing::debug!(
                promise = %name,
                observers = observers.len(),
                "Promise accepted"
            ),
            Err(err) => tracing::debug!(
                promise = %name,
                observers = observers.len(),
                "Promise rejected: {err}"
            ),
        }

        for observer in observers {
            observer.dispatch(result.clone());
        }
        Ok(())
    }

    // ---- observation ----

    /// Register an observer that runs on the caller's current execution
    /// context.
    ///
    /// Inside a [`WorkQueue`](crate::WorkQueue) task that is the queue;
    /// elsewhere the callback runs inline on the resolving thread.
    pub fn then(
        &self,
        on_success: impl FnOnce(T) + Send + 'static,
        on_failure: impl FnOnce(Error) + Send + 'static,
    ) {
        self.then_on(on_success, on_failure, executor::current());
    }

    /// Register an observer dispatched onto `executor`.
    ///
    /// Each observer is called exactly once. If the promise already resolved
    /// the observer is dispatched right away.
    pub fn then_on(
        &self,
        on_success: impl FnOnce(T) + Send + 'static,
        on_failure: impl FnOnce(Error) + Send + 'static,
        executor: Arc<dyn Executor>,
    ) {
        let observer = Observer {
            on_success: Box::new(on_success),
            on_failure: Box::new(on_failure),
            executor,
        };

        let resolved = {
            let mut guard = self.lock();
            let inner = &mut *guard;
            match inner.outcome.snapshot() {
                Some(outcome) => Some((observer, outcome)),
                None => {
                    inner.observers.push(observer);
                    None
                }
            }
        };

        match resolved {
            Some((observer, outcome)) => observer.dispatch(outcome),
            None => self.fire(),
        }
    }

    /// Block until the promise resolves and return its outcome.
    ///
    /// See the module docs for the deadlock to avoid.
    pub fn wait(&self) -> Result<T, Error> {
        self.fire();
        let mut inner = self.lock();
        loop {
            if let Some(outcome) = inner.outcome.snapshot() {
                return outcome;
            }
            self.shared.resolved.wait(&mut inner);
        }
    }

    /// Like [`Self::wait`], giving up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T, Error>> {
        self.fire();
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        loop {
            if let Some(outcome) = inner.outcome.snapshot() {
                return Some(outcome);
            }
            if self
                .shared
                .resolved
                .wait_until(&mut inner, deadline)
                .timed_out()
            {
                return inner.outcome.snapshot();
            }
        }
    }

    /// Run the lazy hook, if there is one and it has not run yet.
    pub fn fire(&self) {
        let hook = {
            let mut inner = self.lock();
            if matches!(inner.outcome, Outcome::Pending) {
                inner.fire.take()
            } else {
                None
            }
        };
        if let Some(hook) = hook {
            tracing::trace!(promise = %self.name(), "Firing lazy promise");
            hook(self.clone());
        }
    }

    // ---- cancellation ----

    /// Mark the promise cancelled. Idempotent.
    ///
    /// This does not resolve the promise. Producers check
    /// [`Self::is_cancelled`] and decide how to finish.
    pub fn cancel(&self) {
        Cancellable::cancel(&*self.shared);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        Cancellable::is_cancelled(&*self.shared)
    }

    // ---- post-processors ----

    /// Append a post-processor.
    ///
    /// # Panics
    ///
    /// Panics with [`IllegalState::MutationAfterResolution`] once the
    /// promise has started resolving.
    pub fn add_post_processor(&self, processor: impl PostProcessor + 'static) {
        if let Err(e) = self.try_add_post_processor(Arc::new(processor)) {
            panic!("add_post_processor on promise {:?}: {e}", self.name());
        }
    }

    pub fn try_add_post_processor(
        &self,
        processor: Arc<dyn PostProcessor>,
    ) -> Result<(), IllegalState> {
        self.try_add_post_processors([processor])
    }

    pub fn try_add_post_processors(
        &self,
        processors: impl IntoIterator<Item = Arc<dyn PostProcessor>>,
    ) -> Result<(), IllegalState> {
        let mut inner = self.lock();
        if !inner.is_open() {
            return Err(IllegalState::MutationAfterResolution);
        }
        inner.pipeline.extend(processors);
        Ok(())
    }

    pub fn try_remove_all_post_processors(&self) -> Result<(), IllegalState> {
        let mut inner = self.lock();
        if !inner.is_open() {
            return Err(IllegalState::MutationAfterResolution);
        }
        inner.pipeline.clear();
        Ok(())
    }

    /// # Panics
    ///
    /// Panics once the promise has started resolving.
    pub fn remove_all_post_processors(&self) {
        if let Err(e) = self.try_remove_all_post_processors() {
            panic!("remove_all_post_processors on promise {:?}: {e}", self.name());
        }
    }

    /// A copy of the current pipeline.
    #[must_use]
    pub fn post_processors(&self) -> Pipeline {
        self.lock().pipeline.clone()
    }

    // ---- metadata ----

    #[must_use]
    pub fn name(&self) -> String {
        self.lock().name.clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        self.lock().name = name.into();
    }

    #[must_use]
    pub fn group(&self) -> Option<String> {
        self.lock().group.clone()
    }

    pub fn set_group(&self, group: impl Into<String>) {
        self.lock().group = Some(group.into());
    }

    #[must_use]
    pub fn source_url(&self) -> Option<String> {
        self.lock().source_url.clone()
    }

    /// The URL handed to post-processors for error reporting.
    pub fn set_source_url(&self, url: impl Into<String>) {
        self.lock().source_url = Some(url.into());
    }

    /// True when both handles refer to the same promise.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub(crate) fn as_cancellable(&self) -> Arc<dyn Cancellable> {
        self.shared.clone()
    }
}

impl<T: Clone + Send + 'static> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("name", &self.name())
            .field("state", &self.state())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

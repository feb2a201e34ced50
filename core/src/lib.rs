//! Single-resolution promises and the pieces around them.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`possibility`] | Three-state result container (empty, value, error) |
//! | [`error`] | Rejection kinds and exactly-once contract violations |
//! | [`executor`] | Inline execution, named work queues, the current context |
//! | [`processor`] | Post-processor trait and pipeline |
//! | [`processors`] | Stock processors: JSON, fields, serde decoding, UTF-8 |
//! | [`promise`] | The promise state machine |
//! | [`multipart`] | First/second part delivery |
//! | [`groups`] | Group cancellation bookkeeping |
//! | [`testing`] | Scripted promises for tests |
//!
//! ```
//! use roundabout_core::{JsonFieldPostProcessor, JsonPostProcessor, Promise};
//!
//! let promise = Promise::<serde_json::Value>::named("user");
//! promise.add_post_processor(JsonPostProcessor);
//! promise.add_post_processor(JsonFieldPostProcessor::new("name"));
//! promise.accept_raw(br#"{"name":"a"}"#.to_vec());
//! assert_eq!(promise.wait().unwrap(), "a");
//! ```

pub mod error;
pub mod executor;
pub mod groups;
pub mod multipart;
pub mod possibility;
pub mod processor;
pub mod processors;
pub mod promise;
pub mod testing;
mod when;

pub use error::{Cause, Error, IllegalState};
pub use executor::{Executor, Inline, QueueManager, Task, WorkQueue, current};
pub use groups::{Cancellable, PromiseGroups};
pub use multipart::{MultiPart, Part};
pub use possibility::Possibility;
pub use processor::{
    AnyValue, FnProcessor, Pipeline, PostProcessor, ProcessContext, TypedPostProcessor, ValueType,
};
pub use processors::{
    DecodeJson, FromJsonValue, JsonFieldPostProcessor, JsonPostProcessor,
    SingleValuePostProcessor, Utf8PostProcessor,
};
pub use promise::{Promise, PromiseState};
pub use when::when_all;

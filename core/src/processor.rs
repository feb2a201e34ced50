//! Post-processors and the pipeline that chains them.
//!
//! A post-processor turns one [`Possibility`] into another. Values travel
//! through a [`Pipeline`] type-erased as [`AnyValue`], so stages can change
//! the value's type (`Vec<u8>` → JSON → model). Each stage may declare the
//! input type it expects; a mismatch becomes an [`Error::TypeMismatch`]
//! possibility rather than a panic.
//!
//! Once a stage yields an error, the following stages are skipped unless they
//! report [`PostProcessor::observes_errors`].
//!
//! Most processors are easier to write against [`TypedPostProcessor`], which
//! handles the downcasting.

use std::any::{Any, type_name};
use std::fmt;
use std::sync::Arc;

use crate::error::Error;
use crate::possibility::Possibility;

/// A value moving through a pipeline.
pub type AnyValue = Box<dyn Any + Send>;

/// Runtime description of an expected input type.
#[derive(Clone, Copy)]
pub struct ValueType {
    name: &'static str,
    check: fn(&(dyn Any + Send)) -> bool,
}

fn is_type<T: Any>(value: &(dyn Any + Send)) -> bool {
    value.is::<T>()
}

impl ValueType {
    #[must_use]
    pub fn of<T: Any>() -> Self {
        Self {
            name: type_name::<T>(),
            check: is_type::<T>,
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn accepts(&self, value: &(dyn Any + Send)) -> bool {
        (self.check)(value)
    }
}

impl fmt::Debug for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ValueType").field(&self.name).finish()
    }
}

/// What a post-processor knows about the promise invoking it.
#[derive(Debug, Clone, Copy)]
pub struct ProcessContext<'a> {
    pub promise_name: &'a str,
    /// URL the payload came from, when the promise knows it.
    pub source_url: Option<&'a str>,
}

impl<'a> ProcessContext<'a> {
    #[must_use]
    pub fn new(promise_name: &'a str) -> Self {
        Self {
            promise_name,
            source_url: None,
        }
    }

    #[must_use]
    pub fn with_source_url(mut self, url: Option<&'a str>) -> Self {
        self.source_url = url;
        self
    }
}

/// One stage of a [`Pipeline`].
///
/// Processors are shared between promises and may run on any thread.
pub trait PostProcessor: Send + Sync {
    fn name(&self) -> &str {
        type_name::<Self>()
    }

    /// The input type this stage expects, or `None` to accept anything.
    fn input_type(&self) -> Option<ValueType> {
        None
    }

    /// Whether this stage wants to see error possibilities.
    fn observes_errors(&self) -> bool {
        false
    }

    fn process(&self, input: Possibility<AnyValue>, context: &ProcessContext<'_>)
    -> Possibility<AnyValue>;
}

/// A post-processor with concrete input and output types.
///
/// Every `TypedPostProcessor` is a [`PostProcessor`] whose declared input
/// type is `Self::Input`.
pub trait TypedPostProcessor: Send + Sync + 'static {
    type Input: Send + 'static;
    type Output: Send + 'static;

    fn name(&self) -> &str {
        type_name::<Self>()
    }

    fn observes_errors(&self) -> bool {
        false
    }

    fn process_typed(
        &self,
        input: Possibility<Self::Input>,
        context: &ProcessContext<'_>,
    ) -> Possibility<Self::Output>;
}

impl<P: TypedPostProcessor> PostProcessor for P {
    fn name(&self) -> &str {
        TypedPostProcessor::name(self)
    }

    fn input_type(&self) -> Option<ValueType> {
        Some(ValueType::of::<P::Input>())
    }

    fn observes_errors(&self) -> bool {
        TypedPostProcessor::observes_errors(self)
    }

    fn process(
        &self,
        input: Possibility<AnyValue>,
        context: &ProcessContext<'_>,
    ) -> Possibility<AnyValue> {
        let typed = match input {
            Possibility::Value(value) => match value.downcast::<P::Input>() {
                Ok(value) => Possibility::Value(*value),
                Err(_) => {
                    return Possibility::Error(Error::TypeMismatch {
                        processor: TypedPostProcessor::name(self).to_string(),
                        expected: type_name::<P::Input>(),
                    });
                }
            },
            Possibility::Empty => Possibility::Empty,
            Possibility::Error(err) => Possibility::Error(err),
        };
        self.process_typed(typed, context)
            .map(|value| Box::new(value) as AnyValue)
    }
}

type ProcessFn<In, Out> =
    dyn Fn(Possibility<In>, &ProcessContext<'_>) -> Possibility<Out> + Send + Sync;

/// A processor backed by a closure.
pub struct FnProcessor<In, Out> {
    name: String,
    observes_errors: bool,
    f: Box<ProcessFn<In, Out>>,
}

impl<In: Send + 'static, Out: Send + 'static> FnProcessor<In, Out> {
    pub fn new(
        name: impl Into<String>,
        f: impl Fn(Possibility<In>, &ProcessContext<'_>) -> Possibility<Out>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            observes_errors: false,
            f: Box::new(f),
        }
    }

    /// A processor that only transforms values; empty and error pass through.
    pub fn map_value(
        name: impl Into<String>,
        f: impl Fn(In) -> Result<Out, Error> + Send + Sync + 'static,
    ) -> Self {
        Self::new(name, move |input, _| input.and_then(|value| f(value).into()))
    }

    /// Have the pipeline hand error possibilities to this processor too.
    pub fn observing_errors(mut self) -> Self {
        self.observes_errors = true;
        self
    }
}

impl<In: Send + 'static, Out: Send + 'static> TypedPostProcessor for FnProcessor<In, Out> {
    type Input = In;
    type Output = Out;

    fn name(&self) -> &str {
        &self.name
    }

    fn observes_errors(&self) -> bool {
        self.observes_errors
    }

    fn process_typed(
        &self,
        input: Possibility<In>,
        context: &ProcessContext<'_>,
    ) -> Possibility<Out> {
        (self.f)(input, context)
    }
}

impl<In, Out> fmt::Debug for FnProcessor<In, Out> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnProcessor")
            .field("name", &self.name)
            .field("observes_errors", &self.observes_errors)
            .finish_non_exhaustive()
    }
}

/// An ordered chain of post-processors.
#[derive(Clone, Default)]
pub struct Pipeline {
    stages: Vec<Arc<dyn PostProcessor>>,
}

impl Pipeline {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, processor: Arc<dyn PostProcessor>) {
        self.stages.push(processor);
    }

    #[must_use]
    pub fn with(mut self, processor: impl PostProcessor + 'static) -> Self {
        self.stages.push(Arc::new(processor));
        self
    }

    pub fn extend(&mut self, processors: impl IntoIterator<Item = Arc<dyn PostProcessor>>) {
        self.stages.extend(processors);
    }

    pub fn clear(&mut self) {
        self.stages.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    #[must_use]
    pub fn stages(&self) -> &[Arc<dyn PostProcessor>] {
        &self.stages
    }

    /// Feed `input` through every stage in order.
    pub fn run(
        &self,
        input: Possibility<AnyValue>,
        context: &ProcessContext<'_>,
    ) -> Possibility<AnyValue> {
        let mut current = input;
        for stage in &self.stages {
            current = match current {
                Possibility::Error(err) if !stage.observes_errors() => Possibility::Error(err),
                Possibility::Value(value)
                    if stage
                        .input_type()
                        .is_some_and(|expected| !expected.accepts(value.as_ref())) =>
                {
                    let expected = stage.input_type().map_or("?", |t| t.name());
                    tracing::debug!(
                        processor = stage.name(),
                        expected,
                        promise = context.promise_name,
                        "Post-processor input type mismatch"
                    );
                    Possibility::Error(Error::TypeMismatch {
                        processor: stage.name().to_string(),
                        expected,
                    })
                }
                other => stage.process(other, context),
            };
        }
        current
    }

    /// Run the pipeline and downcast the result to `Out`.
    pub fn run_typed<In, Out>(
        &self,
        input: Possibility<In>,
        context: &ProcessContext<'_>,
    ) -> Possibility<Out>
    where
        In: Send + 'static,
        Out: Send + 'static,
    {
        let erased = input.map(|value| Box::new(value) as AnyValue);
        downcast_output(self.run(erased, context))
    }
}

/// Recover a concrete type from the end of a pipeline.
pub(crate) fn downcast_output<Out: 'static>(output: Possibility<AnyValue>) -> Possibility<Out> {
    match output {
        Possibility::Value(value) => match value.downcast::<Out>() {
            Ok(value) => Possibility::Value(*value),
            Err(_) => Possibility::Error(Error::TypeMismatch {
                processor: "pipeline output".to_string(),
                expected: type_name::<Out>(),
            }),
        },
        Possibility::Empty => Possibility::Empty,
        Possibility::Error(err) => Possibility::Error(err),
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.stages.iter().map(|stage| stage.name()))
            .finish()
    }
}

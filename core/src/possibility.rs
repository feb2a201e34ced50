//! The three-state result container.
//!
//! A [`Possibility`] is either empty, a value, or an error. It is what flows
//! between post-processors and what [`when_all`](crate::when_all) collects
//! per input promise.

use crate::error::Error;

/// Exactly one of empty, value, or error.
#[derive(Debug, Clone)]
pub enum Possibility<T> {
    /// No result (yet, or not applicable).
    Empty,
    /// A successful value.
    Value(T),
    /// A failure.
    Error(Error),
}

impl<T> Default for Possibility<T> {
    fn default() -> Self {
        Self::Empty
    }
}

impl<T> Possibility<T> {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    #[must_use]
    pub fn is_value(&self) -> bool {
        matches!(self, Self::Value(_))
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// The contained value.
    ///
    /// # Panics
    ///
    /// Panics if the possibility is not a value. Use [`Self::as_value`] when
    /// the tag is not known.
    #[must_use]
    pub fn value(&self) -> &T {
        match self {
            Self::Value(value) => value,
            Self::Empty => panic!("value() called on an empty possibility"),
            Self::Error(err) => panic!("value() called on an error possibility: {err}"),
        }
    }

    /// The contained error.
    ///
    /// # Panics
    ///
    /// Panics if the possibility is not an error.
    #[must_use]
    pub fn error(&self) -> &Error {
        match self {
            Self::Error(err) => err,
            Self::Empty => panic!("error() called on an empty possibility"),
            Self::Value(_) => panic!("error() called on a value possibility"),
        }
    }

    #[must_use]
    pub fn as_value(&self) -> Option<&T> {
        match self {
            Self::Value(value) => Some(value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_error(&self) -> Option<&Error> {
        match self {
            Self::Error(err) => Some(err),
            _ => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            Self::Value(value) => Some(value),
            _ => None,
        }
    }

    /// Convert to a `Result`, with `Ok(None)` standing for empty.
    pub fn into_result(self) -> Result<Option<T>, Error> {
        match self {
            Self::Empty => Ok(None),
            Self::Value(value) => Ok(Some(value)),
            Self::Error(err) => Err(err),
        }
    }

    /// Transform the value, leaving empty and error untouched.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Possibility<U> {
        match self {
            Self::Empty => Possibility::Empty,
            Self::Value(value) => Possibility::Value(f(value)),
            Self::Error(err) => Possibility::Error(err),
        }
    }

    /// Chain a step that only runs for a value.
    pub fn and_then<U>(self, f: impl FnOnce(T) -> Possibility<U>) -> Possibility<U> {
        match self {
            Self::Empty => Possibility::Empty,
            Self::Value(value) => f(value),
            Self::Error(err) => Possibility::Error(err),
        }
    }

    /// Start matching against optional handlers.
    ///
    /// ```
    /// use roundabout_core::Possibility;
    ///
    /// let mut seen = None;
    /// Possibility::Value(3).matching().on_value(|v| seen = Some(*v)).run();
    /// assert_eq!(seen, Some(3));
    /// ```
    pub fn matching<'a>(&'a self) -> Match<'a, T> {
        Match {
            possibility: self,
            on_value: None,
            on_empty: None,
            on_error: None,
        }
    }

    /// Start refining into a new possibility through optional handlers.
    ///
    /// A branch without a handler keeps the original content.
    pub fn refine<'a>(self) -> Refine<'a, T> {
        Refine {
            possibility: self,
            value: None,
            empty: None,
            error: None,
        }
    }
}

impl<T> From<Result<T, Error>> for Possibility<T> {
    fn from(result: Result<T, Error>) -> Self {
        match result {
            Ok(value) => Self::Value(value),
            Err(err) => Self::Error(err),
        }
    }
}

impl<T> From<Option<T>> for Possibility<T> {
    fn from(option: Option<T>) -> Self {
        option.map_or(Self::Empty, Self::Value)
    }
}

type ValueHandler<'a, T> = Box<dyn FnOnce(&T) + 'a>;
type EmptyHandler<'a> = Box<dyn FnOnce() + 'a>;
type ErrorHandler<'a> = Box<dyn FnOnce(&Error) + 'a>;

/// Pending match over a [`Possibility`]. Missing handlers are no-ops.
#[must_use = "call `run` to invoke the matching handler"]
pub struct Match<'a, T> {
    possibility: &'a Possibility<T>,
    on_value: Option<ValueHandler<'a, T>>,
    on_empty: Option<EmptyHandler<'a>>,
    on_error: Option<ErrorHandler<'a>>,
}

impl<'a, T> Match<'a, T> {
    pub fn on_value(mut self, f: impl FnOnce(&T) + 'a) -> Self {
        self.on_value = Some(Box::new(f));
        self
    }

    pub fn on_empty(mut self, f: impl FnOnce() + 'a) -> Self {
        self.on_empty = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl FnOnce(&Error) + 'a) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    pub fn run(self) {
        match self.possibility {
            Possibility::Value(value) => {
                if let Some(f) = self.on_value {
                    f(value);
                }
            }
            Possibility::Empty => {
                if let Some(f) = self.on_empty {
                    f();
                }
            }
            Possibility::Error(err) => {
                if let Some(f) = self.on_error {
                    f(err);
                }
            }
        }
    }
}

type ValueRefiner<'a, T> = Box<dyn FnOnce(T) -> Possibility<T> + 'a>;
type EmptyRefiner<'a, T> = Box<dyn FnOnce() -> Possibility<T> + 'a>;
type ErrorRefiner<'a, T> = Box<dyn FnOnce(Error) -> Possibility<T> + 'a>;

/// Pending refinement of a [`Possibility`].
#[must_use = "call `apply` to produce the refined possibility"]
pub struct Refine<'a, T> {
    possibility: Possibility<T>,
    value: Option<ValueRefiner<'a, T>>,
    empty: Option<EmptyRefiner<'a, T>>,
    error: Option<ErrorRefiner<'a, T>>,
}

impl<'a, T> Refine<'a, T> {
    pub fn value(mut self, f: impl FnOnce(T) -> Possibility<T> + 'a) -> Self {
        self.value = Some(Box::new(f));
        self
    }

    pub fn empty(mut self, f: impl FnOnce() -> Possibility<T> + 'a) -> Self {
        self.empty = Some(Box::new(f));
        self
    }

    pub fn error(mut self, f: impl FnOnce(Error) -> Possibility<T> + 'a) -> Self {
        self.error = Some(Box::new(f));
        self
    }

    pub fn apply(self) -> Possibility<T> {
        match self.possibility {
            Possibility::Value(value) => match self.value {
                Some(f) => f(value),
                None => Possibility::Value(value),
            },
            Possibility::Empty => match self.empty {
                Some(f) => f(),
                None => Possibility::Empty,
            },
            Possibility::Error(err) => match self.error {
                Some(f) => f(err),
                None => Possibility::Error(err),
            },
        }
    }
}

//! Protocol errors and the failures that cells and channels carry as data.

use std::any::Any;
use std::error::Error as StdError;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Errors reported by the dataflow primitives when a caller breaks their protocol
/// or asks for a strict outcome that cannot be delivered.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A uniqueness-checked bind found the cell already bound, or a checked bind
    /// found it bound to a different value.
    #[error("the cell is already bound")]
    AlreadyBound,

    /// The subscription was already closed by an earlier unsubscribe.
    #[error("the subscription is closed")]
    SubscriptionClosed,

    /// A subscription cannot be closed while listeners for every future value are
    /// still registered on it.
    #[error("cannot unsubscribe while {count} whenever-bound listeners are registered")]
    ListenersRegistered {
        /// Number of listeners registered on the subscription.
        count: usize,
    },

    /// A strict read did not observe a bound value before its deadline.
    #[error("no value was bound within {timeout:?}")]
    TimedOut {
        /// The timeout the caller asked for.
        timeout: Duration,
    },

    /// A select mask did not have one entry per source.
    #[error("select mask has {actual} entries but the selector has {expected} sources")]
    MaskLength {
        /// Number of sources in the selector.
        expected: usize,

        /// Number of entries in the mask supplied by the caller.
        actual: usize,
    },

    /// A select mask disabled every source, so no value could ever be selected.
    #[error("select mask disables every source")]
    NoEnabledSources,

    /// The cell is bound to a failure, surfaced through an API that returns [`Error`].
    #[error("the cell is bound to a failure: {0}")]
    Failed(#[from] Failure),
}

/// A specialized `Result` type for dataflow operations, returning the crate's
/// [`Error`] type as the error value.
pub(crate) type Result<T> = std::result::Result<T, Error>;

/// What a read delivers: either the bound value or the failure the cell was bound to.
pub type Outcome<T> = std::result::Result<T, Failure>;

/// A failure carried as data through cells, channels and chained callbacks.
///
/// Cloning is cheap: all clones share the same underlying error. Failures are created
/// from any error type, from a plain message, or from the panic of a scheduled callback.
#[derive(Clone)]
pub struct Failure {
    inner: Arc<dyn StdError + Send + Sync>,
}

impl Failure {
    /// Wraps an error value.
    pub fn new<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(error),
        }
    }

    /// Creates a failure that carries only a message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(Message(message.into()))
    }

    /// Creates a failure from the payload of a caught panic.
    pub(crate) fn from_panic(payload: &(dyn Any + Send)) -> Self {
        Self::new(Panicked {
            message: panic_message(payload),
        })
    }

    /// Returns the wrapped error if it is of type `E`.
    #[must_use]
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: StdError + 'static,
    {
        self.inner.downcast_ref::<E>()
    }

    /// Whether this failure was produced by a panicking callback or initializer.
    #[must_use]
    pub fn is_panic(&self) -> bool {
        self.downcast_ref::<Panicked>().is_some()
    }

    /// Whether both failures share the same underlying error instance.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Failure").field(&self.inner).finish()
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

impl StdError for Failure {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.source()
    }
}

#[derive(Debug, Error)]
#[error("{0}")]
struct Message(String);

#[derive(Debug, Error)]
#[error("callback panicked: {message}")]
struct Panicked {
    message: String,
}

/// Extracts a human-readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// Runs `f`, turning a panic into a [`Failure`].
pub(crate) fn run_guarded<R>(f: impl FnOnce() -> R) -> Outcome<R> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| Failure::from_panic(&*payload))
}

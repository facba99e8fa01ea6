//! Error types for Trestle.
//!
//! Every failure that can end a request exchange is a [`BridgeError`]. The
//! narrower [`DispatchError`] is what a [`Dispatcher`](crate::Dispatcher)
//! returns, and [`ResponseError`] is what the response writer reports when a
//! write is attempted in the wrong state.
//!
//! All three are `Clone`: the completion signal hands the same failure to its
//! waiter and to anybody inspecting the outcome afterwards, so sources are held
//! behind an [`Arc`].

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Boxed error returned by cleanup tasks and other user callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Shared error source that can be cloned along with the error holding it.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync>;

/// Result type alias using [`BridgeError`].
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Errors that terminate a request exchange.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use trestle_core::BridgeError;
///
/// let error = BridgeError::TimedOut(Duration::from_secs(5));
/// assert!(error.is_timeout());
/// ```
#[derive(Error, Debug, Clone)]
pub enum BridgeError {
    /// The transport failed while the request body was being read.
    #[error("failed to read request body")]
    BodyRead(#[source] SharedError),

    /// The request head could not be turned into an absolute URI.
    #[error("invalid request URI `{uri}`")]
    InvalidUri {
        /// The URI text that failed to parse.
        uri: String,
    },

    /// The dispatcher returned an error or panicked.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// A cleanup task failed. Remaining tasks were skipped.
    #[error("cleanup task {index} failed")]
    Cleanup {
        /// Position of the failing task in registration order.
        index: usize,
        /// The error the task returned.
        #[source]
        source: SharedError,
    },

    /// The completion signal was still pending when the wait bound elapsed.
    #[error("response not completed within {0:?}")]
    TimedOut(Duration),

    /// Asynchronous processing reported a failure through the completion signal.
    #[error("asynchronous processing failed")]
    Async(#[source] SharedError),

    /// Writing to the response failed.
    #[error(transparent)]
    Response(#[from] ResponseError),
}

impl BridgeError {
    /// Creates a body read error from a transport error.
    pub fn body_read(source: impl Into<BoxError>) -> Self {
        Self::BodyRead(Arc::from(source.into()))
    }

    /// Creates a cleanup failure for the task at `index`.
    pub fn cleanup(index: usize, source: impl Into<BoxError>) -> Self {
        Self::Cleanup {
            index,
            source: Arc::from(source.into()),
        }
    }

    /// Wraps an arbitrary error raised by asynchronous processing.
    pub fn asynchronous(source: impl Into<BoxError>) -> Self {
        Self::Async(Arc::from(source.into()))
    }

    /// Returns `true` if this error is a completion timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut(_))
    }
}

/// Errors returned by a [`Dispatcher`](crate::Dispatcher).
#[derive(Error, Debug, Clone)]
pub enum DispatchError {
    /// The dispatch pipeline failed.
    #[error("dispatch failed: {message}")]
    Failed {
        /// Human-readable error message.
        message: String,
        /// The underlying error, if any.
        #[source]
        source: Option<SharedError>,
    },

    /// The dispatcher panicked. The payload message is kept when it is a string.
    #[error("dispatcher panicked: {0}")]
    Panicked(String),

    /// A response write made by the dispatcher failed.
    #[error(transparent)]
    Response(#[from] ResponseError),
}

impl DispatchError {
    /// Creates a dispatch failure with a message.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a dispatch failure with a message and a source error.
    pub fn failed_with_source(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Failed {
            message: message.into(),
            source: Some(Arc::from(source.into())),
        }
    }

    /// Converts a panic payload caught with `catch_unwind` into an error.
    #[must_use]
    pub fn panicked(payload: &(dyn Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Self::Panicked(message)
    }
}

/// Errors reported by the response writer.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseError {
    /// The head was already sent; status and headers can no longer change.
    #[error("response already committed")]
    Committed,

    /// The response was closed; no more body bytes can be written.
    #[error("response already closed")]
    Closed,

    /// The transport side of the response went away.
    #[error("response receiver dropped")]
    Disconnected,
}

/// Outcome of waiting on a [`CompletionSignal`](crate::CompletionSignal).
#[derive(Error, Debug, Clone)]
pub enum WaitError {
    /// The bound elapsed while the signal was still pending.
    #[error("completion wait timed out after {0:?}")]
    TimedOut(Duration),

    /// The signal was resolved as failed.
    #[error(transparent)]
    Failed(BridgeError),
}

impl From<WaitError> for BridgeError {
    fn from(error: WaitError) -> Self {
        match error {
            WaitError::TimedOut(bound) => Self::TimedOut(bound),
            WaitError::Failed(error) => error,
        }
    }
}

//! # Trestle Core
//!
//! Core types for bridging an asynchronous HTTP transport to a synchronous
//! request dispatcher.
//!
//! - [`RequestEnvelope`] - Immutable per-request context with the absolute URI
//! - [`MaterializedBody`] / [`BodyAggregator`] - Fully buffered request bodies
//! - [`CompletionSignal`] - Single-fire "response finished" signal
//! - [`ResponseWriter`] / [`AsyncResponse`] - Response handles for synchronous and suspended requests
//! - [`Dispatcher`] - The synchronous processing boundary
//! - [`ProviderContext`] - Thread-local ambient context for dispatch
//! - [`BridgeError`] - Errors that end an exchange

#![doc(html_root_url = "https://docs.rs/trestle-core/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod body;
pub mod completion;
mod context;
mod dispatch;
pub mod envelope;
mod error;
mod response;
pub mod uri;

pub use body::{BodyAggregator, MaterializedBody, ReleaseHook, ReleaseReason};
pub use completion::CompletionSignal;
pub use context::{ContextGuard, ProviderContext};
pub use dispatch::{dispatch_fn, run_cleanup_tasks, CleanupTask, Dispatcher, FnDispatcher};
pub use envelope::{ConnectionInfo, RequestEnvelope, RequestEnvelopeBuilder, RequestId};
pub use error::{
    BoxError, BridgeError, BridgeResult, DispatchError, ResponseError, SharedError, WaitError,
};
pub use response::{AsyncResponse, DispatchOutcome, ResponseChannels, ResponseHead, ResponseWriter};

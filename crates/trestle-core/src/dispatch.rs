//! The synchronous dispatch boundary.
//!
//! A [`Dispatcher`] is the opaque request-processing pipeline the bridge calls
//! into. It runs on a thread that may block. Routing, content negotiation and
//! serialization all live behind this trait.

use crate::body::MaterializedBody;
use crate::envelope::RequestEnvelope;
use crate::error::{BoxError, BridgeError, DispatchError};
use crate::response::ResponseWriter;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Synchronous request processor.
///
/// Implementations either finish the response before returning, or call
/// [`ResponseWriter::suspend`] and finish it later through the returned
/// [`AsyncResponse`](crate::AsyncResponse).
///
/// # Example
///
/// ```
/// use trestle_core::{DispatchError, Dispatcher, MaterializedBody, RequestEnvelope, ResponseWriter};
///
/// struct Echo;
///
/// impl Dispatcher for Echo {
///     fn invoke(
///         &self,
///         _request: &RequestEnvelope,
///         body: &MaterializedBody,
///         response: &ResponseWriter,
///     ) -> Result<(), DispatchError> {
///         response.write(body.to_bytes().unwrap_or_default())?;
///         Ok(())
///     }
/// }
/// ```
pub trait Dispatcher: Send + Sync + 'static {
    /// Processes one request.
    fn invoke(
        &self,
        request: &RequestEnvelope,
        body: &MaterializedBody,
        response: &ResponseWriter,
    ) -> Result<(), DispatchError>;
}

impl<D: Dispatcher + ?Sized> Dispatcher for Arc<D> {
    fn invoke(
        &self,
        request: &RequestEnvelope,
        body: &MaterializedBody,
        response: &ResponseWriter,
    ) -> Result<(), DispatchError> {
        (**self).invoke(request, body, response)
    }
}

/// A [`Dispatcher`] backed by a closure. Created with [`dispatch_fn`].
pub struct FnDispatcher<F> {
    f: F,
}

/// Wraps a closure as a [`Dispatcher`].
///
/// # Example
///
/// ```
/// use trestle_core::dispatch_fn;
///
/// let dispatcher = dispatch_fn(|_request, _body, response| {
///     response.write("ok")?;
///     Ok(())
/// });
/// # let _ = dispatcher;
/// ```
pub fn dispatch_fn<F>(f: F) -> FnDispatcher<F>
where
    F: Fn(&RequestEnvelope, &MaterializedBody, &ResponseWriter) -> Result<(), DispatchError>
        + Send
        + Sync
        + 'static,
{
    FnDispatcher { f }
}

impl<F> Dispatcher for FnDispatcher<F>
where
    F: Fn(&RequestEnvelope, &MaterializedBody, &ResponseWriter) -> Result<(), DispatchError>
        + Send
        + Sync
        + 'static,
{
    fn invoke(
        &self,
        request: &RequestEnvelope,
        body: &MaterializedBody,
        response: &ResponseWriter,
    ) -> Result<(), DispatchError> {
        (self.f)(request, body, response)
    }
}

impl<F> fmt::Debug for FnDispatcher<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnDispatcher").finish_non_exhaustive()
    }
}

/// Work run after every dispatch, whatever its outcome.
#[derive(Clone)]
pub struct CleanupTask {
    run: Arc<dyn Fn() -> Result<(), BoxError> + Send + Sync>,
}

impl CleanupTask {
    /// Wraps a closure as a cleanup task.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn() -> Result<(), BoxError> + Send + Sync + 'static,
    {
        Self { run: Arc::new(f) }
    }

    /// Runs the task once.
    pub fn run(&self) -> Result<(), BoxError> {
        (self.run)()
    }
}

impl fmt::Debug for CleanupTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CleanupTask").finish_non_exhaustive()
    }
}

/// Runs `tasks` in order, stopping at the first failure.
///
/// A panicking task counts as a failure.
pub fn run_cleanup_tasks(tasks: &[CleanupTask]) -> Result<(), BridgeError> {
    for (index, task) in tasks.iter().enumerate() {
        match panic::catch_unwind(AssertUnwindSafe(|| task.run())) {
            Ok(Ok(())) => {}
            Ok(Err(source)) => return Err(BridgeError::cleanup(index, source)),
            Err(payload) => {
                let panicked = DispatchError::panicked(payload.as_ref());
                return Err(BridgeError::cleanup(index, panicked));
            }
        }
    }
    Ok(())
}

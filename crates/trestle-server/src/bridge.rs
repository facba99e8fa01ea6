//! The per-request bridge between hyper and a synchronous [`Dispatcher`].
//!
//! For every request the bridge:
//!
//! 1. buffers the body into a [`MaterializedBody`],
//! 2. builds the [`RequestEnvelope`] with the absolute request URI,
//! 3. makes the provider context current and invokes the dispatcher,
//! 4. runs the cleanup tasks in order, whatever the dispatcher did,
//! 5. closes the response unless the dispatcher suspended it,
//! 6. waits for the completion signal, bounded by a declared timeout,
//! 7. releases the body, and hands any failure to the [resolver](crate::resolver).
//!
//! The response is returned to hyper as soon as its head is committed. The
//! remaining steps are driven by polling the [`ResponseBody`].

use std::convert::Infallible;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use http::{request, Method, Request, Response, StatusCode};
use http_body::Body;
use tokio::sync::Semaphore;
use tracing::Instrument;
use trestle_core::{
    run_cleanup_tasks, BodyAggregator, BoxError, BridgeError, CleanupTask, CompletionSignal,
    ConnectionInfo, DispatchError, Dispatcher, MaterializedBody, ProviderContext, ReleaseHook,
    ReleaseReason, RequestEnvelope, RequestId, ResponseChannels, ResponseWriter,
};
use trestle_telemetry::metrics::{
    record_body_released, record_request, record_request_size, record_suspended, InFlightGuard,
};

use crate::body::{declared_length, Exchange, ResponseBody};
use crate::config::DispatchMode;
use crate::resolver;

/// Connects one [`Dispatcher`] to the transport.
///
/// Shared by every connection of a server.
pub struct Bridge {
    invocation: Invocation,
    aggregator: BodyAggregator,
    context_path: String,
    offload: Option<Arc<Semaphore>>,
}

impl Bridge {
    /// Starts building a bridge around `dispatcher`.
    #[must_use]
    pub fn builder(dispatcher: impl Dispatcher) -> BridgeBuilder {
        BridgeBuilder::new(Arc::new(dispatcher))
    }

    /// Returns the normalized context path.
    #[must_use]
    pub fn context_path(&self) -> &str {
        &self.context_path
    }

    /// Handles one request.
    ///
    /// Resolves once the response head is committed, either by the
    /// dispatcher or by the resolver. Dropping the returned future cancels the
    /// exchange and discards the request body; see [`ResponseBody`] for what
    /// dropping the body does.
    pub async fn handle<B>(self: Arc<Self>, request: Request<B>, conn: ConnectionInfo) -> Response<ResponseBody>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<BoxError>,
    {
        let started = Instant::now();
        let request_id = RequestId::new();
        let span = tracing::debug_span!(
            "request",
            request_id = %request_id,
            http.method = %request.method(),
            http.path = %request.uri().path(),
            net.peer = %conn.remote_addr(),
        );

        let (parts, body) = request.into_parts();
        let head_only = parts.method == Method::HEAD;
        let (writer, channels) = ResponseWriter::new(&parts.method, CompletionSignal::new());
        let ResponseChannels { mut head, body: chunks } = channels;
        let writer = Arc::new(writer);

        let mut exchange: Exchange = Box::pin(
            Arc::clone(&self)
                .exchange(request_id, started, parts, body, conn, writer)
                .instrument(span.clone()),
        );

        let response = tokio::select! {
            biased;
            Ok(parts) = &mut head => {
                let declared = declared_length(head_only, &parts);
                Response::from_parts(parts, ResponseBody::streaming(chunks, exchange, declared))
            }
            result = &mut exchange => {
                let body = ResponseBody::settled(chunks, result.err());
                match head.try_recv() {
                    Ok(parts) => Response::from_parts(parts, body),
                    Err(_) => {
                        let mut response = Response::new(body);
                        *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                        response
                    }
                }
            }
        };

        let status = response.status().as_u16();
        span.in_scope(|| {
            trestle_telemetry::log_response_committed!(request_id, status, started.elapsed().as_millis() as u64);
        });
        response
    }

    /// [`handle`](Self::handle) in the shape hyper's `service_fn` expects.
    pub async fn serve<B>(self: Arc<Self>, request: Request<B>, conn: ConnectionInfo) -> Result<Response<ResponseBody>, Infallible>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<BoxError>,
    {
        Ok(self.handle(request, conn).await)
    }

    async fn exchange<B>(
        self: Arc<Self>,
        request_id: RequestId,
        started: Instant,
        parts: request::Parts,
        body: B,
        conn: ConnectionInfo,
        writer: Arc<ResponseWriter>,
    ) -> Result<(), BridgeError>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<BoxError>,
    {
        let _in_flight = InFlightGuard::new();

        let result = match self.aggregator.aggregate(body).await {
            Ok(body) => {
                record_request_size(body.len());
                let body = Arc::new(body);
                let result = self.dispatch_and_wait(request_id, &parts, &conn, &body, &writer).await;
                body.close();
                result
            }
            Err(error) => Err(error),
        };

        let resolved = match result {
            Ok(()) => Ok(()),
            Err(error) => resolver::resolve(request_id, error, &writer, writer.timeout().is_some()),
        };

        let status = writer.status().as_u16();
        let elapsed = started.elapsed();
        record_request(status, elapsed);
        trestle_telemetry::log_request_finished!(request_id, status, elapsed.as_millis() as u64);
        resolved
    }

    async fn dispatch_and_wait(
        &self,
        request_id: RequestId,
        parts: &request::Parts,
        conn: &ConnectionInfo,
        body: &Arc<MaterializedBody>,
        writer: &Arc<ResponseWriter>,
    ) -> Result<(), BridgeError> {
        let envelope = Arc::new(RequestEnvelope::from_parts(request_id, parts, conn, &self.context_path)?);
        tracing::trace!(uri = %envelope.uri(), bytes = body.len(), "dispatching request");

        self.dispatch(envelope, Arc::clone(body), Arc::clone(writer)).await?;

        let outcome = writer.outcome();
        if outcome.suspended {
            record_suspended();
            tracing::debug!(committed = outcome.committed, timeout = ?outcome.timeout, "request suspended");
        } else {
            tracing::trace!(committed = outcome.committed, "dispatcher returned, closing response");
            writer.close()?;
        }

        writer.signal().wait(outcome.timeout).await.map_err(BridgeError::from)
    }

    async fn dispatch(
        &self,
        envelope: Arc<RequestEnvelope>,
        body: Arc<MaterializedBody>,
        writer: Arc<ResponseWriter>,
    ) -> Result<(), BridgeError> {
        let Some(semaphore) = &self.offload else {
            return self.invocation.run(&envelope, &body, &writer);
        };

        let permit = Arc::clone(semaphore)
            .acquire_owned()
            .await
            .map_err(|e| DispatchError::failed_with_source("dispatch pool closed", e))?;
        let invocation = self.invocation.clone();
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            invocation.run(&envelope, &body, &writer)
        })
        .await
        .map_err(|e| DispatchError::failed_with_source("offloaded dispatch did not finish", e))?
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("context_path", &self.context_path)
            .field("cleanup_tasks", &self.invocation.cleanup.len())
            .field("offload", &self.offload.is_some())
            .finish_non_exhaustive()
    }
}

/// Dispatcher call plus the work that brackets it.
#[derive(Clone)]
struct Invocation {
    dispatcher: Arc<dyn Dispatcher>,
    cleanup: Arc<[CleanupTask]>,
    context: Option<ProviderContext>,
}

impl Invocation {
    fn run(
        &self,
        request: &RequestEnvelope,
        body: &MaterializedBody,
        response: &ResponseWriter,
    ) -> Result<(), BridgeError> {
        let _context = self.context.as_ref().map(ProviderContext::push);

        let dispatched = panic::catch_unwind(AssertUnwindSafe(|| {
            self.dispatcher.invoke(request, body, response)
        }))
        .unwrap_or_else(|payload| Err(DispatchError::panicked(payload.as_ref())));

        let cleaned = run_cleanup_tasks(&self.cleanup);

        match (dispatched, cleaned) {
            (Ok(()), cleaned) => cleaned,
            (Err(dispatch), Ok(())) => Err(dispatch.into()),
            (Err(dispatch), Err(cleanup)) => {
                tracing::warn!(error = %cleanup, "cleanup failed after dispatch error");
                Err(dispatch.into())
            }
        }
    }
}

/// Builder for [`Bridge`].
pub struct BridgeBuilder {
    dispatcher: Arc<dyn Dispatcher>,
    cleanup: Vec<CleanupTask>,
    context: Option<ProviderContext>,
    release_hook: Option<ReleaseHook>,
    context_path: String,
    mode: DispatchMode,
}

impl BridgeBuilder {
    /// Creates a builder for an already shared dispatcher.
    #[must_use]
    pub fn new(dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            dispatcher,
            cleanup: Vec::new(),
            context: None,
            release_hook: None,
            context_path: String::new(),
            mode: DispatchMode::Inline,
        }
    }

    /// Appends a task run after every dispatch.
    #[must_use]
    pub fn cleanup_task(mut self, task: CleanupTask) -> Self {
        self.cleanup.push(task);
        self
    }

    /// Appends several cleanup tasks, keeping their order.
    #[must_use]
    pub fn cleanup_tasks(mut self, tasks: impl IntoIterator<Item = CleanupTask>) -> Self {
        self.cleanup.extend(tasks);
        self
    }

    /// Sets the context made current during dispatch.
    #[must_use]
    pub fn provider_context(mut self, context: ProviderContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Sets a hook called once per request body release.
    #[must_use]
    pub fn release_hook(mut self, hook: ReleaseHook) -> Self {
        self.release_hook = Some(hook);
        self
    }

    /// Sets the context path. Must already be normalized.
    #[must_use]
    pub fn context_path(mut self, path: impl Into<String>) -> Self {
        self.context_path = path.into();
        self
    }

    /// Sets where the dispatcher runs.
    #[must_use]
    pub fn dispatch_mode(mut self, mode: DispatchMode) -> Self {
        self.mode = mode;
        self
    }

    /// Builds the bridge.
    #[must_use]
    pub fn build(self) -> Bridge {
        let user_hook = self.release_hook;
        let hook: ReleaseHook = Arc::new(move |reason: ReleaseReason, len: usize| {
            record_body_released(reason.as_str());
            if let Some(hook) = &user_hook {
                hook(reason, len);
            }
        });

        let offload = match self.mode {
            DispatchMode::Inline => None,
            DispatchMode::Offload { max_concurrent } => Some(Arc::new(Semaphore::new(max_concurrent.max(1)))),
        };

        Bridge {
            invocation: Invocation {
                dispatcher: self.dispatcher,
                cleanup: self.cleanup.into(),
                context: self.context,
            },
            aggregator: BodyAggregator::new().with_release_hook(hook),
            context_path: self.context_path,
            offload,
        }
    }
}

impl std::fmt::Debug for BridgeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeBuilder")
            .field("cleanup_tasks", &self.cleanup.len())
            .field("context_path", &self.context_path)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

//! Response writing for synchronous and suspended requests.
//!
//! A [`ResponseWriter`] is handed to the dispatcher by reference. Status and
//! headers can change until the response is *committed*, which happens on the
//! first body write, an explicit [`flush`](ResponseWriter::flush), or
//! [`close`](ResponseWriter::close). The committed head travels to the
//! transport over a oneshot channel; body chunks follow over an unbounded
//! channel, so writes never block the calling thread.
//!
//! Calling [`suspend`](ResponseWriter::suspend) hands out an
//! [`AsyncResponse`] that may finish the response later from any thread.

use crate::completion::CompletionSignal;
use crate::error::{BridgeError, ResponseError};
use bytes::Bytes;
use http::header::CONTENT_LENGTH;
use http::{HeaderMap, HeaderName, HeaderValue, Method, Response, StatusCode};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// The committed status line and headers.
pub type ResponseHead = http::response::Parts;

/// What the bridge learns about a request after the dispatcher returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// The dispatcher suspended the request for asynchronous completion.
    pub suspended: bool,
    /// The response head has been sent.
    pub committed: bool,
    /// Bound on how long the bridge waits for completion.
    pub timeout: Option<Duration>,
}

/// Transport-side ends of a response.
#[derive(Debug)]
pub struct ResponseChannels {
    /// Receives the head once the response is committed.
    pub head: oneshot::Receiver<ResponseHead>,
    /// Receives body chunks in write order.
    pub body: mpsc::UnboundedReceiver<Bytes>,
}

struct Shared {
    signal: CompletionSignal,
    head_only: bool,
    committed: AtomicBool,
    suspended: AtomicBool,
    state: Mutex<WriterState>,
}

struct WriterState {
    status: StatusCode,
    headers: HeaderMap,
    head_tx: Option<oneshot::Sender<ResponseHead>>,
    body_tx: Option<mpsc::UnboundedSender<Bytes>>,
    written: usize,
    timeout: Option<Duration>,
}

impl Shared {
    fn commit(&self, state: &mut WriterState) -> Result<(), ResponseError> {
        let Some(head_tx) = state.head_tx.take() else {
            return Ok(());
        };
        let (mut head, ()) = Response::new(()).into_parts();
        head.status = state.status;
        head.headers = std::mem::take(&mut state.headers);
        self.committed.store(true, Ordering::Release);
        tracing::trace!(status = head.status.as_u16(), "response committed");
        head_tx.send(head).map_err(|_| ResponseError::Disconnected)
    }

    fn write(&self, chunk: Bytes) -> Result<(), ResponseError> {
        let mut state = self.state.lock();
        if state.body_tx.is_none() {
            return Err(ResponseError::Closed);
        }
        self.commit(&mut state)?;
        if chunk.is_empty() || self.head_only {
            return Ok(());
        }
        state.written += chunk.len();
        match &state.body_tx {
            Some(tx) => tx.send(chunk).map_err(|_| ResponseError::Disconnected),
            None => Err(ResponseError::Closed),
        }
    }

    fn close(&self) -> Result<(), ResponseError> {
        let mut state = self.state.lock();
        if state.body_tx.is_none() {
            return Ok(());
        }
        if state.head_tx.is_some() && state.written == 0 && !state.headers.contains_key(CONTENT_LENGTH) {
            state.headers.insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
        }
        let committed = self.commit(&mut state);
        state.body_tx = None;
        drop(state);
        committed?;
        self.signal.succeed();
        Ok(())
    }

    fn set_status(&self, status: StatusCode) -> Result<(), ResponseError> {
        let mut state = self.state.lock();
        if state.head_tx.is_none() {
            return Err(ResponseError::Committed);
        }
        state.status = status;
        Ok(())
    }

    fn insert_header(&self, name: HeaderName, value: HeaderValue, append: bool) -> Result<(), ResponseError> {
        let mut state = self.state.lock();
        if state.head_tx.is_none() {
            return Err(ResponseError::Committed);
        }
        if append {
            state.headers.append(name, value);
        } else {
            state.headers.insert(name, value);
        }
        Ok(())
    }
}

/// Response handle passed to the dispatcher.
///
/// # Example
///
/// ```
/// use http::{Method, StatusCode};
/// use trestle_core::{CompletionSignal, ResponseWriter};
///
/// let (writer, mut channels) = ResponseWriter::new(&Method::GET, CompletionSignal::new());
/// writer.set_status(StatusCode::CREATED).unwrap();
/// writer.write("done").unwrap();
/// writer.close().unwrap();
///
/// let head = channels.head.try_recv().unwrap();
/// assert_eq!(head.status, StatusCode::CREATED);
/// assert_eq!(channels.body.try_recv().unwrap(), "done");
/// assert!(writer.signal().is_done());
/// ```
pub struct ResponseWriter {
    shared: Arc<Shared>,
}

impl ResponseWriter {
    /// Creates a writer for a request with `method`, resolving `signal` on close.
    ///
    /// Body bytes written for `HEAD` requests are dropped.
    #[must_use]
    pub fn new(method: &Method, signal: CompletionSignal) -> (Self, ResponseChannels) {
        let (head_tx, head_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::unbounded_channel();
        let shared = Shared {
            signal,
            head_only: method == Method::HEAD,
            committed: AtomicBool::new(false),
            suspended: AtomicBool::new(false),
            state: Mutex::new(WriterState {
                status: StatusCode::OK,
                headers: HeaderMap::new(),
                head_tx: Some(head_tx),
                body_tx: Some(body_tx),
                written: 0,
                timeout: None,
            }),
        };
        let channels = ResponseChannels {
            head: head_rx,
            body: body_rx,
        };
        (
            Self {
                shared: Arc::new(shared),
            },
            channels,
        )
    }

    /// Returns the completion signal this response resolves.
    #[must_use]
    pub fn signal(&self) -> &CompletionSignal {
        &self.shared.signal
    }

    /// Returns the status that is (or will be) sent.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.shared.state.lock().status
    }

    /// Sets the status code. Fails once committed.
    pub fn set_status(&self, status: StatusCode) -> Result<(), ResponseError> {
        self.shared.set_status(status)
    }

    /// Sets a header, replacing existing values. Fails once committed.
    pub fn insert_header(&self, name: HeaderName, value: HeaderValue) -> Result<(), ResponseError> {
        self.shared.insert_header(name, value, false)
    }

    /// Adds a header value. Fails once committed.
    pub fn append_header(&self, name: HeaderName, value: HeaderValue) -> Result<(), ResponseError> {
        self.shared.insert_header(name, value, true)
    }

    /// Writes a body chunk, committing the head first if needed.
    pub fn write(&self, chunk: impl Into<Bytes>) -> Result<(), ResponseError> {
        self.shared.write(chunk.into())
    }

    /// Commits the head without writing body bytes.
    pub fn flush(&self) -> Result<(), ResponseError> {
        let mut state = self.shared.state.lock();
        if state.body_tx.is_none() {
            return Err(ResponseError::Closed);
        }
        self.shared.commit(&mut state)
    }

    /// Finishes the response and resolves the completion signal as succeeded.
    ///
    /// Closing an already closed response does nothing.
    pub fn close(&self) -> Result<(), ResponseError> {
        self.shared.close()
    }

    /// Replaces an uncommitted response with an empty one carrying `status`.
    ///
    /// Returns [`ResponseError::Committed`] if the head already went out. The
    /// completion signal is left alone; the caller decides how to resolve it.
    pub fn send_status(&self, status: StatusCode) -> Result<(), ResponseError> {
        let mut state = self.shared.state.lock();
        if state.head_tx.is_none() {
            return Err(ResponseError::Committed);
        }
        state.status = status;
        state.headers.clear();
        state
            .headers
            .insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
        let committed = self.shared.commit(&mut state);
        state.body_tx = None;
        committed
    }

    /// Returns `true` once the head has been sent.
    #[must_use]
    pub fn is_committed(&self) -> bool {
        self.shared.committed.load(Ordering::Acquire)
    }

    /// Returns `true` once the body has been ended.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().body_tx.is_none()
    }

    /// Suspends the request; the bridge will not close the response when the
    /// dispatcher returns.
    #[must_use]
    pub fn suspend(&self) -> AsyncResponse {
        self.shared.suspended.store(true, Ordering::Release);
        AsyncResponse {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Returns `true` if [`suspend`](Self::suspend) was called.
    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.shared.suspended.load(Ordering::Acquire)
    }

    /// Bounds how long the bridge waits for the response to complete.
    pub fn set_timeout(&self, timeout: Duration) {
        self.shared.state.lock().timeout = Some(timeout);
    }

    /// Returns the declared completion timeout.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.shared.state.lock().timeout
    }

    /// Snapshots the state the bridge acts on after dispatch.
    #[must_use]
    pub fn outcome(&self) -> DispatchOutcome {
        DispatchOutcome {
            suspended: self.is_suspended(),
            committed: self.is_committed(),
            timeout: self.timeout(),
        }
    }
}

impl std::fmt::Debug for ResponseWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseWriter")
            .field("outcome", &self.outcome())
            .finish_non_exhaustive()
    }
}

/// Handle for finishing a suspended response from another thread.
///
/// # Example
///
/// ```
/// use http::Method;
/// use trestle_core::{CompletionSignal, ResponseWriter};
///
/// let (writer, _channels) = ResponseWriter::new(&Method::GET, CompletionSignal::new());
/// let resume = writer.suspend();
/// std::thread::spawn(move || {
///     resume.write("later").unwrap();
///     resume.complete().unwrap();
/// })
/// .join()
/// .unwrap();
/// assert!(writer.signal().is_done());
/// ```
#[derive(Clone)]
pub struct AsyncResponse {
    shared: Arc<Shared>,
}

impl AsyncResponse {
    /// Sets the status code. Fails once committed.
    pub fn set_status(&self, status: StatusCode) -> Result<(), ResponseError> {
        self.shared.set_status(status)
    }

    /// Sets a header, replacing existing values. Fails once committed.
    pub fn insert_header(&self, name: HeaderName, value: HeaderValue) -> Result<(), ResponseError> {
        self.shared.insert_header(name, value, false)
    }

    /// Writes a body chunk, committing the head first if needed.
    pub fn write(&self, chunk: impl Into<Bytes>) -> Result<(), ResponseError> {
        self.shared.write(chunk.into())
    }

    /// Finishes the response and resolves the completion signal as succeeded.
    pub fn complete(&self) -> Result<(), ResponseError> {
        self.shared.close()
    }

    /// Resolves the completion signal as failed.
    ///
    /// Returns `false` if the request already completed.
    pub fn fail(&self, error: impl Into<BridgeError>) -> bool {
        self.shared.signal.fail(error.into())
    }

    /// Returns `true` once the request has completed either way.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.shared.signal.is_done()
    }

    /// Returns `true` once the head has been sent.
    #[must_use]
    pub fn is_committed(&self) -> bool {
        self.shared.committed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for AsyncResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncResponse")
            .field("done", &self.is_done())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DispatchError;

    fn writer(method: &Method) -> (ResponseWriter, ResponseChannels) {
        ResponseWriter::new(method, CompletionSignal::new())
    }

    #[test]
    fn test_close_without_body_sets_zero_length() {
        let (writer, mut channels) = writer(&Method::GET);
        writer.set_status(StatusCode::NO_CONTENT).unwrap();
        writer.close().unwrap();

        let head = channels.head.try_recv().unwrap();
        assert_eq!(head.status, StatusCode::NO_CONTENT);
        assert_eq!(head.headers[CONTENT_LENGTH], "0");
        assert!(writer.is_committed());
        assert!(writer.is_closed());
        assert!(writer.signal().is_done());
    }

    #[test]
    fn test_first_write_commits() {
        let (writer, mut channels) = writer(&Method::GET);
        writer
            .insert_header(http::header::CONTENT_TYPE, HeaderValue::from_static("text/plain"))
            .unwrap();
        assert!(!writer.is_committed());

        writer.write("a").unwrap();
        writer.write("b").unwrap();
        assert!(writer.is_committed());
        assert_eq!(writer.set_status(StatusCode::ACCEPTED), Err(ResponseError::Committed));
        assert_eq!(
            writer.insert_header(http::header::ETAG, HeaderValue::from_static("x")),
            Err(ResponseError::Committed)
        );

        let head = channels.head.try_recv().unwrap();
        assert_eq!(head.status, StatusCode::OK);
        assert_eq!(head.headers[http::header::CONTENT_TYPE], "text/plain");
        assert!(!head.headers.contains_key(CONTENT_LENGTH));
        assert_eq!(channels.body.try_recv().unwrap(), "a");
        assert_eq!(channels.body.try_recv().unwrap(), "b");
        assert!(!writer.signal().is_done());
    }

    #[test]
    fn test_write_after_close_fails() {
        let (writer, _channels) = writer(&Method::GET);
        writer.close().unwrap();
        assert_eq!(writer.write("late"), Err(ResponseError::Closed));
        assert_eq!(writer.flush(), Err(ResponseError::Closed));
        assert!(writer.close().is_ok());
    }

    #[test]
    fn test_head_request_drops_body_bytes() {
        let (writer, mut channels) = writer(&Method::HEAD);
        writer
            .insert_header(CONTENT_LENGTH, HeaderValue::from_static("5"))
            .unwrap();
        writer.write("hello").unwrap();
        writer.close().unwrap();

        let head = channels.head.try_recv().unwrap();
        assert_eq!(head.headers[CONTENT_LENGTH], "5");
        assert!(channels.body.try_recv().is_err());
    }

    #[test]
    fn test_send_status_refused_after_commit() {
        let (writer, mut channels) = writer(&Method::GET);
        writer.flush().unwrap();
        assert_eq!(
            writer.send_status(StatusCode::SERVICE_UNAVAILABLE),
            Err(ResponseError::Committed)
        );
        assert_eq!(channels.head.try_recv().unwrap().status, StatusCode::OK);
    }

    #[test]
    fn test_send_status_replaces_uncommitted_response() {
        let (writer, mut channels) = writer(&Method::GET);
        writer
            .insert_header(http::header::CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .unwrap();
        writer.send_status(StatusCode::INTERNAL_SERVER_ERROR).unwrap();

        let head = channels.head.try_recv().unwrap();
        assert_eq!(head.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!head.headers.contains_key(http::header::CONTENT_TYPE));
        assert!(writer.is_closed());
        assert!(!writer.signal().is_done());
    }

    #[test]
    fn test_commit_with_dropped_transport_reports_disconnect() {
        let (writer, channels) = writer(&Method::GET);
        drop(channels);
        assert_eq!(writer.write("x"), Err(ResponseError::Disconnected));
    }

    #[test]
    fn test_outcome_tracks_suspension_and_timeout() {
        let (writer, _channels) = writer(&Method::POST);
        assert_eq!(
            writer.outcome(),
            DispatchOutcome {
                suspended: false,
                committed: false,
                timeout: None
            }
        );

        let _resume = writer.suspend();
        writer.set_timeout(Duration::from_millis(250));
        let outcome = writer.outcome();
        assert!(outcome.suspended);
        assert!(!outcome.committed);
        assert_eq!(outcome.timeout, Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_outcome_reports_commit_before_suspension() {
        let (writer, _channels) = writer(&Method::GET);
        writer.write("partial").unwrap();
        let resume = writer.suspend();

        let outcome = writer.outcome();
        assert!(outcome.suspended);
        assert!(outcome.committed);

        resume.complete().unwrap();
        assert!(writer.outcome().committed);
    }

    #[test]
    fn test_outcome_reports_flush_as_committed() {
        let (writer, mut channels) = writer(&Method::GET);
        writer.flush().unwrap();
        assert!(writer.outcome().committed);
        assert!(channels.head.try_recv().is_ok());
        assert!(!writer.is_closed());
    }

    #[test]
    fn test_async_response_completes_from_other_thread() {
        let (writer, mut channels) = writer(&Method::GET);
        let resume = writer.suspend();
        std::thread::spawn(move || {
            resume.set_status(StatusCode::ACCEPTED).unwrap();
            resume.write("async").unwrap();
            resume.complete().unwrap();
        })
        .join()
        .unwrap();

        assert_eq!(channels.head.try_recv().unwrap().status, StatusCode::ACCEPTED);
        assert_eq!(channels.body.try_recv().unwrap(), "async");
        assert!(matches!(writer.signal().outcome(), Some(Ok(()))));
    }

    #[test]
    fn test_async_fail_after_complete_is_ignored() {
        let (writer, _channels) = writer(&Method::GET);
        let resume = writer.suspend();
        resume.complete().unwrap();
        assert!(!resume.fail(DispatchError::failed("too late")));
        assert!(resume.is_done());
        assert!(matches!(writer.signal().outcome(), Some(Ok(()))));
    }
}

//! Request body aggregation.
//!
//! The dispatcher works on a fully buffered body. [`BodyAggregator`] drains a
//! streamed [`http_body::Body`] into a [`MaterializedBody`], which is released
//! exactly once: through [`MaterializedBody::close`] on normal completion, or
//! through the discard path when it (or a half-read buffer) is dropped first.

use crate::error::{BoxError, BridgeError};
use bytes::{BufMut, Bytes, BytesMut};
use http_body::Body;
use http_body_util::BodyExt;
use std::fmt;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// How a body buffer was released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReleaseReason {
    /// Released after the exchange completed.
    Completed,
    /// Released because the exchange was abandoned before completing.
    Discarded,
}

impl ReleaseReason {
    /// Returns a short label suitable for metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Discarded => "discarded",
        }
    }
}

/// Callback invoked once per body release with the reason and byte length.
pub type ReleaseHook = Arc<dyn Fn(ReleaseReason, usize) + Send + Sync>;

#[derive(Clone)]
enum Content {
    Empty,
    Bytes(Bytes),
}

/// A fully buffered request body, or the explicit empty marker.
///
/// # Example
///
/// ```
/// use std::io::Read;
/// use trestle_core::MaterializedBody;
///
/// let body = MaterializedBody::from_bytes("hello");
/// let mut text = String::new();
/// body.reader().read_to_string(&mut text).unwrap();
/// assert_eq!(text, "hello");
/// assert!(MaterializedBody::from_bytes("").is_empty_marker());
/// ```
pub struct MaterializedBody {
    content: Content,
    released: AtomicBool,
    hook: Option<ReleaseHook>,
}

impl MaterializedBody {
    /// Returns the empty marker.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            content: Content::Empty,
            released: AtomicBool::new(false),
            hook: None,
        }
    }

    /// Wraps bytes; zero bytes yield the empty marker.
    #[must_use]
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Self::empty();
        }
        Self {
            content: Content::Bytes(bytes),
            released: AtomicBool::new(false),
            hook: None,
        }
    }

    fn with_hook(mut self, hook: Option<ReleaseHook>) -> Self {
        self.hook = hook;
        self
    }

    /// Returns `true` for the empty marker.
    #[must_use]
    pub const fn is_empty_marker(&self) -> bool {
        matches!(self.content, Content::Empty)
    }

    /// Returns the number of buffered bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match &self.content {
            Content::Empty => 0,
            Content::Bytes(bytes) => bytes.len(),
        }
    }

    /// Returns `true` if no bytes are buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the buffered bytes; empty for the marker.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match &self.content {
            Content::Empty => &[],
            Content::Bytes(bytes) => bytes,
        }
    }

    /// Returns a cheap clone of the buffer, or `None` for the empty marker.
    #[must_use]
    pub fn to_bytes(&self) -> Option<Bytes> {
        match &self.content {
            Content::Empty => None,
            Content::Bytes(bytes) => Some(bytes.clone()),
        }
    }

    /// Returns a blocking reader over the buffered bytes.
    #[must_use]
    pub fn reader(&self) -> Cursor<&[u8]> {
        Cursor::new(self.as_bytes())
    }

    /// Releases the body after normal completion.
    ///
    /// Returns `false` if it was already released.
    pub fn close(&self) -> bool {
        self.release(ReleaseReason::Completed)
    }

    /// Releases the body without completing the exchange.
    ///
    /// Returns `false` if it was already released.
    pub fn discard(&self) -> bool {
        self.release(ReleaseReason::Discarded)
    }

    /// Returns `true` once the body has been released.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    fn release(&self, reason: ReleaseReason) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        tracing::trace!(reason = reason.as_str(), bytes = self.len(), "request body released");
        if let Some(hook) = &self.hook {
            hook(reason, self.len());
        }
        true
    }
}

impl Drop for MaterializedBody {
    fn drop(&mut self) {
        self.discard();
    }
}

impl fmt::Debug for MaterializedBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MaterializedBody")
            .field("empty_marker", &self.is_empty_marker())
            .field("len", &self.len())
            .field("released", &self.is_released())
            .finish_non_exhaustive()
    }
}

/// Drains streamed request bodies into [`MaterializedBody`] values.
#[derive(Clone, Default)]
pub struct BodyAggregator {
    hook: Option<ReleaseHook>,
}

impl BodyAggregator {
    /// Creates an aggregator without a release hook.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the hook invoked whenever a body buffer is released.
    #[must_use]
    pub fn with_release_hook(mut self, hook: ReleaseHook) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Collects every data frame of `body`. Trailers are ignored.
    ///
    /// If the returned future is dropped part-way, the partial buffer is
    /// released through the discard path.
    pub async fn aggregate<B>(&self, body: B) -> Result<MaterializedBody, BridgeError>
    where
        B: Body,
        B::Error: Into<BoxError>,
    {
        let mut partial = PartialBody {
            buf: BytesMut::new(),
            hook: self.hook.clone(),
            done: false,
        };
        let mut body = std::pin::pin!(body);

        while let Some(frame) = body.frame().await {
            let frame = frame.map_err(|e| {
                tracing::debug!(buffered = partial.buf.len(), "request body read failed");
                BridgeError::body_read(e)
            })?;
            if let Ok(data) = frame.into_data() {
                partial.buf.put(data);
            }
        }

        Ok(partial.finish())
    }
}

impl fmt::Debug for BodyAggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyAggregator")
            .field("hook", &self.hook.is_some())
            .finish()
    }
}

struct PartialBody {
    buf: BytesMut,
    hook: Option<ReleaseHook>,
    done: bool,
}

impl PartialBody {
    fn finish(mut self) -> MaterializedBody {
        self.done = true;
        let bytes = std::mem::take(&mut self.buf).freeze();
        MaterializedBody::from_bytes(bytes).with_hook(self.hook.take())
    }
}

impl Drop for PartialBody {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        tracing::debug!(bytes = self.buf.len(), "discarding partially read request body");
        if let Some(hook) = &self.hook {
            hook(ReleaseReason::Discarded, self.buf.len());
        }
    }
}

//! Response body handed to hyper.
//!
//! The body streams chunks written through the response writer and keeps
//! driving the rest of the exchange (completion wait, error resolution) while
//! hyper polls it.
//!
//! hyper drops the body as soon as the declared `Content-Length` has been
//! written, possibly before a suspended request completes. A body dropped
//! after delivering every declared byte hands the unfinished exchange to the
//! runtime. Any other drop cancels the exchange, which discards the request
//! body.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use http::header::CONTENT_LENGTH;
use http::StatusCode;
use http_body::{Body, Frame, SizeHint};
use tokio::sync::mpsc;
use trestle_core::BridgeError;

/// The remainder of a request exchange, polled by the response body.
pub(crate) type Exchange = Pin<Box<dyn Future<Output = Result<(), BridgeError>> + Send>>;

/// Streaming response body.
///
/// Ends cleanly when the exchange succeeds. When the exchange fails after the
/// head went out, the chunks already written are delivered and the body then
/// yields the error, which makes hyper abort the connection.
pub struct ResponseBody {
    chunks: Option<mpsc::UnboundedReceiver<Bytes>>,
    exchange: Option<Exchange>,
    failure: Option<BridgeError>,
    /// Declared bytes not yet yielded, when the head declares a length.
    remaining: Option<u64>,
}

impl ResponseBody {
    /// `declared` is the body length the committed head promises, see
    /// [`declared_length`].
    pub(crate) fn streaming(
        chunks: mpsc::UnboundedReceiver<Bytes>,
        exchange: Exchange,
        declared: Option<u64>,
    ) -> Self {
        Self {
            chunks: Some(chunks),
            exchange: Some(exchange),
            failure: None,
            remaining: declared,
        }
    }

    pub(crate) fn settled(mut chunks: mpsc::UnboundedReceiver<Bytes>, failure: Option<BridgeError>) -> Self {
        chunks.close();
        Self {
            chunks: Some(chunks),
            exchange: None,
            failure,
            remaining: None,
        }
    }

    /// A body with no data.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            chunks: None,
            exchange: None,
            failure: None,
            remaining: None,
        }
    }
}

impl Body for ResponseBody {
    type Data = Bytes;
    type Error = BridgeError;

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Bytes>, BridgeError>>> {
        let this = self.get_mut();
        loop {
            if let Some(chunks) = this.chunks.as_mut() {
                match chunks.poll_recv(cx) {
                    Poll::Ready(Some(chunk)) => {
                        if let Some(remaining) = this.remaining.as_mut() {
                            *remaining = remaining.saturating_sub(chunk.len() as u64);
                        }
                        return Poll::Ready(Some(Ok(Frame::data(chunk))));
                    }
                    Poll::Ready(None) => this.chunks = None,
                    Poll::Pending => {}
                }
            }

            if let Some(exchange) = this.exchange.as_mut() {
                if let Poll::Ready(result) = exchange.as_mut().poll(cx) {
                    this.exchange = None;
                    this.failure = result.err();
                    // Suspended completers may still hold a sender; deliver
                    // what is buffered and stop there.
                    if let Some(chunks) = this.chunks.as_mut() {
                        chunks.close();
                    }
                    continue;
                }
            }

            if this.chunks.is_none() && this.exchange.is_none() {
                return Poll::Ready(this.failure.take().map(Err));
            }
            return Poll::Pending;
        }
    }

    fn is_end_stream(&self) -> bool {
        self.chunks.is_none() && self.exchange.is_none() && self.failure.is_none()
    }

    fn size_hint(&self) -> SizeHint {
        if self.is_end_stream() {
            SizeHint::with_exact(0)
        } else {
            SizeHint::default()
        }
    }
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseBody")
            .field("streaming", &self.chunks.is_some())
            .field("exchange_pending", &self.exchange.is_some())
            .field("failed", &self.failure.is_some())
            .field("remaining", &self.remaining)
            .finish()
    }
}

impl Drop for ResponseBody {
    fn drop(&mut self) {
        let Some(exchange) = self.exchange.take() else {
            return;
        };
        if self.remaining != Some(0) {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(error) = exchange.await {
                        tracing::debug!(%error, "exchange failed after the response was delivered");
                    }
                });
            }
            Err(_) => tracing::debug!("no runtime to finish a delivered exchange; cancelling it"),
        }
    }
}

/// Body length promised by a committed head.
///
/// `HEAD` responses and statuses that never carry content promise zero
/// bytes. Otherwise the `Content-Length` header decides, if it parses.
pub(crate) fn declared_length(head_only: bool, head: &http::response::Parts) -> Option<u64> {
    let status = head.status;
    if head_only
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return Some(0);
    }
    head.headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
}

/// Polls a body to the end, collecting data or returning the first error.
#[cfg(test)]
pub(crate) async fn drain(body: ResponseBody) -> Result<Bytes, BridgeError> {
    use http_body_util::BodyExt;
    body.collect().await.map(http_body_util::Collected::to_bytes)
}

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use tokio::sync::mpsc;

use super::multipart::{self, MultipartStream};
use super::operations::{HttpClientOperations, ResponseState};
use super::{HttpClientError, HttpClientResult, RedirectHistory};
use crate::channel::ChannelLease;
use crate::http::{Cookies, HttpHeaders, HttpMethod, HttpVersion};

/// What the channel reader pushes into a body queue.
#[derive(Debug)]
pub(crate) enum BodyFrame {
    Data(Bytes),
    End,
    Failed(HttpClientError),
}

/// The successful outcome of a request: status, headers and a body that can be read once.
///
/// Dropping the response (and any body stream taken from it) closes the
/// underlying channel.
pub struct ClientResponse {
    ops: Arc<HttpClientOperations>,
    lease: ChannelLease,
}

impl core::fmt::Debug for ClientResponse {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ClientResponse")
            .field("status", &self.status())
            .field("uri", &self.ops.uri())
            .field("redirected_from", &self.ops.redirected_from())
            .finish_non_exhaustive()
    }
}

impl ClientResponse {
    pub(crate) fn new(ops: Arc<HttpClientOperations>, lease: ChannelLease) -> Self {
        Self { ops, lease }
    }

    fn state(&self) -> Option<&ResponseState> {
        self.ops.response()
    }

    /// Response status; 0 only if no head was recorded, which a successful exchange never produces.
    #[must_use]
    pub fn status(&self) -> u16 {
        self.state().map_or(0, ResponseState::status)
    }

    #[must_use]
    pub fn reason(&self) -> &str {
        self.state().map_or("", ResponseState::reason)
    }

    #[must_use]
    pub fn version(&self) -> HttpVersion {
        self.state().map_or_else(HttpVersion::default, ResponseState::version)
    }

    #[must_use]
    pub fn response_headers(&self) -> HttpHeaders {
        self.state()
            .map(|state| state.headers().clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<String> {
        self.state()
            .and_then(|state| state.headers().get(name))
            .map(ToString::to_string)
    }

    #[must_use]
    pub fn cookies(&self) -> Cookies {
        self.state()
            .map(|state| state.cookies().clone())
            .unwrap_or_default()
    }

    /// The URIs visited before the one that produced this response, oldest first.
    #[must_use]
    pub fn redirected_from(&self) -> RedirectHistory {
        self.ops.redirected_from()
    }

    #[must_use]
    pub fn method(&self) -> HttpMethod {
        self.ops.method()
    }

    #[must_use]
    pub fn uri(&self) -> String {
        self.ops.uri()
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.ops.is_disposed()
    }

    #[must_use]
    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.ops.remote_address()
    }

    #[must_use]
    pub fn operations(&self) -> &Arc<HttpClientOperations> {
        &self.ops
    }

    /// Takes the response body as a stream.
    ///
    /// # Errors
    ///
    /// `InboundAlreadyConsumed` on the second call.
    pub fn receive(&self) -> HttpClientResult<BodyStream> {
        let frames = self.ops.take_body()?;
        Ok(BodyStream::new(frames, self.lease.clone(), false))
    }

    /// Reads the whole body.
    ///
    /// # Errors
    ///
    /// `InboundAlreadyConsumed`, or the failure that cut the body short.
    pub async fn aggregate(&self) -> HttpClientResult<Bytes> {
        self.receive()?.aggregate().await
    }

    /// Reads the whole body as UTF-8 text, replacing invalid sequences.
    ///
    /// # Errors
    ///
    /// See [`ClientResponse::aggregate`].
    pub async fn aggregate_string(&self) -> HttpClientResult<String> {
        let body = self.aggregate().await?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    /// Takes the body as a stream of multipart entities.
    ///
    /// # Errors
    ///
    /// `InvalidMultipart` when the `Content-Type` is not `multipart/*` with a
    /// boundary, otherwise see [`ClientResponse::receive`].
    pub fn receive_multipart(&self) -> HttpClientResult<MultipartStream> {
        let content_type = self.header("content-type").unwrap_or_default();
        let Some(boundary) = multipart::boundary(&content_type) else {
            return Err(HttpClientError::InvalidMultipart(format!(
                "no multipart boundary in content type {content_type:?}"
            )));
        };
        Ok(MultipartStream::new(self.receive()?, &boundary))
    }

    /// Runs `on_idle` each time `idle` passes without the channel reading anything.
    pub fn on_read_idle<F>(&self, idle: Duration, on_idle: F) -> &Self
    where
        F: FnMut() + Send + 'static,
    {
        self.lease.channel().on_read_idle(idle, on_idle);
        self
    }

    /// Resolves once the underlying channel has closed.
    pub async fn on_close(&self) {
        self.lease.channel().closed().await;
    }

    /// Closes the underlying channel now.
    pub fn dispose(&self) {
        self.lease.channel().close();
    }
}

/// A response body, delivered chunk by chunk as it is read from the channel.
///
/// Each pending chunk holds back the channel reader, so a slow consumer slows
/// the socket instead of growing a buffer.
pub struct BodyStream {
    frames: mpsc::Receiver<BodyFrame>,
    _lease: ChannelLease,
    end_on_close: bool,
    done: bool,
}

impl BodyStream {
    pub(crate) fn new(frames: mpsc::Receiver<BodyFrame>, lease: ChannelLease, end_on_close: bool) -> Self {
        Self {
            frames,
            _lease: lease,
            end_on_close,
            done: false,
        }
    }

    /// Next chunk, `None` at the end of the body.
    pub async fn next_chunk(&mut self) -> Option<HttpClientResult<Bytes>> {
        std::future::poll_fn(|cx| self.poll_chunk(cx)).await
    }

    /// Collects the remaining body.
    ///
    /// # Errors
    ///
    /// The failure that cut the body short.
    pub async fn aggregate(mut self) -> HttpClientResult<Bytes> {
        let mut body = BytesMut::new();
        while let Some(chunk) = self.next_chunk().await {
            body.extend_from_slice(&chunk?);
        }
        Ok(body.freeze())
    }

    pub(crate) fn poll_chunk(&mut self, cx: &mut Context<'_>) -> Poll<Option<HttpClientResult<Bytes>>> {
        if self.done {
            return Poll::Ready(None);
        }
        let item = match self.frames.poll_recv(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Some(BodyFrame::Data(data))) => Some(Ok(data)),
            Poll::Ready(Some(BodyFrame::Failed(err))) => {
                self.done = true;
                Some(Err(err))
            }
            Poll::Ready(Some(BodyFrame::End)) => {
                self.done = true;
                None
            }
            Poll::Ready(None) => {
                self.done = true;
                if self.end_on_close {
                    None
                } else {
                    Some(Err(HttpClientError::ConnectionClosed))
                }
            }
        };
        Poll::Ready(item)
    }
}

impl Stream for BodyStream {
    type Item = HttpClientResult<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().poll_chunk(cx)
    }
}

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures_core::Stream;

use super::operations::HttpClientOperations;
use super::{HttpClientResult, RedirectHistory};
use crate::http::{Cookie, HttpHeaders, HttpMethod, HttpVersion};
use crate::websocket::{self, WebsocketSession};

/// The outbound view of one attempt, handed to the per-attempt request handler.
///
/// Header and cookie mutations are only accepted until the request head is
/// dispatched; afterwards they fail with `HeaderLocked`.
#[derive(Clone)]
pub struct ClientRequest {
    ops: Arc<HttpClientOperations>,
}

impl ClientRequest {
    pub(crate) fn new(ops: Arc<HttpClientOperations>) -> Self {
        Self { ops }
    }

    /// Sets `name`, replacing earlier values.
    ///
    /// # Errors
    ///
    /// `HeaderLocked` after dispatch, `InvalidHeader` for malformed input.
    pub fn header(&self, name: &str, value: &str) -> HttpClientResult<&Self> {
        self.ops.header(name, value)?;
        Ok(self)
    }

    /// Appends a value to `name`.
    ///
    /// # Errors
    ///
    /// `HeaderLocked` after dispatch, `InvalidHeader` for malformed input.
    pub fn add_header(&self, name: &str, value: &str) -> HttpClientResult<&Self> {
        self.ops.add_header(name, value)?;
        Ok(self)
    }

    /// # Errors
    ///
    /// `HeaderLocked` after dispatch.
    pub fn remove_header(&self, name: &str) -> HttpClientResult<&Self> {
        self.ops.remove_header(name)?;
        Ok(self)
    }

    /// # Errors
    ///
    /// `HeaderLocked` after dispatch, `InvalidCookie` for values that cannot be encoded.
    pub fn add_cookie(&self, cookie: &Cookie) -> HttpClientResult<&Self> {
        self.ops.add_cookie(cookie)?;
        Ok(self)
    }

    /// # Errors
    ///
    /// `HeaderLocked` after dispatch.
    pub fn keep_alive(&self, keep_alive: bool) -> HttpClientResult<&Self> {
        self.ops.keep_alive(keep_alive)?;
        Ok(self)
    }

    /// # Errors
    ///
    /// `HeaderLocked` after dispatch.
    pub fn disable_chunked_transfer(&self) -> HttpClientResult<&Self> {
        self.ops.disable_chunked_transfer()?;
        Ok(self)
    }

    /// Flushes each element of a streamed body as it is written.
    pub fn flush_each(&self) -> &Self {
        self.ops.flush_each();
        self
    }

    /// Follows 3xx responses for this request.
    pub fn follow_redirect(&self) -> &Self {
        self.ops.follow_redirect(true);
        self
    }

    #[must_use]
    pub fn is_follow_redirect(&self) -> bool {
        self.ops.is_follow_redirect()
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
    pub fn version(&self) -> HttpVersion {
        self.ops.version()
    }

    #[must_use]
    pub fn request_headers(&self) -> HttpHeaders {
        self.ops.request_headers()
    }

    #[must_use]
    pub fn is_keep_alive(&self) -> bool {
        self.ops.is_keep_alive()
    }

    #[must_use]
    pub fn has_sent_headers(&self) -> bool {
        self.ops.has_sent_headers()
    }

    #[must_use]
    pub fn redirected_from(&self) -> RedirectHistory {
        self.ops.redirected_from()
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.ops.is_disposed()
    }

    #[must_use]
    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.ops.remote_address()
    }

    /// # Errors
    ///
    /// `HeaderLocked` once an upgrade owns the request, or the write failure.
    pub async fn send_headers(&self) -> HttpClientResult<()> {
        self.ops.send_headers().await
    }

    /// Sends `data`; sent before the head, it is the whole body.
    ///
    /// # Errors
    ///
    /// `HeaderLocked` once an upgrade owns the request, `BodyAlreadySent`
    /// after a whole body, or the write failure.
    pub async fn send(&self, data: impl Into<Bytes>) -> HttpClientResult<()> {
        self.ops.send(data.into()).await
    }

    /// Streams `body`, flushing once at the end unless [`ClientRequest::flush_each`] was set.
    ///
    /// # Errors
    ///
    /// `HeaderLocked` once an upgrade owns the request, or the write failure.
    pub async fn send_stream<S>(&self, body: S) -> HttpClientResult<()>
    where
        S: Stream<Item = Bytes> + Send,
    {
        self.ops.send_stream(body).await
    }

    /// Upgrades this not yet dispatched request to a websocket and runs
    /// `handler` once the handshake response has been received.
    ///
    /// Resolves when `handler` finishes; the channel is closed then.
    ///
    /// # Errors
    ///
    /// `NotActive`, `UpgradeTooLate`, `UpgradeConflict` or `UpgradeFailed`
    /// when the upgrade cannot happen, otherwise whatever `handler` returns.
    pub async fn upgrade_to_websocket<F, Fut>(
        &self,
        protocols: &[&str],
        text_mode: bool,
        handler: F,
    ) -> HttpClientResult<()>
    where
        F: FnOnce(WebsocketSession) -> Fut + Send,
        Fut: Future<Output = HttpClientResult<()>> + Send,
    {
        websocket::upgrade(&self.ops, protocols, text_mode, handler).await
    }

    #[must_use]
    pub fn operations(&self) -> &Arc<HttpClientOperations> {
        &self.ops
    }
}

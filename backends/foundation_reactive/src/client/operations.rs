//! The HTTP request/response exchange bound to one channel.
//!
//! WHY: One attempt of a request is one channel: the outbound head is built
//! and gated here, the inbound head is captured here exactly once, and the
//! status decides whether the caller gets a response, a failure or (invisibly)
//! a redirect.
//!
//! WHAT: `HttpClientOperations`, the exchange handle bound into the channel's
//! operations slot, with its supporting types: the outbound request, the
//! headers-sent latch, the captured response and the exchange state.
//!
//! HOW: Outbound mutations take the request lock and check the latch under
//! it, so a mutation either lands before the head is encoded or fails with
//! `HeaderLocked`. The channel reader delivers inbound messages through
//! [`ChannelOperations`]. Body chunks go into a bounded queue whose capacity
//! is the inbound backpressure window.

use std::future::poll_fn;
use std::net::SocketAddr;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use futures_core::Stream;
use tokio::sync::mpsc;

use super::completion::CompletionSink;
use super::response::BodyFrame;
use super::{HttpClientError, HttpClientResult, RedirectHistory, Target};
use crate::channel::{Channel, ChannelError, ChannelOperations};
use crate::config::{ClientConfig, DuplicateResponsePolicy};
use crate::http::codec::{encode_chunk, encode_request_head, InboundMessage, ResponseHead, LAST_CHUNK};
use crate::http::headers::{self, names};
use crate::http::{Cookie, Cookies, HttpHeaders, HttpMethod, HttpVersion};
use crate::sync::lock;

const LATCH_OPEN: u8 = 0;
const LATCH_SENT: u8 = 1;
const LATCH_UPGRADED: u8 = 2;

/// One-way "request head dispatched" flag.
///
/// Set either by the HTTP send path or by a websocket upgrade claiming the
/// request; whichever compare-and-set lands first wins.
#[derive(Debug, Default)]
pub struct HeadersLatch(AtomicU8);

impl HeadersLatch {
    /// Sets the latch for a plain HTTP send; true only for the call that set it.
    pub fn mark_sent(&self) -> bool {
        self.claim(LATCH_SENT)
    }

    pub(crate) fn mark_upgraded(&self) -> bool {
        self.claim(LATCH_UPGRADED)
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire) != LATCH_OPEN
    }

    #[must_use]
    pub fn is_upgraded(&self) -> bool {
        self.0.load(Ordering::Acquire) == LATCH_UPGRADED
    }

    fn claim(&self, value: u8) -> bool {
        self.0
            .compare_exchange(LATCH_OPEN, value, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExchangeState {
    Idle,
    HeadersSent,
    ResponseReceived,
    BodyStreaming,
    Closed,
    Redirected,
    Failed,
    Upgraded,
}

impl ExchangeState {
    fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Redirected | Self::Failed | Self::Upgraded)
    }
}

/// The request line and headers of an attempt, plus its framing choices.
#[derive(Clone, Debug)]
pub struct OutboundRequest {
    pub method: HttpMethod,
    pub uri: String,
    pub version: HttpVersion,
    pub headers: HttpHeaders,
    pub chunked: bool,
    pub keep_alive: bool,
}

impl Default for OutboundRequest {
    fn default() -> Self {
        Self {
            method: HttpMethod::GET,
            uri: "/".into(),
            version: HttpVersion::Http11,
            headers: HttpHeaders::new(),
            chunked: true,
            keep_alive: true,
        }
    }
}

impl OutboundRequest {
    /// Writes the framing and connection headers implied by the flags.
    fn finalize_headers(&mut self) {
        if self.chunked {
            self.headers.set(names::TRANSFER_ENCODING, "chunked");
            self.headers.remove(names::CONTENT_LENGTH);
        } else {
            self.headers.remove(names::TRANSFER_ENCODING);
        }
        if self.keep_alive {
            if self.headers.contains_token(names::CONNECTION, "close") {
                self.headers.remove(names::CONNECTION);
            }
        } else {
            self.headers.set(names::CONNECTION, "close");
        }
    }
}

/// The response head of an attempt, captured exactly once.
#[derive(Debug)]
pub struct ResponseState {
    head: ResponseHead,
    cookies: OnceLock<Cookies>,
}

impl ResponseState {
    fn new(head: ResponseHead) -> Self {
        Self {
            head,
            cookies: OnceLock::new(),
        }
    }

    #[must_use]
    pub fn status(&self) -> u16 {
        self.head.status
    }

    #[must_use]
    pub fn reason(&self) -> &str {
        &self.head.reason
    }

    #[must_use]
    pub fn version(&self) -> HttpVersion {
        self.head.version
    }

    #[must_use]
    pub fn headers(&self) -> &HttpHeaders {
        &self.head.headers
    }

    /// Cookies parsed from `Set-Cookie` on first access.
    pub fn cookies(&self) -> &Cookies {
        self.cookies
            .get_or_init(|| Cookies::from_headers(&self.head.headers))
    }
}

pub struct HttpClientOperations {
    this: Weak<HttpClientOperations>,
    channel: Channel,
    config: ClientConfig,
    request: Mutex<OutboundRequest>,
    latch: HeadersLatch,
    response: OnceLock<ResponseState>,
    history: RedirectHistory,
    follow_redirects: AtomicBool,
    sink: CompletionSink<Arc<HttpClientOperations>>,
    state: Mutex<ExchangeState>,
    body_tx: Mutex<Option<mpsc::Sender<BodyFrame>>>,
    body_rx: Mutex<Option<mpsc::Receiver<BodyFrame>>>,
    discarding: AtomicBool,
    head_written: AtomicBool,
    sized_body: AtomicBool,
    chunked_body_open: AtomicBool,
    flush_each: AtomicBool,
}

impl HttpClientOperations {
    /// Creates the exchange for a freshly connected channel.
    ///
    /// The redirect history is read from the channel here, so it must be
    /// stamped before binding.
    #[must_use]
    pub fn bind(
        channel: Channel,
        config: &ClientConfig,
        sink: CompletionSink<Arc<HttpClientOperations>>,
        follow_redirects: bool,
    ) -> Arc<Self> {
        let (body_tx, body_rx) = mpsc::channel(config.inbound_buffer.max(1));
        let history = channel.redirect_history();
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            channel,
            config: config.clone(),
            request: Mutex::new(OutboundRequest::default()),
            latch: HeadersLatch::default(),
            response: OnceLock::new(),
            history,
            follow_redirects: AtomicBool::new(follow_redirects),
            sink,
            state: Mutex::new(ExchangeState::Idle),
            body_tx: Mutex::new(Some(body_tx)),
            body_rx: Mutex::new(Some(body_rx)),
            discarding: AtomicBool::new(false),
            head_written: AtomicBool::new(false),
            sized_body: AtomicBool::new(false),
            chunked_body_open: AtomicBool::new(false),
            flush_each: AtomicBool::new(false),
        })
    }

    /// Sets the request line from `target` and the default headers.
    ///
    /// # Errors
    ///
    /// `HeaderLocked` if the head was already dispatched.
    pub fn prepare_request(&self, target: &Target, method: HttpMethod) -> HttpClientResult<()> {
        if method == HttpMethod::HEAD {
            self.channel
                .with_pipeline(|pipeline| pipeline.codec_mut().expect_bodiless_response(true));
        }
        self.with_open_request(|request| {
            request.chunked = !method.disables_chunking();
            request.method = method;
            request.uri = target.request_uri();
            request.version = HttpVersion::Http11;
            request.headers.set(names::HOST, target.host_header());
            request.headers.set(names::ACCEPT, "*/*");
        })
    }

    /// Replaces any existing values of `name`.
    ///
    /// # Errors
    ///
    /// `HeaderLocked` after dispatch, `InvalidHeader` for malformed input.
    pub fn header(&self, name: &str, value: &str) -> HttpClientResult<()> {
        validate_header(name, value)?;
        self.with_open_request(|request| request.headers.set(name, value))
    }

    /// Appends a value to `name`.
    ///
    /// # Errors
    ///
    /// `HeaderLocked` after dispatch, `InvalidHeader` for malformed input.
    pub fn add_header(&self, name: &str, value: &str) -> HttpClientResult<()> {
        validate_header(name, value)?;
        self.with_open_request(|request| request.headers.add(name, value))
    }

    /// # Errors
    ///
    /// `HeaderLocked` after dispatch.
    pub fn remove_header(&self, name: &str) -> HttpClientResult<bool> {
        self.with_open_request(|request| request.headers.remove(name))
    }

    /// Adds `cookie` to the request's single `Cookie` header.
    ///
    /// # Errors
    ///
    /// `HeaderLocked` after dispatch, `InvalidCookie` when the cookie does not
    /// pass strict client encoding.
    pub fn add_cookie(&self, cookie: &Cookie) -> HttpClientResult<()> {
        if !cookie.is_valid() {
            return Err(HttpClientError::InvalidCookie(cookie.name.clone()));
        }
        let encoded = cookie.encode();
        self.with_open_request(|request| {
            let combined = match request.headers.get(names::COOKIE) {
                Some(existing) => format!("{existing}; {encoded}"),
                None => encoded,
            };
            request.headers.set(names::COOKIE, combined);
        })
    }

    /// # Errors
    ///
    /// `HeaderLocked` after dispatch.
    pub fn keep_alive(&self, keep_alive: bool) -> HttpClientResult<()> {
        self.with_open_request(|request| request.keep_alive = keep_alive)
    }

    /// # Errors
    ///
    /// `HeaderLocked` after dispatch.
    pub fn disable_chunked_transfer(&self) -> HttpClientResult<()> {
        self.with_open_request(|request| request.chunked = false)
    }

    pub fn follow_redirect(&self, follow: bool) {
        self.follow_redirects.store(follow, Ordering::Release);
    }

    /// Whether a 3xx would currently be followed.
    #[must_use]
    pub fn is_follow_redirect(&self) -> bool {
        self.follow_redirects.load(Ordering::Acquire) && self.history.can_follow()
    }

    /// Sets the headers-sent latch without writing anything.
    ///
    /// Returns true only for the call that set it. Once set, every header or
    /// cookie mutation fails with `HeaderLocked`. The head itself is still
    /// written once, by the next send or when the request handler completes.
    pub fn mark_headers_sent(&self) -> bool {
        let _request = lock(&self.request);
        self.latch.mark_sent()
    }

    #[must_use]
    pub fn has_sent_headers(&self) -> bool {
        self.latch.is_set()
    }

    /// Flushes every element of a streamed body on its own instead of once
    /// at the end of the stream.
    pub fn flush_each(&self) {
        self.flush_each.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_flush_each(&self) -> bool {
        self.flush_each.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn method(&self) -> HttpMethod {
        lock(&self.request).method.clone()
    }

    #[must_use]
    pub fn uri(&self) -> String {
        lock(&self.request).uri.clone()
    }

    #[must_use]
    pub fn version(&self) -> HttpVersion {
        lock(&self.request).version
    }

    #[must_use]
    pub fn request_headers(&self) -> HttpHeaders {
        lock(&self.request).headers.clone()
    }

    #[must_use]
    pub fn is_keep_alive(&self) -> bool {
        lock(&self.request).keep_alive
    }

    #[must_use]
    pub fn is_chunked(&self) -> bool {
        lock(&self.request).chunked
    }

    /// The URIs visited before this attempt, oldest first.
    #[must_use]
    pub fn redirected_from(&self) -> RedirectHistory {
        self.history.clone()
    }

    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.channel.is_secure()
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.channel.is_closed()
    }

    #[must_use]
    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.channel.remote_addr()
    }

    #[must_use]
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    #[must_use]
    pub fn response(&self) -> Option<&ResponseState> {
        self.response.get()
    }

    #[must_use]
    pub fn state(&self) -> ExchangeState {
        *lock(&self.state)
    }

    /// Writes the request head once. Later calls are no-ops.
    ///
    /// # Errors
    ///
    /// `HeaderLocked` when a websocket upgrade claimed the request, or the
    /// channel failure that prevented the write.
    pub async fn send_headers(&self) -> HttpClientResult<()> {
        match self.encode_head(|_| {})? {
            Some(head) => self.write(head).await,
            None => Ok(()),
        }
    }

    /// Sends `data` as the body.
    ///
    /// When this call dispatches the head, `data` is the whole body and is
    /// framed with `Content-Length`; any later `send` fails with
    /// `BodyAlreadySent`. After the head went out, `data` is written as the
    /// next chunk of a chunked body, or as-is when chunking is off.
    ///
    /// # Errors
    ///
    /// `BodyAlreadySent` after a sized body, otherwise see
    /// [`HttpClientOperations::send_headers`].
    pub async fn send(&self, data: Bytes) -> HttpClientResult<()> {
        let length = data.len();
        let mut sized = false;
        let head = self.encode_head(|request| {
            request.chunked = false;
            request.headers.set(names::CONTENT_LENGTH, length.to_string());
            self.sized_body.store(true, Ordering::Release);
            sized = true;
        })?;
        if let Some(head) = head {
            self.write(head).await?;
        }
        if !sized {
            return self.send_body_part(data, true).await;
        }
        if data.is_empty() {
            return Ok(());
        }
        self.write(data).await
    }

    /// Streams the body element by element.
    ///
    /// Elements are buffered and flushed when the stream ends, unless
    /// [`HttpClientOperations::flush_each`] was set. A chunked body is
    /// terminated when the stream ends.
    ///
    /// # Errors
    ///
    /// See [`HttpClientOperations::send_headers`].
    pub async fn send_stream<S>(&self, body: S) -> HttpClientResult<()>
    where
        S: Stream<Item = Bytes> + Send,
    {
        self.send_headers().await?;
        let flush_each = self.is_flush_each();
        let mut body = pin!(body);
        while let Some(part) = poll_fn(|cx| body.as_mut().poll_next(cx)).await {
            self.send_body_part(part, flush_each).await?;
        }
        if self.finish_chunked_body().await? {
            return Ok(());
        }
        self.channel.flush().await.map_err(HttpClientError::from_channel)
    }

    async fn send_body_part(&self, data: Bytes, flush: bool) -> HttpClientResult<()> {
        if self.latch.is_upgraded() {
            return Err(HttpClientError::HeaderLocked);
        }
        if self.sized_body.load(Ordering::Acquire) {
            return Err(HttpClientError::BodyAlreadySent);
        }
        let data = if self.chunked_body_open.load(Ordering::Acquire) {
            encode_chunk(&data)
        } else {
            data
        };
        if data.is_empty() {
            return Ok(());
        }
        if flush {
            return self.write(data).await;
        }
        self.channel
            .write(data)
            .await
            .map_err(HttpClientError::from_channel)
    }

    /// Terminates an open chunked body; true when the terminator was written.
    async fn finish_chunked_body(&self) -> HttpClientResult<bool> {
        if !self.chunked_body_open.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }
        self.write(Bytes::from_static(LAST_CHUNK)).await?;
        Ok(true)
    }

    /// Completes the outbound side once the request handler finished.
    ///
    /// Writes the head if it never went out, bare when nothing claimed the
    /// latch yet, and terminates an open chunked body. Does nothing after an
    /// upgrade claimed the request.
    pub(crate) async fn on_outbound_complete(&self) -> HttpClientResult<()> {
        if self.latch.is_upgraded() {
            return Ok(());
        }
        if !self.head_written.load(Ordering::Acquire) {
            // Fails with HeaderLocked after mark_headers_sent; the head then keeps its framing.
            let _ = self.disable_chunked_transfer();
            self.send_headers().await?;
        }
        self.finish_chunked_body().await.map(|_| ())
    }

    /// Hands over the response body queue. Only the first call succeeds.
    ///
    /// # Errors
    ///
    /// `InboundAlreadyConsumed` on later calls.
    pub(crate) fn take_body(&self) -> HttpClientResult<mpsc::Receiver<BodyFrame>> {
        lock(&self.body_rx)
            .take()
            .ok_or(HttpClientError::InboundAlreadyConsumed)
    }

    /// Claims the request for a websocket upgrade under the request lock and
    /// lets `prepare` rewrite it into the handshake request.
    pub(crate) fn claim_for_upgrade<R>(
        &self,
        prepare: impl FnOnce(&mut OutboundRequest) -> HttpClientResult<R>,
    ) -> HttpClientResult<R> {
        let mut request = lock(&self.request);
        if !self.latch.mark_upgraded() {
            return Err(HttpClientError::UpgradeTooLate);
        }
        self.transition(ExchangeState::Upgraded);
        let prepared = prepare(&mut request)?;
        tracing::debug!("Request {} {} claimed for upgrade", request.method, request.uri);
        Ok(prepared)
    }

    /// Encodes the current request head without touching the latch.
    pub(crate) fn encode_current_head(&self) -> Bytes {
        let request = lock(&self.request);
        encode_request_head(&request.method, &request.uri, request.version, &request.headers)
    }

    /// Records the handshake response of an upgrade and completes the exchange with it.
    pub(crate) fn complete_upgrade(&self, head: ResponseHead) {
        if self.response.set(ResponseState::new(head)).is_err() {
            tracing::debug!("Upgrade response arrived after a response was already recorded");
        }
        if let Some(me) = self.this.upgrade() {
            self.sink.success(me);
        }
    }

    /// Fails the exchange without closing the channel.
    pub(crate) fn fail(&self, err: HttpClientError) {
        if self.sink.error(err.clone()) {
            self.transition(ExchangeState::Failed);
        }
        if let Some(body) = lock(&self.body_tx).take() {
            let _ = body.try_send(BodyFrame::Failed(err));
        }
    }

    fn with_open_request<R>(&self, f: impl FnOnce(&mut OutboundRequest) -> R) -> HttpClientResult<R> {
        let mut request = lock(&self.request);
        if self.latch.is_set() {
            return Err(HttpClientError::HeaderLocked);
        }
        Ok(f(&mut request))
    }

    /// Encodes the head for the one caller that gets to write it.
    ///
    /// `on_claim` runs under the request lock only for the call that sets
    /// the latch, so framing decided there can never race another sender.
    fn encode_head(&self, on_claim: impl FnOnce(&mut OutboundRequest)) -> HttpClientResult<Option<Bytes>> {
        let mut request = lock(&self.request);
        if self.latch.is_upgraded() {
            return Err(HttpClientError::HeaderLocked);
        }
        if self.latch.mark_sent() {
            on_claim(&mut request);
        }
        if self.head_written.swap(true, Ordering::AcqRel) {
            return Ok(None);
        }
        request.finalize_headers();
        self.chunked_body_open.store(request.chunked, Ordering::Release);
        self.transition(ExchangeState::HeadersSent);
        tracing::debug!(
            "Sending request head {} {} (chunked: {}, keep-alive: {})",
            request.method,
            request.uri,
            request.chunked,
            request.keep_alive
        );
        Ok(Some(encode_request_head(
            &request.method,
            &request.uri,
            request.version,
            &request.headers,
        )))
    }

    async fn write(&self, data: Bytes) -> HttpClientResult<()> {
        self.channel
            .write_and_flush(data)
            .await
            .map_err(HttpClientError::from_channel)
    }

    fn transition(&self, next: ExchangeState) {
        let mut state = lock(&self.state);
        if state.is_terminal() {
            return;
        }
        tracing::trace!("Exchange on channel {}: {:?} -> {next:?}", self.channel.id(), *state);
        *state = next;
    }

    fn classify(&self, status: u16, headers: &HttpHeaders) -> HttpClientResult<()> {
        if status >= 400 {
            return Err(HttpClientError::HttpStatus(status));
        }
        if status >= 300 {
            if self.is_follow_redirect() {
                if let Some(location) = headers.get(names::LOCATION) {
                    return Err(HttpClientError::Redirect {
                        status,
                        location: location.to_string(),
                    });
                }
                tracing::warn!("Redirect status {status} without a Location header, not following");
            }
            return Err(HttpClientError::HttpStatus(status));
        }
        Ok(())
    }

    fn on_response_head(&self, head: ResponseHead) {
        let status = head.status;
        if self.response.set(ResponseState::new(head)).is_err() {
            self.on_duplicate_head(status);
            return;
        }
        let Some(response) = self.response.get() else {
            return;
        };
        tracing::debug!(
            "Received response {status} on channel {} with headers: {:?}",
            self.channel.id(),
            response.headers()
        );
        self.transition(ExchangeState::ResponseReceived);

        match self.classify(status, response.headers()) {
            Ok(()) => {
                self.transition(ExchangeState::BodyStreaming);
                if let Some(me) = self.this.upgrade() {
                    self.sink.success(me);
                }
            }
            Err(err) => {
                let next = if matches!(err, HttpClientError::Redirect { .. }) {
                    ExchangeState::Redirected
                } else {
                    ExchangeState::Failed
                };
                self.transition(next);
                self.sink.error(err);
                self.channel.close();
            }
        }
    }

    fn on_duplicate_head(&self, status: u16) {
        match self.config.duplicate_response {
            DuplicateResponsePolicy::Ignore => {
                tracing::warn!(
                    "Ignoring second response head ({status}) on channel {}",
                    self.channel.id()
                );
                self.discarding.store(true, Ordering::Release);
            }
            DuplicateResponsePolicy::Fail => {
                let err = HttpClientError::ProtocolViolation(format!(
                    "second response head ({status}) on one exchange"
                ));
                tracing::error!("{err}");
                self.fail(err);
                self.channel.close();
            }
        }
    }

    async fn on_body_content(&self, data: Bytes) {
        if self.discarding.load(Ordering::Acquire) {
            return;
        }
        let sender = lock(&self.body_tx).clone();
        if let Some(sender) = sender {
            // Suspends the channel reader while the consumer is behind.
            if sender.send(BodyFrame::Data(data)).await.is_err() {
                tracing::trace!("Response body dropped by its consumer");
            }
        }
    }

    async fn on_body_last(&self) {
        if self.discarding.swap(false, Ordering::AcqRel) {
            return;
        }
        let sender = lock(&self.body_tx).take();
        if let Some(sender) = sender {
            let _ = sender.send(BodyFrame::End).await;
        }
        tracing::debug!("Read last response content on channel {}", self.channel.id());
        self.transition(ExchangeState::Closed);
        self.channel.close();
    }
}

#[async_trait]
impl ChannelOperations for HttpClientOperations {
    fn name(&self) -> &'static str {
        "http-client"
    }

    async fn on_inbound_next(&self, message: InboundMessage) {
        match message {
            InboundMessage::Head(head) => self.on_response_head(head),
            InboundMessage::Content(data) => self.on_body_content(data).await,
            InboundMessage::Last => self.on_body_last().await,
            InboundMessage::Full(full) => {
                self.on_response_head(full.head);
                if !full.body.is_empty() {
                    self.on_body_content(full.body).await;
                }
                self.on_body_last().await;
            }
            InboundMessage::Raw(data) => tracing::debug!(
                "Dropping {} raw bytes on channel {} that was never upgraded",
                data.len(),
                self.channel.id()
            ),
        }
    }

    fn on_inbound_error(&self, error: ChannelError) {
        tracing::debug!("Exchange on channel {} failed: {error}", self.channel.id());
        self.fail(HttpClientError::from_channel(error));
        self.channel.close();
    }

    fn on_channel_closed(&self) {
        if self.sink.error(HttpClientError::ConnectionClosed) {
            tracing::debug!("Channel {} closed before a response arrived", self.channel.id());
        }
        self.transition(ExchangeState::Closed);
        // Dropping the sender without an End frame tells the body consumer the body was cut short.
        drop(lock(&self.body_tx).take());
    }
}

fn validate_header(name: &str, value: &str) -> HttpClientResult<()> {
    if !headers::is_valid_name(name) || !headers::is_valid_value(value) {
        return Err(HttpClientError::InvalidHeader(name.to_string()));
    }
    Ok(())
}

//! One-shot HTTP to websocket upgrade.
//!
//! WHY: An HTTP exchange that has not yet been written can be turned into a
//! websocket session on the same channel. The request head must go out once,
//! as either the plain request or the handshake, and the channel must have
//! exactly one owner at every point of the hand-over.
//!
//! WHAT: `upgrade` performs the transition and runs the session handler;
//! `WebsocketSession` is the handle the handler receives.
//!
//! HOW: The steps run in a fixed order. An aggregation stage goes in front
//! of the bridge so the handshake response arrives whole. The request is
//! claimed through the headers-sent latch and rewritten into the handshake.
//! The slot is swapped by compare-and-set from the HTTP exchange to
//! `HttpClientWsOperations`. Only then is the handshake written. The handler
//! runs after the handshake response was received and validated. Frame
//! encoding is left to the handler: the session moves raw bytes.

pub mod handshake;
mod operations;

pub use operations::HttpClientWsOperations;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::channel::{ChannelLease, ChannelOperations, HTTP_AGGREGATOR, REACTIVE_BRIDGE};
use crate::client::capabilities::{Inbound, Outbound};
use crate::client::operations::HttpClientOperations;
use crate::client::{BodyStream, HttpClientError, HttpClientResult, RedirectHistory, Target};
use crate::http::{HttpHeaders, HttpObjectAggregator};

/// Upgrades the not yet dispatched exchange `ops` and runs `handler` on the
/// resulting session. The channel is closed when `handler` returns.
///
/// # Errors
///
/// `NotActive` for a closed channel, `UpgradeTooLate` when the request head
/// was already sent, `UpgradeConflict` when another actor took over the
/// channel, `UpgradeFailed` when the handshake could not be written or was
/// rejected, otherwise the handler's result.
pub(crate) async fn upgrade<F, Fut>(
    ops: &Arc<HttpClientOperations>,
    protocols: &[&str],
    text_mode: bool,
    handler: F,
) -> HttpClientResult<()>
where
    F: FnOnce(WebsocketSession) -> Fut + Send,
    Fut: Future<Output = HttpClientResult<()>> + Send,
{
    let channel = ops.channel().clone();
    if channel.is_closed() {
        return Err(HttpClientError::NotActive);
    }

    let max_size = ops.config().max_aggregate_size;
    channel
        .with_pipeline(|pipeline| {
            pipeline.insert_before(REACTIVE_BRIDGE, HTTP_AGGREGATOR, Box::new(HttpObjectAggregator::new(max_size)))
        })
        .map_err(|err| HttpClientError::UpgradeFailed(err.to_string()))?;

    let key = handshake::generate_key();
    let secure = ops.is_secure();
    let claimed = ops.claim_for_upgrade(|request| {
        let target = handshake::websocket_target(request, secure)?;
        handshake::prepare_request(request, &target, &key, protocols);
        Ok(target)
    });
    let target = match claimed {
        Ok(target) => target,
        Err(err) => {
            channel.with_pipeline(|pipeline| pipeline.remove(HTTP_AGGREGATOR));
            tracing::debug!("Upgrade refused on channel {}: {err}", channel.id());
            return Err(err);
        }
    };

    let (ws_ops, handshake_done) = HttpClientWsOperations::new(ops.clone(), key, protocols, text_mode);
    let current: Arc<dyn ChannelOperations> = ops.clone();
    if !channel.slot().compare_and_set(&current, ws_ops.clone()) {
        channel.with_pipeline(|pipeline| pipeline.remove(HTTP_AGGREGATOR));
        tracing::debug!("Upgrade lost the operations swap on channel {}", channel.id());
        return Err(HttpClientError::UpgradeConflict);
    }

    tracing::debug!("Sending websocket handshake to {target} on channel {}", channel.id());
    channel
        .write_and_flush(ops.encode_current_head())
        .await
        .map_err(|err| HttpClientError::UpgradeFailed(err.to_string()))?;

    let response = handshake_done
        .await
        .map_err(|_| HttpClientError::ConnectionClosed)??;
    tracing::debug!("Websocket session on {target} opened with status {}", response.status);

    let session = WebsocketSession::new(ws_ops, target, response.headers);
    let outcome = handler(session).await;
    channel.close();
    outcome
}

/// The handle a websocket handler works with: raw inbound bytes and raw
/// outbound writes on the upgraded channel.
pub struct WebsocketSession {
    ops: Arc<HttpClientWsOperations>,
    target: Target,
    handshake_headers: HttpHeaders,
    lease: ChannelLease,
}

impl core::fmt::Debug for WebsocketSession {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WebsocketSession")
            .field("target", &self.target)
            .field("protocol", &self.ops.selected_protocol())
            .field("text_mode", &self.ops.is_text_mode())
            .finish_non_exhaustive()
    }
}

impl WebsocketSession {
    fn new(ops: Arc<HttpClientWsOperations>, target: Target, handshake_headers: HttpHeaders) -> Self {
        let lease = ChannelLease::new(ops.channel().clone());
        Self {
            ops,
            target,
            handshake_headers,
            lease,
        }
    }

    /// The `ws://` or `wss://` target the handshake was sent to.
    #[must_use]
    pub fn target(&self) -> &Target {
        &self.target
    }

    #[must_use]
    pub fn selected_protocol(&self) -> Option<&str> {
        self.ops.selected_protocol()
    }

    #[must_use]
    pub fn is_text_mode(&self) -> bool {
        self.ops.is_text_mode()
    }

    /// Headers of the `101 Switching Protocols` response.
    #[must_use]
    pub fn handshake_headers(&self) -> &HttpHeaders {
        &self.handshake_headers
    }

    #[must_use]
    pub fn redirected_from(&self) -> RedirectHistory {
        self.ops.http().redirected_from()
    }

    #[must_use]
    pub fn operations(&self) -> &Arc<HttpClientWsOperations> {
        &self.ops
    }

    /// Writes raw bytes to the peer.
    ///
    /// # Errors
    ///
    /// `ConnectionClosed` once the channel closed, or the write failure.
    pub async fn send(&self, data: impl Into<Bytes>) -> HttpClientResult<()> {
        self.ops.send(data.into()).await
    }

    /// Takes the inbound byte stream; it ends when the channel closes.
    ///
    /// # Errors
    ///
    /// `InboundAlreadyConsumed` on the second call.
    pub fn receive(&self) -> HttpClientResult<BodyStream> {
        let inbound = self.ops.take_inbound()?;
        Ok(BodyStream::new(inbound, self.lease.clone(), true))
    }

    pub fn close(&self) {
        self.lease.channel().close();
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.lease.channel().is_closed()
    }

    #[must_use]
    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.lease.channel().remote_addr()
    }

    /// Runs `on_idle` each time `idle` passes without the peer sending anything.
    pub fn on_read_idle<F>(&self, idle: Duration, on_idle: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.lease.channel().on_read_idle(idle, on_idle);
    }
}

#[async_trait]
impl Outbound for WebsocketSession {
    /// The handshake already carried the headers.
    async fn send_headers(&self) -> HttpClientResult<()> {
        Ok(())
    }

    async fn send(&self, data: Bytes) -> HttpClientResult<()> {
        WebsocketSession::send(self, data).await
    }
}

impl Inbound for WebsocketSession {
    fn receive(&self) -> HttpClientResult<BodyStream> {
        WebsocketSession::receive(self)
    }

    fn is_disposed(&self) -> bool {
        WebsocketSession::is_disposed(self)
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        WebsocketSession::remote_address(self)
    }

    fn on_read_idle(&self, idle: Duration, on_idle: Box<dyn FnMut() + Send>) {
        WebsocketSession::on_read_idle(self, idle, on_idle);
    }
}

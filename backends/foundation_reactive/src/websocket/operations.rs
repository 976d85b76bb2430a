use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use super::handshake;
use crate::channel::{Channel, ChannelError, ChannelOperations, HTTP_AGGREGATOR};
use crate::client::operations::HttpClientOperations;
use crate::client::response::BodyFrame;
use crate::client::{HttpClientError, HttpClientResult};
use crate::http::codec::{InboundMessage, ResponseHead};
use crate::sync::lock;

pub(crate) type HandshakeReceiver = oneshot::Receiver<HttpClientResult<ResponseHead>>;

/// Channel operations of an upgraded connection.
///
/// Bound into the slot in place of the HTTP exchange before the handshake
/// request is written, so the handshake response is delivered here. Once the
/// handshake is validated the HTTP exchange is completed with it and every
/// later inbound byte goes to the session.
pub struct HttpClientWsOperations {
    http: Arc<HttpClientOperations>,
    key: String,
    protocols: Vec<String>,
    text_mode: bool,
    handshake: Mutex<Option<oneshot::Sender<HttpClientResult<ResponseHead>>>>,
    selected_protocol: OnceLock<Option<String>>,
    inbound_tx: Mutex<Option<mpsc::Sender<BodyFrame>>>,
    inbound_rx: Mutex<Option<mpsc::Receiver<BodyFrame>>>,
}

impl HttpClientWsOperations {
    pub(crate) fn new(
        http: Arc<HttpClientOperations>,
        key: String,
        protocols: &[&str],
        text_mode: bool,
    ) -> (Arc<Self>, HandshakeReceiver) {
        let (handshake_tx, handshake_rx) = oneshot::channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(http.config().inbound_buffer.max(1));
        let operations = Arc::new(Self {
            http,
            key,
            protocols: protocols.iter().map(ToString::to_string).collect(),
            text_mode,
            handshake: Mutex::new(Some(handshake_tx)),
            selected_protocol: OnceLock::new(),
            inbound_tx: Mutex::new(Some(inbound_tx)),
            inbound_rx: Mutex::new(Some(inbound_rx)),
        });
        (operations, handshake_rx)
    }

    #[must_use]
    pub fn channel(&self) -> &Channel {
        self.http.channel()
    }

    /// The HTTP exchange this session was upgraded from.
    #[must_use]
    pub fn http(&self) -> &Arc<HttpClientOperations> {
        &self.http
    }

    #[must_use]
    pub fn is_text_mode(&self) -> bool {
        self.text_mode
    }

    /// Sub-protocol the server selected, if any. None before the handshake.
    #[must_use]
    pub fn selected_protocol(&self) -> Option<&str> {
        self.selected_protocol.get().and_then(Option::as_deref)
    }

    /// Writes raw bytes to the upgraded connection.
    ///
    /// # Errors
    ///
    /// `ConnectionClosed` once the channel closed, or the write failure.
    pub async fn send(&self, data: Bytes) -> HttpClientResult<()> {
        self.channel()
            .write_and_flush(data)
            .await
            .map_err(HttpClientError::from_channel)
    }

    pub(crate) fn take_inbound(&self) -> HttpClientResult<mpsc::Receiver<BodyFrame>> {
        lock(&self.inbound_rx)
            .take()
            .ok_or(HttpClientError::InboundAlreadyConsumed)
    }

    fn resolve_handshake(&self, outcome: HttpClientResult<ResponseHead>) -> bool {
        match lock(&self.handshake).take() {
            Some(waiter) => {
                let _ = waiter.send(outcome);
                true
            }
            None => false,
        }
    }

    fn on_handshake_response(&self, head: ResponseHead) {
        if lock(&self.handshake).is_none() {
            tracing::warn!(
                "Dropping unexpected response ({}) on upgraded channel {}",
                head.status,
                self.channel().id()
            );
            return;
        }

        match handshake::validate_response(&self.key, &self.protocols, &head) {
            Ok(selected) => {
                let _ = self.selected_protocol.set(selected);
                self.channel().with_pipeline(|pipeline| pipeline.remove(HTTP_AGGREGATOR));
                tracing::info!(
                    "Websocket handshake complete on channel {} (protocol: {:?})",
                    self.channel().id(),
                    self.selected_protocol()
                );
                self.http.complete_upgrade(head.clone());
                self.resolve_handshake(Ok(head));
            }
            Err(err) => {
                tracing::warn!("Websocket handshake on channel {} failed: {err}", self.channel().id());
                self.resolve_handshake(Err(err.clone()));
                self.http.fail(err);
                self.channel().close();
            }
        }
    }

    async fn on_raw(&self, data: Bytes) {
        let sender = lock(&self.inbound_tx).clone();
        if let Some(sender) = sender {
            if sender.send(BodyFrame::Data(data)).await.is_err() {
                tracing::trace!("Websocket inbound dropped by its consumer");
            }
        }
    }
}

#[async_trait]
impl ChannelOperations for HttpClientWsOperations {
    fn name(&self) -> &'static str {
        "ws-client"
    }

    async fn on_inbound_next(&self, message: InboundMessage) {
        match message {
            InboundMessage::Full(full) => {
                self.on_handshake_response(full.head);
                if !full.body.is_empty() {
                    self.on_raw(full.body).await;
                }
            }
            InboundMessage::Head(head) => self.on_handshake_response(head),
            InboundMessage::Raw(data) | InboundMessage::Content(data) => self.on_raw(data).await,
            InboundMessage::Last => {}
        }
    }

    fn on_inbound_error(&self, error: ChannelError) {
        let err = HttpClientError::from_channel(error);
        tracing::debug!("Websocket channel {} failed: {err}", self.channel().id());
        if !self.resolve_handshake(Err(err.clone())) {
            if let Some(inbound) = lock(&self.inbound_tx).take() {
                let _ = inbound.try_send(BodyFrame::Failed(err.clone()));
            }
        }
        self.http.fail(err);
        self.channel().close();
    }

    fn on_channel_closed(&self) {
        self.resolve_handshake(Err(HttpClientError::ConnectionClosed));
        drop(lock(&self.inbound_tx).take());
        self.http.on_channel_closed();
    }
}

//! Inbound and outbound capabilities.
//!
//! WHY: The request handle, the response handle and a websocket session all
//! either send bytes, receive bytes or both. Convenience behavior is written
//! once against these two small traits instead of per handle.
//!
//! WHAT: `Outbound`, `Inbound`, their blanket extensions and the websocket
//! upgrade shortcuts.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use super::{BodyStream, ClientRequest, ClientResponse, HttpClientResult, MultipartStream};
use crate::websocket::WebsocketSession;

#[async_trait]
pub trait Outbound: Send + Sync {
    async fn send_headers(&self) -> HttpClientResult<()>;

    async fn send(&self, data: Bytes) -> HttpClientResult<()>;
}

pub trait Inbound: Send + Sync {
    /// Takes the inbound byte stream; only the first call succeeds.
    ///
    /// # Errors
    ///
    /// `InboundAlreadyConsumed` on later calls.
    fn receive(&self) -> HttpClientResult<BodyStream>;

    fn is_disposed(&self) -> bool;

    fn remote_address(&self) -> Option<SocketAddr>;

    /// Runs `on_idle` each time `idle` passes without anything read.
    fn on_read_idle(&self, idle: Duration, on_idle: Box<dyn FnMut() + Send>);
}

#[async_trait]
pub trait OutboundExt: Outbound {
    async fn send_string(&self, text: &str) -> HttpClientResult<()> {
        self.send(Bytes::copy_from_slice(text.as_bytes())).await
    }
}

#[async_trait]
impl<T: Outbound + ?Sized> OutboundExt for T {}

#[async_trait]
pub trait InboundExt: Inbound {
    async fn aggregate_bytes(&self) -> HttpClientResult<Bytes> {
        self.receive()?.aggregate().await
    }

    async fn aggregate_text(&self) -> HttpClientResult<String> {
        let body = self.aggregate_bytes().await?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    /// Splits the inbound bytes into multipart entities delimited by `boundary`.
    ///
    /// # Errors
    ///
    /// See [`Inbound::receive`].
    fn receive_multipart_with(&self, boundary: &str) -> HttpClientResult<MultipartStream> {
        Ok(MultipartStream::new(self.receive()?, boundary))
    }
}

#[async_trait]
impl<T: Inbound + ?Sized> InboundExt for T {}

#[async_trait]
impl Outbound for ClientRequest {
    async fn send_headers(&self) -> HttpClientResult<()> {
        ClientRequest::send_headers(self).await
    }

    async fn send(&self, data: Bytes) -> HttpClientResult<()> {
        ClientRequest::send(self, data).await
    }
}

impl Inbound for ClientResponse {
    fn receive(&self) -> HttpClientResult<BodyStream> {
        ClientResponse::receive(self)
    }

    fn is_disposed(&self) -> bool {
        ClientResponse::is_disposed(self)
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        ClientResponse::remote_address(self)
    }

    fn on_read_idle(&self, idle: Duration, on_idle: Box<dyn FnMut() + Send>) {
        ClientResponse::on_read_idle(self, idle, on_idle);
    }
}

/// Upgrades with no sub-protocols in binary mode.
///
/// # Errors
///
/// See [`ClientRequest::upgrade_to_websocket`].
pub async fn upgrade_to_websocket_default<F, Fut>(request: &ClientRequest, handler: F) -> HttpClientResult<()>
where
    F: FnOnce(WebsocketSession) -> Fut + Send,
    Fut: Future<Output = HttpClientResult<()>> + Send,
{
    request.upgrade_to_websocket(&[], false, handler).await
}

/// Upgrades with no sub-protocols in text mode.
///
/// # Errors
///
/// See [`ClientRequest::upgrade_to_websocket`].
pub async fn upgrade_to_text_websocket<F, Fut>(request: &ClientRequest, handler: F) -> HttpClientResult<()>
where
    F: FnOnce(WebsocketSession) -> Fut + Send,
    Fut: Future<Output = HttpClientResult<()>> + Send,
{
    request.upgrade_to_websocket(&[], true, handler).await
}

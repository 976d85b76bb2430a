//! Connection establishment.
//!
//! WHY: The engine only needs "give me an established channel to this
//! target"; how the socket is dialled, secured or faked in tests is a
//! separate concern.
//!
//! WHAT: The `Connector` seam and `TcpConnector` for real sockets, with a
//! pluggable `TlsWrapper` for secure targets.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use super::Channel;
use crate::client::{HttpClientError, Target};
use crate::config::ClientConfig;

/// Any bidirectional byte stream a channel can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedStream = Box<dyn AsyncStream>;

#[async_trait]
pub trait Connector: Send + Sync {
    /// Establishes one new channel to `target`. The channel is not started.
    ///
    /// # Errors
    ///
    /// Resolution, connect and security failures all surface as
    /// `HttpClientError::ConnectFailure`.
    async fn connect(&self, target: &Target, config: &ClientConfig) -> Result<Channel, HttpClientError>;
}

#[async_trait]
impl<C: Connector + ?Sized> Connector for Arc<C> {
    async fn connect(&self, target: &Target, config: &ClientConfig) -> Result<Channel, HttpClientError> {
        (**self).connect(target, config).await
    }
}

/// Secures an established TCP stream for `https`/`wss` targets.
#[async_trait]
pub trait TlsWrapper: Send + Sync {
    /// # Errors
    ///
    /// Returns the handshake failure.
    async fn wrap(&self, server_name: &str, stream: TcpStream) -> std::io::Result<BoxedStream>;
}

#[derive(Clone, Default)]
pub struct TcpConnector {
    tls: Option<Arc<dyn TlsWrapper>>,
}

impl TcpConnector {
    /// Plain TCP, plus rustls with the webpki roots when built with `ssl-rustls`.
    #[must_use]
    pub fn new() -> Self {
        #[cfg(feature = "ssl-rustls")]
        {
            Self::default().with_tls(Arc::new(super::tls::RustlsWrapper::with_webpki_roots()))
        }
        #[cfg(not(feature = "ssl-rustls"))]
        {
            Self::default()
        }
    }

    /// Dials without TLS support; secure targets fail to connect.
    #[must_use]
    pub fn plain() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_tls(mut self, tls: Arc<dyn TlsWrapper>) -> Self {
        self.tls = Some(tls);
        self
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, target: &Target, config: &ClientConfig) -> Result<Channel, HttpClientError> {
        let host = target.host().to_string();
        let port = target.port();

        let connecting = TcpStream::connect((host.as_str(), port));
        let stream = match config.connect_timeout() {
            Some(limit) => tokio::time::timeout(limit, connecting)
                .await
                .map_err(|_| {
                    HttpClientError::ConnectFailure(format!(
                        "connecting to {host}:{port} timed out after {limit:?}"
                    ))
                })?,
            None => connecting.await,
        }
        .map_err(|err| HttpClientError::ConnectFailure(format!("{host}:{port}: {err}")))?;

        if let Err(err) = stream.set_nodelay(true) {
            tracing::debug!("Unable to disable Nagle on {host}:{port}: {err}");
        }
        let remote_addr = stream.peer_addr().ok();
        tracing::info!("Connected to {host}:{port} ({remote_addr:?})");

        if !target.is_secure() {
            return Ok(Channel::new(stream, remote_addr, false, config));
        }

        let Some(tls) = &self.tls else {
            return Err(HttpClientError::ConnectFailure(format!(
                "{target} requires TLS but no TLS wrapper is configured"
            )));
        };
        let secured = tls
            .wrap(&host, stream)
            .await
            .map_err(|err| HttpClientError::ConnectFailure(format!("TLS handshake with {host}: {err}")))?;
        Ok(Channel::new(secured, remote_addr, true, config))
    }
}

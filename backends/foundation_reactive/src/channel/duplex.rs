//! In-memory connections for tests.
//!
//! `DuplexConnector` answers every connection from a callback handed the
//! server half of a `tokio::io::duplex` pair. Built for the crate's own tests
//! and, with the `testing` feature, for downstream test suites.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::DuplexStream;

use super::{Channel, Connector};
use crate::client::{HttpClientError, Target};
use crate::config::ClientConfig;
use crate::sync::lock;

/// Server side of an in-memory connection: connection index, target, stream.
pub type DuplexServer = Arc<dyn Fn(usize, &Target, DuplexStream) + Send + Sync>;

/// Connector whose "network" is a callback handed the server half of a
/// `tokio::io::duplex` pair. Every established channel is recorded.
pub struct DuplexConnector {
    server: DuplexServer,
    buffer_size: usize,
    connections: AtomicUsize,
    channels: Mutex<Vec<Channel>>,
    refuse: Mutex<Vec<String>>,
}

impl DuplexConnector {
    pub fn new<F>(server: F) -> Self
    where
        F: Fn(usize, &Target, DuplexStream) + Send + Sync + 'static,
    {
        Self {
            server: Arc::new(server),
            buffer_size: 16 * 1024,
            connections: AtomicUsize::new(0),
            channels: Mutex::new(Vec::new()),
            refuse: Mutex::new(Vec::new()),
        }
    }

    /// Size of each in-memory pipe; small sizes make writers feel backpressure.
    #[must_use]
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    /// Connections to `host` fail as if nothing listened there.
    #[must_use]
    pub fn refuse_host(self, host: impl Into<String>) -> Self {
        lock(&self.refuse).push(host.into());
        self
    }

    /// Number of connections established so far.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn channels(&self) -> Vec<Channel> {
        lock(&self.channels).clone()
    }
}

#[async_trait]
impl Connector for DuplexConnector {
    async fn connect(&self, target: &Target, config: &ClientConfig) -> Result<Channel, HttpClientError> {
        if lock(&self.refuse).iter().any(|host| host == target.host()) {
            return Err(HttpClientError::ConnectFailure(format!(
                "connection to {}:{} refused",
                target.host(),
                target.port()
            )));
        }

        let index = self.connections.fetch_add(1, Ordering::SeqCst);
        let (client, server) = tokio::io::duplex(self.buffer_size);
        (self.server)(index, target, server);

        let channel = Channel::new(client, None, target.is_secure(), config);
        lock(&self.channels).push(channel.clone());
        Ok(channel)
    }
}

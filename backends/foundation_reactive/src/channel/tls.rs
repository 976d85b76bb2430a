//! rustls backed `TlsWrapper`, behind the `ssl-rustls` feature.

use std::sync::Arc;

use async_trait::async_trait;
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use super::transport::{BoxedStream, TlsWrapper};

#[derive(Clone)]
pub struct RustlsWrapper(Arc<rustls::ClientConfig>);

impl RustlsWrapper {
    #[must_use]
    pub fn new(config: Arc<rustls::ClientConfig>) -> Self {
        Self(config)
    }

    /// Trusts the Mozilla root certificates shipped with `webpki-roots`.
    #[must_use]
    pub fn with_webpki_roots() -> Self {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Self(Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        ))
    }
}

#[async_trait]
impl TlsWrapper for RustlsWrapper {
    async fn wrap(&self, server_name: &str, stream: TcpStream) -> std::io::Result<BoxedStream> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err))?;
        let secured = TlsConnector::from(self.0.clone()).connect(name, stream).await?;
        tracing::debug!("TLS session established with {server_name}");
        Ok(Box::new(secured))
    }
}

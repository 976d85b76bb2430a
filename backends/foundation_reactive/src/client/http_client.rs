//! The caller facing client.
//!
//! WHY: Callers want "GET this URL" and a single awaited outcome, not the
//! machinery of channels, exchanges and redirect bridges.
//!
//! WHAT: `HttpClient` builds lazy `ResponseMono` requests; awaiting one runs
//! the redirect bridge over the connection driver and yields either one
//! response or one typed failure. `HttpClient::ws` performs a websocket
//! upgrade and runs a session handler.

use std::future::{Future, IntoFuture};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::oneshot;

use super::driver::{BoxFuture, ConnectionDriver, RequestHandler, RequestOptions};
use super::redirects::RedirectBridge;
use super::{ClientRequest, ClientResponse, HttpClientError, HttpClientResult, Target};
use crate::channel::{Connector, TcpConnector};
use crate::config::ClientConfig;
use crate::http::{HttpHeaders, HttpMethod};
use crate::sync::lock;
use crate::websocket::WebsocketSession;

#[derive(Clone)]
pub struct HttpClient {
    connector: Arc<dyn Connector>,
    config: Arc<ClientConfig>,
}

impl core::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HttpClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient {
    /// A client dialling plain TCP with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(ClientConfig::default())
    }

    #[must_use]
    pub fn with_config(config: ClientConfig) -> Self {
        Self::with_connector(TcpConnector::new(), config)
    }

    #[must_use]
    pub fn with_connector(connector: impl Connector + 'static, config: ClientConfig) -> Self {
        Self {
            connector: Arc::new(connector),
            config: Arc::new(config),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    #[must_use]
    pub fn get(&self, url: impl Into<String>) -> ResponseMono {
        self.request(HttpMethod::GET, url)
    }

    #[must_use]
    pub fn head(&self, url: impl Into<String>) -> ResponseMono {
        self.request(HttpMethod::HEAD, url)
    }

    #[must_use]
    pub fn post(&self, url: impl Into<String>) -> ResponseMono {
        self.request(HttpMethod::POST, url)
    }

    #[must_use]
    pub fn put(&self, url: impl Into<String>) -> ResponseMono {
        self.request(HttpMethod::PUT, url)
    }

    #[must_use]
    pub fn delete(&self, url: impl Into<String>) -> ResponseMono {
        self.request(HttpMethod::DELETE, url)
    }

    /// A lazy request: nothing is dialled until the returned value is awaited.
    #[must_use]
    pub fn request(&self, method: HttpMethod, url: impl Into<String>) -> ResponseMono {
        ResponseMono {
            driver: ConnectionDriver::new(self.connector.clone(), self.config.clone()),
            method,
            url: url.into(),
            handler: None,
            follow_redirects: self.config.follow_redirects,
            headers: HttpHeaders::new(),
        }
    }

    /// Opens a websocket to `url` and runs `handler` on the session.
    ///
    /// Resolves with the handler's result once it finished; the connection
    /// is closed then.
    ///
    /// # Errors
    ///
    /// Connect and upgrade failures, or whatever `handler` returns.
    pub async fn ws<F, Fut>(&self, url: impl Into<String>, protocols: &[&str], handler: F) -> HttpClientResult<()>
    where
        F: FnOnce(WebsocketSession) -> Fut + Send + 'static,
        Fut: Future<Output = HttpClientResult<()>> + Send + 'static,
    {
        let session_handler = Arc::new(Mutex::new(Some(handler)));
        let (done_tx, done_rx) = oneshot::channel();
        let done_tx = Arc::new(Mutex::new(Some(done_tx)));
        let protocols: Vec<String> = protocols.iter().map(ToString::to_string).collect();

        let response = self
            .get(url)
            .handler(move |request: ClientRequest| {
                let handler = lock(&session_handler).take();
                let done = lock(&done_tx).take();
                let protocols = protocols.clone();
                async move {
                    let Some(handler) = handler else {
                        return Err(HttpClientError::HandlerFailed(
                            "websocket handler already ran".into(),
                        ));
                    };
                    let offered: Vec<&str> = protocols.iter().map(String::as_str).collect();
                    let outcome = request.upgrade_to_websocket(&offered, false, handler).await;
                    if let Some(done) = done {
                        let _ = done.send(outcome.clone());
                    }
                    outcome
                }
            })
            .await?;

        // The response holds the channel open while the session runs.
        let outcome = done_rx.await.unwrap_or(Err(HttpClientError::ConnectionClosed));
        drop(response);
        outcome
    }
}

/// A request that has not been sent yet. Await it to perform the exchange.
pub struct ResponseMono {
    driver: ConnectionDriver,
    method: HttpMethod,
    url: String,
    handler: Option<RequestHandler>,
    follow_redirects: bool,
    headers: HttpHeaders,
}

impl ResponseMono {
    /// Customizes and sends the request; runs once per attempt, so once per redirect hop.
    #[must_use]
    pub fn handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(ClientRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HttpClientResult<()>> + Send + 'static,
    {
        self.handler = Some(Arc::new(move |request: ClientRequest| -> BoxFuture<HttpClientResult<()>> {
            Box::pin(handler(request))
        }));
        self
    }

    /// Sends `body` as the whole request body, framed with `Content-Length`.
    #[must_use]
    pub fn body(self, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        self.handler(move |request: ClientRequest| {
            let body = body.clone();
            async move { request.send(body).await }
        })
    }

    #[must_use]
    pub fn follow_redirects(mut self) -> Self {
        self.follow_redirects = true;
        self
    }

    /// Adds a header to every attempt's request.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.add(name, value);
        self
    }
}

impl IntoFuture for ResponseMono {
    type Output = HttpClientResult<ClientResponse>;
    type IntoFuture = BoxFuture<Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move {
            let target = Target::parse(&self.url)?;
            tracing::debug!("{} {target}", self.method);
            let options = RequestOptions {
                follow_redirects: self.follow_redirects,
                headers: self.headers,
            };
            RedirectBridge::new(target)
                .execute(&self.driver, &self.method, &options, self.handler.as_ref())
                .await
        })
    }
}

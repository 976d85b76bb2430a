//! Connection acquisition: one connection, one exchange, one outcome.
//!
//! WHY: Every attempt of a request, including every redirect hop, needs a
//! freshly established channel with a fresh exchange bound into it, and the
//! caller must see exactly one terminal outcome for it.
//!
//! WHAT: `ConnectionDriver::acquire` dials, lets a `ChannelInitializer` stamp
//! the channel, binds `HttpClientOperations`, runs the per-attempt request
//! handler and resolves with the exchange's completion.
//!
//! HOW: The channel is held by a `ChannelLease` for the whole attempt, so
//! dropping the `acquire` future (cancellation) or failing the attempt
//! closes the channel. The handler runs as its own task; its failure or
//! panic completes the exchange with an error, its success completes the
//! outbound side. Until the attempt resolves, the handler task is aborted
//! together with the `acquire` future.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::task::AbortHandle;

use super::completion::completion;
use super::operations::HttpClientOperations;
use super::{ClientRequest, ClientResponse, HttpClientError, HttpClientResult, Target};
use crate::channel::{Channel, ChannelLease, Connector};
use crate::config::ClientConfig;
use crate::http::{HttpHeaders, HttpMethod};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Per-attempt request handler: customizes and sends the request.
///
/// Invoked once per attempt, so once per redirect hop.
pub type RequestHandler = Arc<dyn Fn(ClientRequest) -> BoxFuture<HttpClientResult<()>> + Send + Sync>;

/// Runs on a newly connected channel before any exchange is bound to it.
pub trait ChannelInitializer: Send + Sync {
    fn on_channel_init(&self, channel: &Channel);
}

/// Per-request settings applied to every attempt.
#[derive(Clone, Debug, Default)]
pub struct RequestOptions {
    pub follow_redirects: bool,
    pub headers: HttpHeaders,
}

/// Aborts the request handler task when dropped, unless disarmed.
struct HandlerGuard(Option<AbortHandle>);

impl HandlerGuard {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for HandlerGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }
}

#[derive(Clone)]
pub struct ConnectionDriver {
    connector: Arc<dyn Connector>,
    config: Arc<ClientConfig>,
}

impl ConnectionDriver {
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>, config: Arc<ClientConfig>) -> Self {
        Self { connector, config }
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Performs one attempt against `target`.
    ///
    /// Without a handler the request head is sent bare, with chunking off.
    ///
    /// # Errors
    ///
    /// `ConnectFailure` when the channel cannot be established, the
    /// exchange's failure (including `Redirect`), or the handler's error.
    pub async fn acquire(
        &self,
        target: &Target,
        method: &HttpMethod,
        options: &RequestOptions,
        handler: Option<&RequestHandler>,
        init: Option<&dyn ChannelInitializer>,
    ) -> HttpClientResult<ClientResponse> {
        let channel = self.connector.connect(target, &self.config).await?;
        if let Some(init) = init {
            init.on_channel_init(&channel);
        }
        let lease = ChannelLease::new(channel.clone());

        let (sink, mut completion) = completion();
        let ops = HttpClientOperations::bind(channel.clone(), &self.config, sink, options.follow_redirects);
        channel.slot().set(ops.clone());

        ops.prepare_request(target, method.clone())?;
        for (name, value) in options.headers.iter() {
            ops.add_header(name, value)?;
        }
        channel.start();
        tracing::debug!("Acquired channel {} for {method} {target}", channel.id());

        let Some(handler) = handler else {
            // Write failures are reported through the completion, which also hears about the close.
            if let Err(err) = ops.disable_chunked_transfer() {
                ops.fail(err);
            } else if let Err(err) = ops.send_headers().await {
                ops.fail(err);
            }
            let ops = completion.await?;
            return Ok(ClientResponse::new(ops, lease));
        };

        let mut running = tokio::spawn(handler(ClientRequest::new(ops.clone())));
        let guard = HandlerGuard(Some(running.abort_handle()));
        let outcome = tokio::select! {
            outcome = &mut completion => outcome,
            joined = &mut running => {
                match joined {
                    Ok(Ok(())) => {
                        if let Err(err) = ops.on_outbound_complete().await {
                            ops.fail(err);
                        }
                    }
                    Ok(Err(err)) => ops.fail(err),
                    Err(join) => ops.fail(HttpClientError::HandlerFailed(join.to_string())),
                }
                completion.await
            }
        };

        match outcome {
            Ok(ops) => {
                guard.disarm();
                if !running.is_finished() {
                    lease.attach(tokio::spawn(async move {
                        if let Ok(Err(err)) = running.await {
                            tracing::debug!("Request handler finished after the response with: {err}");
                        }
                    }));
                }
                Ok(ClientResponse::new(ops, lease))
            }
            Err(err) => {
                drop(guard);
                Err(err)
            }
        }
    }
}

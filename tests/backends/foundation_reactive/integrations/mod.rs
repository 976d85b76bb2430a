//! Whole requests through `HttpClient`.
//!
//! Most scenarios run over `DuplexConnector`, with every connection answered
//! by a scripted server that serves exactly one request. `tcp_tests` runs
//! against the threaded `TestHttpServer` on a real socket.

mod redirect_tests;
mod request_tests;
mod tcp_tests;
mod websocket_tests;

use std::sync::{Arc, Mutex};

use foundation_reactive::channel::DuplexConnector;
use foundation_reactive::{ClientConfig, HttpClient};
use foundation_testing::duplex;
use foundation_testing::http::{HttpRequest, HttpResponse};
use tokio::io::AsyncReadExt;

/// A duplex "network" whose every connection serves one scripted response.
pub(crate) struct ScriptedServer {
    pub connector: Arc<DuplexConnector>,
    pub requests: Arc<Mutex<Vec<HttpRequest>>>,
}

impl ScriptedServer {
    /// `respond` gets the connection index and the request it must answer.
    pub fn new<F>(respond: F) -> Self
    where
        F: Fn(usize, &HttpRequest) -> HttpResponse + Send + Sync + 'static,
    {
        let respond = Arc::new(respond);
        let requests: Arc<Mutex<Vec<HttpRequest>>> = Arc::default();
        let seen = requests.clone();

        let connector = DuplexConnector::new(move |index, _target, mut stream| {
            let respond = respond.clone();
            let seen = seen.clone();
            tokio::spawn(async move {
                match duplex::read_request(&mut stream).await {
                    Ok(Some(request)) => {
                        let response = respond(index, &request);
                        seen.lock().expect("requests lock").push(request);
                        if let Err(err) = duplex::write_response(&mut stream, &response).await {
                            tracing::debug!("Connection {index} went away before the response: {err}");
                        }
                    }
                    Ok(None) => tracing::debug!("Connection {index} closed before sending a request"),
                    Err(err) => tracing::debug!("Connection {index} failed: {err}"),
                }
                // Hold the connection until the client lets go of it.
                let mut rest = [0u8; 256];
                while matches!(stream.read(&mut rest).await, Ok(read) if read > 0) {}
            });
        });

        Self {
            connector: Arc::new(connector),
            requests,
        }
    }

    pub fn client(&self, config: ClientConfig) -> HttpClient {
        HttpClient::with_connector(self.connector.clone(), config)
    }

    pub fn connection_count(&self) -> usize {
        self.connector.connection_count()
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

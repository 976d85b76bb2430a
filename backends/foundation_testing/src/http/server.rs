//! Test HTTP server implementation.
//!
//! WHY: Provides a real HTTP server for integration tests without external dependencies.
//! Built on stdlib TCP with hand-crafted HTTP responses for simplicity.
//!
//! WHAT: `TestHttpServer` that listens on localhost, accepts requests, and sends responses.
//! A `101 Switching Protocols` response turns the connection into a raw echo.
//!
//! HOW: Uses stdlib's `TcpListener` and threading with manually crafted HTTP/1.1 responses.
//! One request is served per connection.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use sha1::{Digest, Sha1};

type ResponseHandler = Arc<Mutex<Box<dyn Fn(&HttpRequest) -> HttpResponse + Send>>>;

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Simple HTTP request representation for testing.
#[derive(Debug, Clone, Default)]
pub struct HttpRequest {
    /// HTTP method (GET, POST, etc.)
    pub method: String,
    /// Request target as sent on the request line (e.g., "/test?x=1")
    pub path: String,
    /// HTTP version (e.g., "HTTP/1.1")
    pub proto: String,
    /// Request headers in arrival order
    pub headers: Vec<(String, String)>,
    /// Body of the request, de-chunked
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// First value of `name`, compared case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Parses the request line and headers of `head` (everything before the blank line).
    #[must_use]
    pub fn parse_head(head: &str) -> Option<Self> {
        let mut lines = head.split("\r\n");
        let mut intro = lines.next()?.split(' ');
        let method = intro.next()?.to_string();
        let path = intro.next()?.to_string();
        let proto = intro.next()?.to_string();

        let headers = lines
            .filter(|line| !line.is_empty())
            .filter_map(|line| {
                let (key, value) = line.split_once(':')?;
                Some((key.trim().to_string(), value.trim().to_string()))
            })
            .collect();

        Some(Self {
            method,
            path,
            proto,
            headers,
            body: Vec::new(),
        })
    }

    /// True when the request asks for a chunked body.
    #[must_use]
    pub fn is_chunked(&self) -> bool {
        self.header("transfer-encoding")
            .is_some_and(|value| value.eq_ignore_ascii_case("chunked"))
    }

    /// Declared body length, if any.
    #[must_use]
    pub fn content_length(&self) -> Option<usize> {
        self.header("content-length")
            .and_then(|value| value.trim().parse().ok())
    }
}

/// Simple HTTP response representation for testing.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// Status code (e.g., 200)
    pub status: u16,
    /// Status text (e.g., "OK")
    pub status_text: String,
    /// Response headers
    pub headers: Vec<(String, String)>,
    /// Response body
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Create 200 OK response with body.
    #[must_use]
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        let body_bytes = body.into();
        Self {
            status: 200,
            status_text: "OK".to_string(),
            headers: vec![
                ("Content-Type".to_string(), "text/plain".to_string()),
                ("Content-Length".to_string(), body_bytes.len().to_string()),
            ],
            body: body_bytes,
        }
    }

    /// Create 302 redirect response.
    #[must_use]
    pub fn redirect(location: &str) -> Self {
        Self::redirect_with(302, location)
    }

    /// Create a redirect response with a specific 3xx status.
    #[must_use]
    pub fn redirect_with(code: u16, location: &str) -> Self {
        Self {
            status: code,
            status_text: "Redirect".to_string(),
            headers: vec![
                ("Location".to_string(), location.to_string()),
                ("Content-Length".to_string(), "0".to_string()),
            ],
            body: Vec::new(),
        }
    }

    /// Create custom status response.
    #[must_use]
    pub fn status(code: u16, text: &str) -> Self {
        Self {
            status: code,
            status_text: text.to_string(),
            headers: vec![("Content-Length".to_string(), "0".to_string())],
            body: Vec::new(),
        }
    }

    /// Create the `101 Switching Protocols` answer to a websocket handshake.
    ///
    /// Returns a 400 when the request carries no `Sec-WebSocket-Key`.
    #[must_use]
    pub fn switching_protocols(request: &HttpRequest) -> Self {
        let Some(key) = request.header("sec-websocket-key") else {
            return Self::status(400, "Bad Request");
        };
        let mut response = Self {
            status: 101,
            status_text: "Switching Protocols".to_string(),
            headers: vec![
                ("Upgrade".to_string(), "websocket".to_string()),
                ("Connection".to_string(), "Upgrade".to_string()),
                ("Sec-WebSocket-Accept".to_string(), websocket_accept(key)),
            ],
            body: Vec::new(),
        };
        if let Some(protocols) = request.header("sec-websocket-protocol") {
            if let Some(first) = protocols.split(',').next() {
                response
                    .headers
                    .push(("Sec-WebSocket-Protocol".to_string(), first.trim().to_string()));
            }
        }
        response
    }

    /// Adds a header to the response.
    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Render response to HTTP/1.1 format.
    #[must_use]
    pub fn render(&self) -> Vec<u8> {
        let mut response = format!("HTTP/1.1 {} {}\r\n", self.status, self.status_text);

        for (key, value) in &self.headers {
            response.push_str(&format!("{key}: {value}\r\n"));
        }

        response.push_str("\r\n");

        let mut bytes = response.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }
}

/// The `Sec-WebSocket-Accept` value for `key`.
#[must_use]
pub fn websocket_accept(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Test HTTP server for integration testing.
///
/// # Purpose (WHY)
///
/// Provides a real HTTP server for testing HTTP clients without external dependencies.
/// Uses stdlib TCP with manually crafted HTTP responses for simplicity.
///
/// # What it does
///
/// Starts a local HTTP server on a random port, accepts incoming requests, and responds
/// with configurable responses. Runs in background thread to not block test execution.
///
/// # Examples
///
/// ```rust
/// use foundation_testing::http::TestHttpServer;
///
/// let server = TestHttpServer::start();
///
/// assert!(server.url("/test").starts_with("http://127.0.0.1:"));
///
/// // Server automatically stops when dropped
/// ```
pub struct TestHttpServer {
    addr: String,
    _handle: Option<thread::JoinHandle<()>>,
    running: Arc<AtomicBool>,
    connections: Arc<AtomicUsize>,
    _handler: ResponseHandler,
}

impl TestHttpServer {
    /// Start a new test HTTP server on random port.
    ///
    /// # Returns
    ///
    /// A running `TestHttpServer` that will respond with 200 OK to all requests.
    ///
    /// # Panics
    ///
    /// When no local port can be bound.
    #[must_use]
    pub fn start() -> Self {
        Self::with_response(|_req| HttpResponse::ok(b"OK"))
    }

    /// Start server with custom response handler.
    ///
    /// # Purpose (WHY)
    ///
    /// Allows tests to customize server behavior for specific scenarios
    /// (redirects, errors, custom headers, websocket handshakes, etc.)
    ///
    /// # Examples
    ///
    /// ```rust
    /// use foundation_testing::http::{TestHttpServer, HttpResponse};
    ///
    /// let server = TestHttpServer::with_response(|req| {
    ///     if req.path == "/redirect" {
    ///         HttpResponse::redirect("/target")
    ///     } else {
    ///         HttpResponse::ok(b"Success")
    ///     }
    /// });
    /// ```
    ///
    /// # Panics
    ///
    /// When no local port can be bound.
    #[must_use]
    pub fn with_response<F>(handler: F) -> Self
    where
        F: Fn(&HttpRequest) -> HttpResponse + Send + 'static,
    {
        let listener =
            TcpListener::bind("127.0.0.1:0").expect("Failed to bind test HTTP server to localhost");
        let addr = format!(
            "http://{}",
            listener.local_addr().expect("bound listener has an address")
        );

        let running = Arc::new(AtomicBool::new(true));
        let connections = Arc::new(AtomicUsize::new(0));
        let handler = Arc::new(Mutex::new(
            Box::new(handler) as Box<dyn Fn(&HttpRequest) -> HttpResponse + Send>
        ));

        let running_clone = Arc::clone(&running);
        let connections_clone = Arc::clone(&connections);
        let handler_clone = Arc::clone(&handler);

        let handle = thread::spawn(move || {
            // Set non-blocking so we can check running flag
            listener
                .set_nonblocking(true)
                .expect("Failed to set non-blocking");

            while running_clone.load(Ordering::Relaxed) {
                match listener.accept() {
                    Ok((stream, sock_addr)) => {
                        tracing::info!("Got a client connection: {sock_addr:?}");
                        connections_clone.fetch_add(1, Ordering::SeqCst);
                        let handler = Arc::clone(&handler_clone);
                        // Handle each connection in separate thread
                        thread::spawn(move || {
                            if let Err(e) = Self::handle_connection(stream, &handler) {
                                tracing::info!("TestHttpServer connection error: {e}");
                            }
                        });
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        // No connection available, sleep briefly and check again
                        thread::sleep(std::time::Duration::from_millis(10));
                    }
                    Err(e) => {
                        tracing::info!("TestHttpServer accept error: {e}");
                        break;
                    }
                }
            }
        });

        Self {
            addr,
            _handle: Some(handle),
            running,
            connections,
            _handler: handler,
        }
    }

    /// Get full URL for a path on this test server.
    ///
    /// Full URL string (e.g., "<http://127.0.0.1:54321/test>")
    #[must_use]
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    /// Get base URL of this test server (e.g., "<http://127.0.0.1:54321>").
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.addr
    }

    /// Number of connections accepted so far.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Handle a single HTTP connection.
    ///
    /// WHY: Processes incoming HTTP request and sends response.
    fn handle_connection(
        stream: TcpStream,
        handler: &ResponseHandler,
    ) -> Result<(), Box<dyn std::error::Error>> {
        stream.set_nonblocking(false)?;
        let mut writer = stream.try_clone()?;
        let mut reader = BufReader::new(stream);

        let Some(request) = read_request(&mut reader)? else {
            tracing::debug!("Connection closed before a request arrived");
            return Ok(());
        };

        tracing::info!(
            "Received new http request: method: {:?}, path: {:?}, proto: {:?}",
            request.method,
            request.path,
            request.proto,
        );

        // Call user's handler to get response
        let response = {
            let handler_guard = handler
                .lock()
                .map_err(|_| "response handler poisoned")?;
            handler_guard(&request)
        };

        writer.write_all(&response.render())?;
        writer.flush()?;
        tracing::info!("flush response {}", response.status);

        if response.status == 101 {
            // Upgraded: echo raw bytes until the client goes away.
            let mut buf = [0u8; 1024];
            loop {
                let read = reader.read(&mut buf)?;
                if read == 0 {
                    break;
                }
                writer.write_all(&buf[..read])?;
                writer.flush()?;
            }
        }

        Ok(())
    }
}

/// Reads one request, body included, from `reader`.
///
/// Returns None when the peer closed before sending a request line.
///
/// # Errors
///
/// Read failures and malformed framing.
pub fn read_request<R: BufRead>(reader: &mut R) -> std::io::Result<Option<HttpRequest>> {
    let mut head = String::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        if line == "\r\n" || line == "\n" {
            break;
        }
        head.push_str(line.trim_end_matches(['\r', '\n']));
        head.push_str("\r\n");
    }

    let Some(mut request) = HttpRequest::parse_head(&head) else {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("malformed request head: {head:?}"),
        ));
    };

    if request.is_chunked() {
        request.body = read_chunked_body(reader)?;
    } else if let Some(length) = request.content_length() {
        let mut body = vec![0u8; length];
        reader.read_exact(&mut body)?;
        request.body = body;
    }
    Ok(Some(request))
}

fn read_chunked_body<R: BufRead>(reader: &mut R) -> std::io::Result<Vec<u8>> {
    let mut body = Vec::new();
    loop {
        let mut size_line = String::new();
        reader.read_line(&mut size_line)?;
        let size_text = size_line.trim().split(';').next().unwrap_or_default();
        let size = usize::from_str_radix(size_text, 16).map_err(|err| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("bad chunk size {size_text:?}: {err}"),
            )
        })?;

        if size == 0 {
            // Trailers end with an empty line.
            loop {
                let mut trailer = String::new();
                if reader.read_line(&mut trailer)? == 0 || trailer.trim().is_empty() {
                    return Ok(body);
                }
            }
        }

        let mut chunk = vec![0u8; size + 2];
        reader.read_exact(&mut chunk)?;
        chunk.truncate(size);
        body.extend_from_slice(&chunk);
    }
}

impl Drop for TestHttpServer {
    fn drop(&mut self) {
        // Signal server thread to stop
        self.running.store(false, Ordering::Relaxed);
        // Thread will exit on next loop iteration
    }
}

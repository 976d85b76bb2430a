//! Single-connection exchanges.
//!
//! WHY: Everything a request can end in, success, status failure, connect
//! failure or cancellation, must reach the caller exactly once and must
//! leave no connection behind.
//!
//! WHAT: Request framing as the server sees it, response decoding, status
//! classification, cancellation and the headers-sent latch under contention.

use std::future::IntoFuture;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use foundation_reactive::channel::DuplexConnector;
use foundation_reactive::http::Cookie;
use foundation_reactive::retries::{retry_when, SameBackoffDecider};
use foundation_reactive::{ClientConfig, ClientRequest, HttpClient, HttpClientError};
use foundation_testing::duplex;
use foundation_testing::http::HttpResponse;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::oneshot;
use tracing_test::traced_test;

use super::ScriptedServer;

#[tokio::test]
#[traced_test]
async fn get_returns_status_headers_and_body() {
    let server = ScriptedServer::new(|_, _| {
        HttpResponse::ok(b"hello".to_vec())
            .with_header("X-Served-By", "script")
            .with_header("Set-Cookie", "session=abc; Path=/; HttpOnly")
    });

    let response = server
        .client(ClientConfig::default())
        .get("http://host/greeting?lang=en")
        .await
        .expect("should succeed");

    assert_eq!(response.status(), 200);
    assert_eq!(response.header("x-served-by").as_deref(), Some("script"));
    let cookies = response.cookies();
    let session = cookies.get("session").expect("cookie is parsed");
    assert_eq!(session[0].value, "abc");
    assert!(session[0].http_only);
    assert!(response.redirected_from().is_empty());
    assert_eq!(response.aggregate_string().await.expect("body"), "hello");

    let request = &server.requests()[0];
    assert_eq!(request.method, "GET");
    assert_eq!(request.path, "/greeting?lang=en");
    assert_eq!(request.header("host"), Some("host"));
    assert!(!request.is_chunked());
}

/// WHY: Error statuses are failures, not responses
/// WHAT: A 404 fails with HttpStatus(404) after exactly one connection
#[tokio::test]
async fn error_statuses_fail_the_request() {
    let server = ScriptedServer::new(|_, _| HttpResponse::status(404, "Not Found"));

    let result = server.client(ClientConfig::default()).get("http://host/missing").await;

    assert_eq!(result.err(), Some(HttpClientError::HttpStatus(404)));
    assert_eq!(server.connection_count(), 1);
    assert!(server.connector.channels()[0].is_closed());
}

#[tokio::test]
async fn post_bodies_are_framed_with_content_length() {
    let server = ScriptedServer::new(|_, request| HttpResponse::ok(request.body.clone()));

    let response = server
        .client(ClientConfig::default())
        .post("http://host/echo")
        .header("Content-Type", "text/plain")
        .body("payload")
        .await
        .expect("should succeed");

    assert_eq!(response.aggregate_string().await.expect("body"), "payload");
    let request = &server.requests()[0];
    assert_eq!(request.method, "POST");
    assert_eq!(request.content_length(), Some(7));
    assert_eq!(request.header("content-type"), Some("text/plain"));
    assert!(!request.is_chunked());
}

#[tokio::test]
async fn chunked_responses_are_decoded() {
    let server = ScriptedServer::new(|_, _| HttpResponse {
        status: 200,
        status_text: "OK".to_string(),
        headers: vec![("Transfer-Encoding".to_string(), "chunked".to_string())],
        body: b"3\r\nabc\r\n4\r\ndefg\r\n0\r\n\r\n".to_vec(),
    });

    let response = server
        .client(ClientConfig::default())
        .get("http://host/stream")
        .await
        .expect("should succeed");

    assert_eq!(response.aggregate_string().await.expect("body"), "abcdefg");
}

/// WHY: A HEAD response advertises a length it never sends
/// WHAT: The body of a HEAD response is empty even with a Content-Length
#[tokio::test]
async fn head_responses_have_no_body() {
    let server = ScriptedServer::new(|_, _| HttpResponse {
        status: 200,
        status_text: "OK".to_string(),
        headers: vec![("Content-Length".to_string(), "5".to_string())],
        body: Vec::new(),
    });

    let response = server
        .client(ClientConfig::default())
        .head("http://host/file")
        .await
        .expect("should succeed");

    assert_eq!(response.header("content-length").as_deref(), Some("5"));
    assert!(response.aggregate().await.expect("body").is_empty());
}

#[tokio::test]
async fn the_body_can_only_be_taken_once() {
    let server = ScriptedServer::new(|_, _| HttpResponse::ok(b"once".to_vec()));

    let response = server
        .client(ClientConfig::default())
        .get("http://host/")
        .await
        .expect("should succeed");

    let body = response.receive().expect("first take");
    assert!(matches!(response.receive(), Err(HttpClientError::InboundAlreadyConsumed)));
    assert_eq!(&body.aggregate().await.expect("body")[..], b"once");
}

/// WHY: Dropping an in-flight request must release its connection
/// WHAT: A request cancelled while waiting for the response closes its channel
#[tokio::test]
#[traced_test]
async fn cancelling_a_request_closes_the_channel() {
    let connector = Arc::new(DuplexConnector::new(|_, _, mut stream| {
        tokio::spawn(async move {
            // Read the request and never answer.
            let _ = duplex::read_request(&mut stream).await;
            let mut rest = [0u8; 64];
            while matches!(stream.read(&mut rest).await, Ok(read) if read > 0) {}
        });
    }));
    let client = HttpClient::with_connector(connector.clone(), ClientConfig::default());

    let outcome = tokio::time::timeout(
        Duration::from_millis(100),
        client.get("http://host/slow").into_future(),
    )
    .await;

    assert!(outcome.is_err(), "the server never answers");
    let channels = connector.channels();
    assert_eq!(channels.len(), 1);
    assert!(channels[0].is_closed());
}

/// WHY: A cancelled request must not keep running the caller's code
/// WHAT: Dropping the request mid-handler aborts the handler before it finishes
#[tokio::test]
async fn cancelling_a_request_aborts_its_handler() {
    let connector = Arc::new(DuplexConnector::new(|_, _, mut stream| {
        tokio::spawn(async move {
            let mut rest = [0u8; 64];
            while matches!(stream.read(&mut rest).await, Ok(read) if read > 0) {}
        });
    }));
    let client = HttpClient::with_connector(connector.clone(), ClientConfig::default());
    let finished = Arc::new(AtomicBool::new(false));
    let flag = finished.clone();

    let outcome = tokio::time::timeout(
        Duration::from_millis(30),
        client
            .get("http://host/slow")
            .handler(move |_request: ClientRequest| {
                let flag = flag.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(150)).await;
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                }
            })
            .into_future(),
    )
    .await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(outcome.is_err(), "the handler outlives the timeout");
    assert!(!finished.load(Ordering::SeqCst));
    assert!(connector.channels()[0].is_closed());
}

#[tokio::test]
async fn dropping_the_response_closes_the_channel() {
    let server = ScriptedServer::new(|_, _| HttpResponse::ok(b"unread".to_vec()));

    let response = server
        .client(ClientConfig::default())
        .get("http://host/")
        .await
        .expect("should succeed");
    drop(response);

    assert!(server.connector.channels()[0].is_closed());
}

/// WHY: Two writers racing for the head must produce exactly one head
/// WHAT: Concurrent send_headers both succeed, one request reaches the
/// server and later header edits fail with HeaderLocked
#[tokio::test]
async fn racing_head_writers_send_one_head() {
    let server = ScriptedServer::new(|_, _| HttpResponse::ok(b"ok".to_vec()));

    let response = server
        .client(ClientConfig::default())
        .get("http://host/race")
        .handler(|request: ClientRequest| async move {
            let racer = request.clone();
            let (first, second) = tokio::join!(request.send_headers(), racer.send_headers());
            first?;
            second?;
            assert!(request.has_sent_headers());
            assert_eq!(
                request.header("X-Too-Late", "1").err(),
                Some(HttpClientError::HeaderLocked)
            );
            assert_eq!(
                request.add_cookie(&Cookie::new("late", "1")).err(),
                Some(HttpClientError::HeaderLocked)
            );
            Ok(())
        })
        .await
        .expect("should succeed");

    assert_eq!(response.status(), 200);
    assert_eq!(server.requests().len(), 1);
    assert!(server.requests()[0].header("x-too-late").is_none());
}

#[tokio::test]
async fn handler_failures_fail_the_request() {
    let server = ScriptedServer::new(|_, _| HttpResponse::ok(b"ok".to_vec()));

    let result = server
        .client(ClientConfig::default())
        .get("http://host/")
        .handler(|_request: ClientRequest| async move {
            Err(HttpClientError::HandlerFailed("refused to send".into()))
        })
        .await;

    assert_eq!(
        result.err(),
        Some(HttpClientError::HandlerFailed("refused to send".into()))
    );
    assert!(server.connector.channels()[0].is_closed());
}

#[tokio::test]
async fn cookies_are_sent_in_one_header() {
    let server = ScriptedServer::new(|_, _| HttpResponse::ok(b"ok".to_vec()));

    server
        .client(ClientConfig::default())
        .get("http://host/")
        .handler(|request: ClientRequest| async move {
            request.add_cookie(&Cookie::new("a", "1"))?;
            request.add_cookie(&Cookie::new("b", "2"))?;
            request.send_headers().await
        })
        .await
        .expect("should succeed");

    assert_eq!(server.requests()[0].header("cookie"), Some("a=1; b=2"));
}

#[tokio::test]
async fn refused_connections_fail_without_retrying() {
    let connector = DuplexConnector::new(|_, _, _| {}).refuse_host("down.test");
    let client = HttpClient::with_connector(connector, ClientConfig::default().follow_redirects(true));

    let result = client.get("http://down.test/").await;

    assert!(matches!(result, Err(HttpClientError::ConnectFailure(_))));
}

/// WHY: Connect failures are retryable by callers with the same deciders
/// redirects ride on
/// WHAT: retry_when re-dials a refused host once per allowed retry
#[tokio::test]
async fn connect_failures_can_be_retried_by_the_caller() {
    let connector = DuplexConnector::new(|_, _, _| {}).refuse_host("down.test");
    let client = HttpClient::with_connector(connector, ClientConfig::default());
    let attempts = AtomicU32::new(0);

    let result = retry_when(
        &SameBackoffDecider::new(Duration::from_millis(1)),
        2,
        |_state| {
            attempts.fetch_add(1, Ordering::SeqCst);
            client.get("http://down.test/").into_future()
        },
        |err: HttpClientError| match err {
            HttpClientError::ConnectFailure(_) => Ok(err),
            other => Err(other),
        },
    )
    .await;

    assert!(matches!(result, Err(HttpClientError::ConnectFailure(_))));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn malformed_urls_fail_before_connecting() {
    let server = ScriptedServer::new(|_, _| HttpResponse::ok(b"ok".to_vec()));

    let result = server.client(ClientConfig::default()).get("not a url").await;

    assert!(matches!(result, Err(HttpClientError::InvalidUrl(_))));
    assert_eq!(server.connection_count(), 0);
}

/// Reads one request with a `Content-Length` body as raw bytes, answers 200,
/// then reports everything the client wrote until it closed.
fn raw_capture() -> (DuplexConnector, oneshot::Receiver<Vec<u8>>) {
    let (wire_tx, wire_rx) = oneshot::channel();
    let wire_tx = Arc::new(Mutex::new(Some(wire_tx)));
    let connector = DuplexConnector::new(move |_, _, mut stream| {
        let wire_tx = wire_tx.clone();
        tokio::spawn(async move {
            let mut wire = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                let head_end = wire.windows(4).position(|window| window == b"\r\n\r\n");
                let complete = head_end.is_some_and(|end| {
                    let head = String::from_utf8_lossy(&wire[..end]).to_ascii_lowercase();
                    let length = head
                        .lines()
                        .find_map(|line| line.strip_prefix("content-length:"))
                        .and_then(|value| value.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    wire.len() >= end + 4 + length
                });
                if complete {
                    break;
                }
                match stream.read(&mut buf).await {
                    Ok(read) if read > 0 => wire.extend_from_slice(&buf[..read]),
                    _ => return,
                }
            }
            if duplex::write_response(&mut stream, &HttpResponse::ok(b"ok".to_vec()))
                .await
                .is_err()
            {
                return;
            }
            let _ = stream.read_to_end(&mut wire).await;
            if let Some(tx) = wire_tx.lock().expect("wire lock").take() {
                let _ = tx.send(wire);
            }
        });
    });
    (connector, wire_rx)
}

/// WHY: A body sent whole is framed by its Content-Length; any byte after it
/// would be read as the start of another message
/// WHAT: A second send fails with BodyAlreadySent and nothing follows the body on the wire
#[tokio::test]
async fn a_whole_body_cannot_be_extended() {
    let (connector, wire) = raw_capture();
    let client = HttpClient::with_connector(connector, ClientConfig::default());
    let (second_tx, second_rx) = oneshot::channel();
    let second_tx = Arc::new(Mutex::new(Some(second_tx)));

    let response = client
        .post("http://host/up")
        .handler(move |request: ClientRequest| {
            let second_tx = second_tx.lock().expect("second lock").take();
            async move {
                request.send("abc").await?;
                let second = request.send("EXTRA").await;
                if let Some(tx) = second_tx {
                    let _ = tx.send(second);
                }
                Ok(())
            }
        })
        .await
        .expect("should succeed");

    assert_eq!(
        second_rx.await.expect("handler reports"),
        Err(HttpClientError::BodyAlreadySent)
    );
    assert_eq!(response.status(), 200);
    drop(response);

    let wire = String::from_utf8(wire.await.expect("server reports")).expect("ascii wire");
    assert!(wire.starts_with("POST /up HTTP/1.1\r\n"));
    assert!(wire.contains("Content-Length: 3\r\n"));
    assert!(wire.ends_with("\r\n\r\nabc"), "unexpected wire: {wire:?}");
}

/// WHY: Taking the latch must never strand the exchange with nothing on the wire
/// WHAT: After mark_headers_sent the head still goes out once the handler returns
#[tokio::test]
async fn a_marked_latch_still_dispatches_the_head() {
    let server = ScriptedServer::new(|_, _| HttpResponse::ok(b"ok".to_vec()));

    let response = tokio::time::timeout(
        Duration::from_secs(5),
        server
            .client(ClientConfig::default())
            .get("http://host/marked")
            .handler(|request: ClientRequest| async move {
                assert!(request.operations().mark_headers_sent());
                assert_eq!(
                    request.header("X-Late", "1").err(),
                    Some(HttpClientError::HeaderLocked)
                );
                Ok(())
            })
            .into_future(),
    )
    .await
    .expect("the head is dispatched")
    .expect("should succeed");

    assert_eq!(response.status(), 200);
    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].path, "/marked");
    assert!(requests[0].header("x-late").is_none());
    assert!(!requests[0].is_chunked());
}

#[tokio::test]
async fn multipart_responses_are_split_into_parts() {
    let server = ScriptedServer::new(|_, _| {
        HttpResponse::ok(
            b"--edge\r\nContent-Disposition: form-data; name=\"greeting\"\r\n\r\nhello\r\n--edge\r\nContent-Type: application/json\r\n\r\n{\"n\":1}\r\n--edge--\r\n"
                .to_vec(),
        )
        .with_header("Content-Type", "multipart/mixed; boundary=edge")
    });

    let response = server
        .client(ClientConfig::default())
        .get("http://host/parts")
        .await
        .expect("should succeed");
    let parts = response
        .receive_multipart()
        .expect("multipart content type")
        .collect_parts()
        .await
        .expect("well formed parts");

    assert_eq!(parts.len(), 2);
    assert_eq!(parts[0].name(), Some("greeting"));
    assert_eq!(&parts[0].body[..], b"hello");
    assert_eq!(parts[1].headers.get("content-type"), Some("application/json"));
    assert_eq!(&parts[1].body[..], b"{\"n\":1}");
}

#[tokio::test]
async fn plain_bodies_have_no_multipart_view() {
    let server = ScriptedServer::new(|_, _| HttpResponse::ok(b"plain".to_vec()));

    let response = server
        .client(ClientConfig::default())
        .get("http://host/")
        .await
        .expect("should succeed");

    assert!(matches!(
        response.receive_multipart(),
        Err(HttpClientError::InvalidMultipart(_))
    ));
    assert_eq!(response.aggregate_string().await.expect("body still readable"), "plain");
}

/// WHY: A stalled server must be noticeable without giving up on the body
/// WHAT: on_read_idle fires while the body stalls and the body still completes afterwards
#[tokio::test]
async fn stalled_bodies_trigger_the_read_idle_handler() {
    let (release_tx, release_rx) = oneshot::channel::<()>();
    let release_rx = Arc::new(Mutex::new(Some(release_rx)));
    let connector = DuplexConnector::new(move |_, _, mut stream| {
        let release = release_rx.lock().expect("release lock").take();
        tokio::spawn(async move {
            if !matches!(duplex::read_request(&mut stream).await, Ok(Some(_))) {
                return;
            }
            let _ = stream
                .write_all(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nfirst\r\n")
                .await;
            if let Some(release) = release {
                let _ = release.await;
            }
            let _ = stream.write_all(b"4\r\nlast\r\n0\r\n\r\n").await;
            let mut rest = [0u8; 64];
            while matches!(stream.read(&mut rest).await, Ok(read) if read > 0) {}
        });
    });
    let client = HttpClient::with_connector(connector, ClientConfig::default());
    let idle_events = Arc::new(AtomicU32::new(0));
    let counted = idle_events.clone();

    let response = client.get("http://host/stall").await.expect("should succeed");
    response.on_read_idle(Duration::from_millis(40), move || {
        counted.fetch_add(1, Ordering::SeqCst);
    });
    let mut body = response.receive().expect("first take");
    let first = body.next_chunk().await.expect("first chunk").expect("readable");
    assert_eq!(&first[..], b"first");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(idle_events.load(Ordering::SeqCst) >= 1);

    release_tx.send(()).expect("server waits for release");
    let last = body.next_chunk().await.expect("last chunk").expect("readable");
    assert_eq!(&last[..], b"last");
    assert!(body.next_chunk().await.is_none());
}

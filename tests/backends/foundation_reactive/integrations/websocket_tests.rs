//! Websocket upgrades through the client.
//!
//! WHY: An upgrade hands a live connection from the HTTP exchange to a
//! session; the session handler must run exactly once and only after the
//! server agreed to switch.
//!
//! WHAT: `HttpClient::ws` end to end, handshake rejection, and the
//! headers-sent latch deciding between an upgrade and a plain send.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use foundation_reactive::channel::DuplexConnector;
use foundation_reactive::client::{upgrade_to_text_websocket, OutboundExt};
use foundation_reactive::{ClientConfig, ClientRequest, HttpClient, HttpClientError};
use foundation_testing::duplex;
use foundation_testing::http::{HttpRequest, HttpResponse};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::oneshot;
use tracing_test::traced_test;

/// What the websocket peer saw: the handshake request and the bytes echoed back.
type PeerReport = (HttpRequest, Vec<u8>);

/// A peer that answers the handshake with `respond`, then writes `greeting`
/// and reports what the client sent back.
fn websocket_peer<F>(respond: F, greeting: &'static [u8]) -> (DuplexConnector, oneshot::Receiver<PeerReport>)
where
    F: Fn(&HttpRequest) -> HttpResponse + Send + Sync + 'static,
{
    let respond = Arc::new(respond);
    let (report_tx, report_rx) = oneshot::channel();
    let report = Arc::new(Mutex::new(Some(report_tx)));

    let connector = DuplexConnector::new(move |_, _, mut stream| {
        let respond = respond.clone();
        let report = report.clone();
        tokio::spawn(async move {
            let Ok(Some(request)) = duplex::read_request(&mut stream).await else {
                return;
            };
            let response = respond(&request);
            let switching = response.status == 101;
            if duplex::write_response(&mut stream, &response).await.is_err() {
                return;
            }

            let mut received = Vec::new();
            if switching {
                if stream.write_all(greeting).await.is_err() {
                    return;
                }
                let mut buf = [0u8; 256];
                while let Ok(read) = stream.read(&mut buf).await {
                    if read == 0 {
                        break;
                    }
                    received.extend_from_slice(&buf[..read]);
                }
            }
            if let Some(tx) = report.lock().expect("report lock").take() {
                let _ = tx.send((request, received));
            }
        });
    });
    (connector, report_rx)
}

/// WHY: The session handler is the whole point of `ws`
/// WHAT: It runs once, after the 101, sees the negotiated protocol and can
/// exchange raw bytes with the peer
#[tokio::test]
#[traced_test]
async fn ws_runs_the_handler_after_the_handshake() {
    let (connector, report) = websocket_peer(HttpResponse::switching_protocols, b"hello");
    let client = HttpClient::with_connector(connector, ClientConfig::default());
    let invocations = Arc::new(AtomicUsize::new(0));
    let counted = invocations.clone();

    let outcome = client
        .ws("ws://host/chat", &["chat.v1", "chat.v2"], move |session| async move {
            counted.fetch_add(1, Ordering::SeqCst);
            assert_eq!(session.target().as_str(), "ws://host/chat");
            assert_eq!(session.selected_protocol(), Some("chat.v1"));
            assert_eq!(session.handshake_headers().get("upgrade"), Some("websocket"));
            assert!(!session.is_text_mode());

            let mut inbound = session.receive()?;
            let greeting = inbound.next_chunk().await.expect("peer greets first")?;
            assert_eq!(&greeting[..], b"hello");
            session.send_string("pong").await
        })
        .await;

    assert_eq!(outcome, Ok(()));
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    let (request, echoed) = report.await.expect("peer reports");
    assert_eq!(request.method, "GET");
    assert_eq!(request.path, "/chat");
    assert_eq!(request.header("upgrade"), Some("websocket"));
    assert_eq!(request.header("sec-websocket-version"), Some("13"));
    assert_eq!(request.header("sec-websocket-protocol"), Some("chat.v1, chat.v2"));
    assert_eq!(request.header("host"), Some("host"));
    assert_eq!(echoed, b"pong");
}

/// WHY: A refused upgrade must never reach the session handler
/// WHAT: A 403 answer fails `ws` with UpgradeFailed and the handler never runs
#[tokio::test]
async fn rejected_handshakes_never_run_the_handler() {
    let (connector, _report) = websocket_peer(|_| HttpResponse::status(403, "Forbidden"), b"");
    let client = HttpClient::with_connector(connector, ClientConfig::default());
    let invocations = Arc::new(AtomicUsize::new(0));
    let counted = invocations.clone();

    let outcome = client
        .ws("ws://host/chat", &[], move |_session| async move {
            counted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;

    assert!(matches!(outcome, Err(HttpClientError::UpgradeFailed(_))));
    assert_eq!(invocations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn handler_errors_are_the_ws_outcome() {
    let (connector, _report) = websocket_peer(HttpResponse::switching_protocols, b"");
    let client = HttpClient::with_connector(connector, ClientConfig::default());

    let outcome = client
        .ws("ws://host/chat", &[], |_session| async move {
            Err(HttpClientError::HandlerFailed("session gave up".into()))
        })
        .await;

    assert_eq!(outcome, Err(HttpClientError::HandlerFailed("session gave up".into())));
}

/// WHY: Once the upgrade owns the request, nothing else may write an HTTP head
/// WHAT: Inside the session, send_headers and send on the original request
/// fail with HeaderLocked
#[tokio::test]
async fn the_upgrade_locks_the_http_request() {
    let (connector, report) = websocket_peer(HttpResponse::switching_protocols, b"ready");
    let client = HttpClient::with_connector(connector, ClientConfig::default());
    let (done_tx, done_rx) = oneshot::channel();
    let done = Arc::new(Mutex::new(Some(done_tx)));

    let response = client
        .get("http://host/chat")
        .handler(move |request: ClientRequest| {
            let done = done.lock().expect("done lock").take();
            async move {
                let racer = request.clone();
                let outcome = upgrade_to_text_websocket(&request, move |session| async move {
                    assert!(session.is_text_mode());
                    assert_eq!(racer.send_headers().await, Err(HttpClientError::HeaderLocked));
                    assert_eq!(racer.send("late").await, Err(HttpClientError::HeaderLocked));
                    assert_eq!(
                        racer.header("X-Late", "1").err(),
                        Some(HttpClientError::HeaderLocked)
                    );
                    let mut inbound = session.receive()?;
                    let greeting = inbound.next_chunk().await.expect("peer greets first")?;
                    assert_eq!(&greeting[..], b"ready");
                    Ok(())
                })
                .await;
                if let Some(done) = done {
                    let _ = done.send(outcome.clone());
                }
                outcome
            }
        })
        .await
        .expect("handshake completes the exchange");

    assert_eq!(response.status(), 101);
    assert_eq!(done_rx.await.expect("session finished"), Ok(()));

    let (request, echoed) = report.await.expect("peer reports");
    assert_eq!(request.header("sec-websocket-version"), Some("13"));
    assert!(echoed.is_empty());
}

/// WHY: Sending first claims the latch, so a later upgrade must back off
/// WHAT: The upgrade fails with UpgradeTooLate and the plain exchange completes
#[tokio::test]
async fn upgrading_after_sending_is_too_late() {
    let (connector, report) = websocket_peer(|_| HttpResponse::ok(b"plain".to_vec()), b"");
    let client = HttpClient::with_connector(connector, ClientConfig::default());
    let (outcome_tx, outcome_rx) = oneshot::channel();
    let outcome_tx = Arc::new(Mutex::new(Some(outcome_tx)));

    let response = client
        .get("http://host/chat")
        .handler(move |request: ClientRequest| {
            let outcome_tx = outcome_tx.lock().expect("outcome lock").take();
            async move {
                request.send_headers().await?;
                let outcome = request
                    .upgrade_to_websocket(&[], false, |_session| async { Ok(()) })
                    .await;
                if let Some(tx) = outcome_tx {
                    let _ = tx.send(outcome);
                }
                Ok(())
            }
        })
        .await
        .expect("the plain exchange still succeeds");

    assert_eq!(outcome_rx.await.expect("handler reports"), Err(HttpClientError::UpgradeTooLate));
    assert_eq!(response.status(), 200);
    assert_eq!(response.aggregate_string().await.expect("body"), "plain");

    let (request, _) = report.await.expect("peer reports");
    assert!(request.header("upgrade").is_none());
    assert!(request.header("sec-websocket-key").is_none());
}

//! The exchange state machine driven directly over an in-memory channel.
//!
//! WHY: The client handles hide the exchange; these tests pin its terminal
//! outcomes and latch behavior without the driver in between.
//!
//! WHAT: One `HttpClientOperations` bound to a started duplex channel, with
//! the test playing the server.

use std::sync::Arc;

use foundation_reactive::channel::Channel;
use foundation_reactive::client::{completion, Completion, ExchangeState, HeadersLatch, HttpClientOperations};
use foundation_reactive::http::HttpMethod;
use foundation_reactive::{ClientConfig, HttpClientError, RedirectHistory, Target};
use foundation_testing::duplex;
use foundation_testing::http::HttpResponse;
use tokio::io::{AsyncWriteExt, DuplexStream};

fn exchange(
    config: &ClientConfig,
    follow: bool,
    history: Option<RedirectHistory>,
) -> (Arc<HttpClientOperations>, Completion<Arc<HttpClientOperations>>, DuplexStream) {
    let (client, server) = tokio::io::duplex(4096);
    let channel = Channel::new(client, None, false, config);
    if let Some(history) = history {
        channel.stamp_redirect_history(history);
    }
    let (sink, completion) = completion();
    let ops = HttpClientOperations::bind(channel.clone(), config, sink, follow);
    channel.slot().set(ops.clone());
    ops.prepare_request(&Target::parse("http://host.test/a").expect("valid"), HttpMethod::GET)
        .expect("prepare");
    channel.start();
    (ops, completion, server)
}

/// WHY: Only one party may ever dispatch the head
/// WHAT: Of many concurrent claims exactly one succeeds
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn the_latch_admits_exactly_one_claim() {
    let latch = Arc::new(HeadersLatch::default());

    let claims: Vec<_> = (0..16)
        .map(|_| {
            let latch = latch.clone();
            tokio::spawn(async move { latch.mark_sent() })
        })
        .collect();
    let mut won = 0;
    for claim in claims {
        if claim.await.expect("claim task") {
            won += 1;
        }
    }

    assert_eq!(won, 1);
    assert!(latch.is_set());
    assert!(!latch.is_upgraded());
}

#[tokio::test]
async fn a_2xx_head_completes_with_the_exchange() {
    let (ops, completion, mut server) = exchange(&ClientConfig::default(), false, None);

    let served = tokio::spawn(async move {
        duplex::serve_one(&mut server, |_| HttpResponse::ok(b"ok".to_vec()))
            .await
            .expect("serve");
        server
    });
    ops.send_headers().await.expect("should send");

    let completed = completion.await.expect("should succeed");
    assert!(Arc::ptr_eq(&completed, &ops));
    assert_eq!(ops.response().map(|state| state.status()), Some(200));
    drop(served.await.expect("server"));
}

/// WHY: A redirect is not the caller's outcome while it can still be followed
/// WHAT: A followed 3xx completes with Redirect and leaves the exchange Redirected
#[tokio::test]
async fn followed_redirects_complete_with_redirect() {
    let (ops, completion, mut server) = exchange(&ClientConfig::default(), true, None);

    server
        .write_all(b"HTTP/1.1 307 Temporary Redirect\r\nLocation: /b\r\nContent-Length: 0\r\n\r\n")
        .await
        .expect("write");

    assert_eq!(
        completion.await.err(),
        Some(HttpClientError::Redirect {
            status: 307,
            location: "/b".into()
        })
    );
    assert_eq!(ops.state(), ExchangeState::Redirected);
    assert!(ops.is_disposed());
}

#[tokio::test]
async fn a_full_history_stops_following() {
    let mut history = RedirectHistory::new();
    for hop in 0..foundation_reactive::MAX_REDIRECTS {
        history = history.with_appended(format!("http://host.test/{hop}"));
    }
    let (ops, completion, mut server) = exchange(&ClientConfig::default(), true, Some(history));
    assert!(!ops.is_follow_redirect());

    server
        .write_all(b"HTTP/1.1 302 Found\r\nLocation: /b\r\nContent-Length: 0\r\n\r\n")
        .await
        .expect("write");

    assert_eq!(completion.await.err(), Some(HttpClientError::HttpStatus(302)));
    assert_eq!(ops.redirected_from().len(), foundation_reactive::MAX_REDIRECTS);
}

#[tokio::test]
async fn the_peer_closing_first_is_connection_closed() {
    let (ops, completion, server) = exchange(&ClientConfig::default(), false, None);

    drop(server);

    assert_eq!(completion.await.err(), Some(HttpClientError::ConnectionClosed));
    assert!(ops.is_disposed());
}

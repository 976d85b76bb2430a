//! Redirect following across connections.
//!
//! WHY: A followed redirect is a fresh attempt on a new channel; the caller
//! must only ever see the final outcome, plus where it has been.
//!
//! WHAT: Hop counting, history, relative locations, the redirect cap and
//! the cases where a 3xx ends the request instead of being followed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use foundation_reactive::{ClientConfig, ClientRequest, HttpClientError, MAX_REDIRECTS};
use foundation_testing::http::HttpResponse;
use tracing_test::traced_test;

use super::ScriptedServer;

fn following() -> ClientConfig {
    ClientConfig::default().follow_redirects(true)
}

/// WHY: The caller sees the response of the last hop, not the redirect
/// WHAT: 301 then 200 yields the 200 with the first URI in the history
#[tokio::test]
#[traced_test]
async fn follows_a_single_redirect() {
    let server = ScriptedServer::new(|_, request| {
        if request.path == "/a" {
            HttpResponse::redirect_with(301, "/b")
        } else {
            HttpResponse::ok(b"ok".to_vec())
        }
    });

    let response = server
        .client(following())
        .get("http://host/a")
        .await
        .expect("should follow to /b");

    assert_eq!(response.status(), 200);
    assert_eq!(response.redirected_from().as_slice(), ["http://host/a".to_string()]);
    assert_eq!(response.uri(), "/b");
    assert_eq!(response.aggregate_string().await.expect("body"), "ok");
    assert_eq!(server.connection_count(), 2);

    let paths: Vec<String> = server.requests().into_iter().map(|request| request.path).collect();
    assert_eq!(paths, vec!["/a".to_string(), "/b".to_string()]);
}

#[tokio::test]
async fn relative_locations_resolve_against_the_current_uri() {
    let server = ScriptedServer::new(|index, _| {
        if index == 0 {
            HttpResponse::redirect("../c?x=1")
        } else {
            HttpResponse::ok(b"done".to_vec())
        }
    });

    let response = server
        .client(ClientConfig::default())
        .get("http://host/a/b")
        .follow_redirects()
        .await
        .expect("should follow");

    assert_eq!(response.status(), 200);
    assert_eq!(server.requests()[1].path, "/c?x=1");
    assert_eq!(server.requests()[1].header("host"), Some("host"));
}

/// WHY: Following is opt-in
/// WHAT: Without follow_redirects a 302 fails the request with its status
#[tokio::test]
async fn redirects_are_not_followed_by_default() {
    let server = ScriptedServer::new(|_, _| HttpResponse::redirect("/elsewhere"));

    let result = server.client(ClientConfig::default()).get("http://host/a").await;

    assert_eq!(result.err(), Some(HttpClientError::HttpStatus(302)));
    assert_eq!(server.connection_count(), 1);
}

#[tokio::test]
async fn redirects_without_a_location_end_the_request() {
    let server = ScriptedServer::new(|_, _| HttpResponse::status(302, "Found"));

    let result = server.client(following()).get("http://host/a").await;

    assert_eq!(result.err(), Some(HttpClientError::HttpStatus(302)));
    assert_eq!(server.connection_count(), 1);
}

/// WHY: The cap allows exactly MAX_REDIRECTS hops
/// WHAT: A chain of 50 redirects ends in the 200 on the 51st connection
#[tokio::test]
async fn follows_up_to_the_redirect_cap() {
    let server = ScriptedServer::new(|index, _| {
        if index < MAX_REDIRECTS {
            HttpResponse::redirect(&format!("/hop/{}", index + 1))
        } else {
            HttpResponse::ok(b"arrived".to_vec())
        }
    });

    let response = server
        .client(following())
        .get("http://host/hop/0")
        .await
        .expect("50 redirects are allowed");

    assert_eq!(response.status(), 200);
    assert_eq!(response.redirected_from().len(), MAX_REDIRECTS);
    assert_eq!(response.redirected_from().as_slice()[0], "http://host/hop/0");
    assert_eq!(server.connection_count(), MAX_REDIRECTS + 1);
}

/// WHY: Redirect loops must terminate
/// WHAT: The 51st redirect surfaces as HttpStatus and no 52nd connection is made
#[tokio::test]
async fn the_redirect_past_the_cap_is_a_status_failure() {
    let server = ScriptedServer::new(|index, _| HttpResponse::redirect(&format!("/loop/{index}")));

    let result = server.client(following()).get("http://host/loop/start").await;

    assert_eq!(result.err(), Some(HttpClientError::HttpStatus(302)));
    assert_eq!(server.connection_count(), MAX_REDIRECTS + 1);
}

#[tokio::test]
async fn unusable_locations_fail_without_another_attempt() {
    let server = ScriptedServer::new(|_, _| HttpResponse::redirect("ftp://files.test/archive"));

    let result = server.client(following()).get("http://host/a").await;

    assert!(matches!(result, Err(HttpClientError::InvalidLocation(_))));
    assert_eq!(server.connection_count(), 1);
}

/// WHY: Each hop is a new request that the caller's handler must shape again
/// WHAT: The handler runs once per attempt and sees the history so far
#[tokio::test]
async fn the_request_handler_runs_once_per_hop() {
    let server = ScriptedServer::new(|index, request| {
        assert_eq!(request.header("x-attempt"), Some("seen"));
        if index < 2 {
            HttpResponse::redirect(&format!("/next/{index}"))
        } else {
            HttpResponse::ok(b"ok".to_vec())
        }
    });
    let calls = Arc::new(AtomicUsize::new(0));
    let counted = calls.clone();
    let histories = Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen = histories.clone();

    let response = server
        .client(following())
        .get("http://host/start")
        .handler(move |request: ClientRequest| {
            counted.fetch_add(1, Ordering::SeqCst);
            seen.lock().expect("histories").push(request.redirected_from().len());
            async move {
                request.header("X-Attempt", "seen")?;
                request.send_headers().await
            }
        })
        .await
        .expect("should follow");

    assert_eq!(response.status(), 200);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(*histories.lock().expect("histories"), vec![0, 1, 2]);
}

//! Requests over real sockets against the threaded `TestHttpServer`.

use foundation_reactive::{ClientConfig, HttpClient, HttpClientError};
use foundation_testing::http::{HttpResponse, TestHttpServer};
use serial_test::serial;
use tracing_test::traced_test;

#[tokio::test(flavor = "multi_thread")]
#[serial]
#[traced_test]
async fn get_over_tcp() {
    let server = TestHttpServer::with_response(|request| {
        if request.path == "/hello" {
            HttpResponse::ok(b"world".to_vec())
        } else {
            HttpResponse::status(404, "Not Found")
        }
    });
    let client = HttpClient::new();

    let response = client.get(server.url("/hello")).await.expect("should succeed");

    assert_eq!(response.status(), 200);
    assert!(response.remote_address().is_some());
    assert_eq!(response.aggregate_string().await.expect("body"), "world");
}

/// WHY: Every hop of a redirect chain is its own connection
/// WHAT: A relative redirect on a real server costs two accepted connections
#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn redirects_over_tcp_use_a_connection_per_hop() {
    let server = TestHttpServer::with_response(|request| match request.path.as_str() {
        "/old" => HttpResponse::redirect("/new"),
        "/new" => HttpResponse::ok(b"moved".to_vec()),
        _ => HttpResponse::status(404, "Not Found"),
    });
    let client = HttpClient::with_config(ClientConfig::default().follow_redirects(true));

    let response = client.get(server.url("/old")).await.expect("should follow");

    assert_eq!(response.status(), 200);
    assert_eq!(response.redirected_from().as_slice(), [server.url("/old")]);
    assert_eq!(response.aggregate_string().await.expect("body"), "moved");
    assert_eq!(server.connection_count(), 2);
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn chunked_uploads_reach_the_server() {
    let server = TestHttpServer::with_response(|request| {
        assert!(request.is_chunked());
        HttpResponse::ok(request.body.clone())
    });
    let client = HttpClient::new();

    let response = client
        .post(server.url("/upload"))
        .handler(|request: foundation_reactive::ClientRequest| async move {
            request.send_headers().await?;
            request.send("first,").await?;
            request.send("second").await
        })
        .await
        .expect("should succeed");

    assert_eq!(response.aggregate_string().await.expect("body"), "first,second");
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn closed_ports_are_connect_failures() {
    let url = {
        let server = TestHttpServer::start();
        server.url("/")
    };
    // Give the listener thread time to notice it was dropped.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let client = HttpClient::with_config(
        ClientConfig::default().with_connect_timeout(std::time::Duration::from_secs(2)),
    );

    let result = client.get(url).await;

    assert!(matches!(result, Err(HttpClientError::ConnectFailure(_))));
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn websocket_echo_over_tcp() {
    let server = TestHttpServer::with_response(HttpResponse::switching_protocols);
    let client = HttpClient::new();
    let url = server.url("/echo").replacen("http://", "ws://", 1);

    let outcome = client
        .ws(url, &[], |session| async move {
            assert!(session.remote_address().is_some());
            session.send("ping").await?;
            let mut inbound = session.receive()?;
            let echoed = inbound.next_chunk().await.expect("server echoes")?;
            assert_eq!(&echoed[..], b"ping");
            Ok(())
        })
        .await;

    assert_eq!(outcome, Ok(()));
}

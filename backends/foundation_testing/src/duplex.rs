//! Scripted servers over in-memory duplex streams.
//!
//! WHY: Most client scenarios need exact control over what the "server"
//! sends and when, without sockets or ports.
//!
//! WHAT: Async helpers to read one request from, and write one response to,
//! the server half of a `tokio::io::duplex` pair.

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use crate::http::{HttpRequest, HttpResponse};

/// Reads one request head, plus a `Content-Length` body when one is declared.
///
/// Returns None when the client closed before a full head arrived.
///
/// # Errors
///
/// Read failures.
pub async fn read_request(stream: &mut DuplexStream) -> std::io::Result<Option<HttpRequest>> {
    let mut received = Vec::new();
    let mut buf = [0u8; 1024];
    let head_end = loop {
        if let Some(end) = find_head_end(&received) {
            break end;
        }
        let read = stream.read(&mut buf).await?;
        if read == 0 {
            return Ok(None);
        }
        received.extend_from_slice(&buf[..read]);
    };

    let head = String::from_utf8_lossy(&received[..head_end]).into_owned();
    let Some(mut request) = HttpRequest::parse_head(&head) else {
        return Ok(None);
    };

    let mut body = received.split_off(head_end + 4);
    if let Some(length) = request.content_length() {
        while body.len() < length {
            let read = stream.read(&mut buf).await?;
            if read == 0 {
                break;
            }
            body.extend_from_slice(&buf[..read]);
        }
        body.truncate(length);
    }
    request.body = body;
    Ok(Some(request))
}

/// Writes `response` and flushes.
///
/// # Errors
///
/// Write failures, typically the client having gone away.
pub async fn write_response(stream: &mut DuplexStream, response: &HttpResponse) -> std::io::Result<()> {
    stream.write_all(&response.render()).await?;
    stream.flush().await
}

/// Reads one request and answers it with whatever `respond` returns.
///
/// Returns the request that was served, None if the client left first.
///
/// # Errors
///
/// Read or write failures.
pub async fn serve_one<F>(stream: &mut DuplexStream, respond: F) -> std::io::Result<Option<HttpRequest>>
where
    F: FnOnce(&HttpRequest) -> HttpResponse,
{
    let Some(request) = read_request(stream).await? else {
        return Ok(None);
    };
    let response = respond(&request);
    tracing::debug!("Scripted server answering {} {} with {}", request.method, request.path, response.status);
    write_response(stream, &response).await?;
    Ok(Some(request))
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|window| window == b"\r\n\r\n")
}

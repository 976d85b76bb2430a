//! Opening handshake of a websocket connection (RFC 6455, section 4).

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use sha1::{Digest, Sha1};
use url::Url;

use crate::client::operations::OutboundRequest;
use crate::client::{HttpClientError, HttpClientResult, Target};
use crate::http::codec::ResponseHead;
use crate::http::{names, HttpMethod, HttpVersion};

pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
pub const WEBSOCKET_VERSION: &str = "13";

/// A fresh `Sec-WebSocket-Key`: 16 random bytes, base64 encoded.
#[must_use]
pub fn generate_key() -> String {
    let mut nonce = [0u8; 16];
    fastrand::fill(&mut nonce);
    STANDARD.encode(nonce)
}

/// The `Sec-WebSocket-Accept` value a server must answer `key` with.
#[must_use]
pub fn compute_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// The websocket target for the request being upgraded.
///
/// An absolute request URI is reused with its scheme switched; an
/// origin-form URI is combined with the `Host` header and the secure flag.
///
/// # Errors
///
/// `UpgradeFailed` when neither form yields a valid target.
pub fn websocket_target(request: &OutboundRequest, secure: bool) -> HttpClientResult<Target> {
    let resolved = match Url::parse(&request.uri) {
        Ok(url) if matches!(url.scheme(), "http" | "https" | "ws" | "wss") => Target::from_url(url),
        _ => {
            let host = request
                .headers
                .get(names::HOST)
                .ok_or_else(|| HttpClientError::UpgradeFailed("request has no Host header".into()))?;
            let scheme = if secure { "wss" } else { "ws" };
            Target::parse(&format!("{scheme}://{host}{}", request.uri))
        }
    };
    resolved
        .and_then(|target| target.to_websocket())
        .map_err(|err| HttpClientError::UpgradeFailed(err.to_string()))
}

/// Rewrites `request` into the handshake request for `target`.
///
/// The previous `Host` is dropped and re-derived from the target.
pub fn prepare_request(request: &mut OutboundRequest, target: &Target, key: &str, protocols: &[&str]) {
    request.method = HttpMethod::GET;
    request.uri = target.request_uri();
    request.version = HttpVersion::Http11;
    request.chunked = false;
    request.keep_alive = true;

    let headers = &mut request.headers;
    headers.remove(names::HOST);
    headers.remove(names::CONTENT_LENGTH);
    headers.remove(names::TRANSFER_ENCODING);
    headers.set(names::HOST, target.host_header());
    headers.set(names::UPGRADE, "websocket");
    headers.set(names::CONNECTION, "Upgrade");
    headers.set(names::SEC_WEBSOCKET_KEY, key);
    headers.set(names::SEC_WEBSOCKET_VERSION, WEBSOCKET_VERSION);
    if protocols.is_empty() {
        headers.remove(names::SEC_WEBSOCKET_PROTOCOL);
    } else {
        headers.set(names::SEC_WEBSOCKET_PROTOCOL, protocols.join(", "));
    }
}

/// Checks the handshake response, returning the sub-protocol the server selected.
///
/// # Errors
///
/// `UpgradeFailed` when the server did not switch protocols, answered with
/// the wrong accept key or picked a sub-protocol that was not offered.
pub fn validate_response(key: &str, protocols: &[String], head: &ResponseHead) -> HttpClientResult<Option<String>> {
    if head.status != 101 {
        return Err(HttpClientError::UpgradeFailed(format!(
            "handshake answered with status {}",
            head.status
        )));
    }
    if !head.headers.contains_token(names::UPGRADE, "websocket") {
        return Err(HttpClientError::UpgradeFailed("missing Upgrade: websocket".into()));
    }

    let expected = compute_accept_key(key);
    match head.headers.get(names::SEC_WEBSOCKET_ACCEPT) {
        Some(accept) if accept.trim() == expected => {}
        Some(accept) => {
            return Err(HttpClientError::UpgradeFailed(format!(
                "invalid Sec-WebSocket-Accept {accept:?}"
            )))
        }
        None => return Err(HttpClientError::UpgradeFailed("missing Sec-WebSocket-Accept".into())),
    }

    match head.headers.get(names::SEC_WEBSOCKET_PROTOCOL).map(str::trim) {
        None | Some("") => Ok(None),
        Some(selected) if protocols.iter().any(|offered| offered == selected) => Ok(Some(selected.to_string())),
        Some(selected) => Err(HttpClientError::UpgradeFailed(format!(
            "server selected sub-protocol {selected:?} that was not offered"
        ))),
    }
}

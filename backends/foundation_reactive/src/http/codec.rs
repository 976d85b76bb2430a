//! HTTP/1.1 wire codec for the client side of a channel.
//!
//! WHY: A channel only moves bytes; the engine reasons about response heads,
//! body chunks and the end of a body. The codec sits first in every channel
//! pipeline and turns one into the other.
//!
//! WHAT: request head and chunk encoders, plus `HttpResponseDecoder`, an
//! incremental decoder producing [`InboundMessage`]s.
//!
//! HOW: The decoder is a small state machine over a `BytesMut` read buffer.
//! It consumes exactly what it understands and leaves partial input in the
//! buffer for the next read. After a `101 Switching Protocols` head it stops
//! parsing and forwards raw bytes untouched.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use memchr::memmem;

use super::headers::{names, HttpHeaders};
use super::method::HttpMethod;
use super::version::HttpVersion;
use crate::channel::{ChannelError, ChannelResult};

/// Largest response head the decoder buffers before giving up.
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Longest chunk-size line (including extensions) accepted.
const MAX_CHUNK_LINE: usize = 1024;

/// Terminal chunk of a chunked request body.
pub const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResponseHead {
    pub version: HttpVersion,
    pub status: u16,
    pub reason: String,
    pub headers: HttpHeaders,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FullResponse {
    pub head: ResponseHead,
    pub body: Bytes,
}

/// What travels up a channel pipeline towards the bound operations.
///
/// A decoded response is always `Head`, zero or more `Content`, then `Last`.
/// Aggregation folds that sequence into one `Full`. `Raw` carries bytes that
/// arrived after the connection switched protocols.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InboundMessage {
    Head(ResponseHead),
    Content(Bytes),
    Last,
    Full(FullResponse),
    Raw(Bytes),
}

#[must_use]
pub fn encode_request_head(
    method: &HttpMethod,
    uri: &str,
    version: HttpVersion,
    headers: &HttpHeaders,
) -> Bytes {
    let mut buf = BytesMut::with_capacity(64 + headers.len() * 32);
    buf.put_slice(method.as_str().as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(uri.as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(version.as_str().as_bytes());
    buf.put_slice(b"\r\n");
    for (name, value) in headers.iter() {
        buf.put_slice(name.as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }
    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// Frames `data` as one chunk of a chunked body. Empty input yields no bytes
/// because an empty chunk would terminate the body.
#[must_use]
pub fn encode_chunk(data: &[u8]) -> Bytes {
    if data.is_empty() {
        return Bytes::new();
    }
    let mut buf = BytesMut::with_capacity(data.len() + 12);
    buf.put_slice(format!("{:X}\r\n", data.len()).as_bytes());
    buf.put_slice(data);
    buf.put_slice(b"\r\n");
    buf.freeze()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DecodeState {
    Head,
    Fixed(u64),
    ChunkSize,
    ChunkData(u64),
    ChunkDataEnd,
    Trailers,
    UntilClose,
    Raw,
}

#[derive(Debug)]
pub struct HttpResponseDecoder {
    state: DecodeState,
    bodiless: bool,
}

impl Default for HttpResponseDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpResponseDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: DecodeState::Head,
            bodiless: false,
        }
    }

    /// Responses to HEAD requests announce a length but never send a body.
    pub fn expect_bodiless_response(&mut self, bodiless: bool) {
        self.bodiless = bodiless;
    }

    /// True once a `101 Switching Protocols` head has been decoded.
    #[must_use]
    pub fn is_switched(&self) -> bool {
        self.state == DecodeState::Raw
    }

    /// Decodes as much of `buf` as possible, appending messages to `out`.
    ///
    /// # Errors
    ///
    /// Returns `ChannelError::Decode` for malformed input and
    /// `ChannelError::UnsupportedVersion` for status lines outside HTTP/1.x.
    pub fn decode(
        &mut self,
        buf: &mut BytesMut,
        out: &mut Vec<InboundMessage>,
    ) -> ChannelResult<()> {
        loop {
            match self.state {
                DecodeState::Head => {
                    let Some(end) = memmem::find(&buf[..], b"\r\n\r\n") else {
                        if buf.len() > MAX_HEAD_SIZE {
                            return Err(ChannelError::Decode(format!(
                                "response head exceeds {MAX_HEAD_SIZE} bytes"
                            )));
                        }
                        return Ok(());
                    };
                    let raw = buf.split_to(end + 4);
                    let head = parse_head(&raw[..end])?;
                    self.begin_body(head, out)?;
                }
                DecodeState::Fixed(remaining) => {
                    if buf.is_empty() {
                        return Ok(());
                    }
                    let left = take_content(buf, remaining, out);
                    if left == 0 {
                        out.push(InboundMessage::Last);
                        self.state = DecodeState::Head;
                    } else {
                        self.state = DecodeState::Fixed(left);
                    }
                }
                DecodeState::ChunkSize => {
                    let Some(end) = memmem::find(&buf[..], b"\r\n") else {
                        if buf.len() > MAX_CHUNK_LINE {
                            return Err(ChannelError::Decode("chunk size line too long".into()));
                        }
                        return Ok(());
                    };
                    let line = buf.split_to(end + 2);
                    let size = parse_chunk_size(&line[..end])?;
                    self.state = if size == 0 {
                        DecodeState::Trailers
                    } else {
                        DecodeState::ChunkData(size)
                    };
                }
                DecodeState::ChunkData(remaining) => {
                    if buf.is_empty() {
                        return Ok(());
                    }
                    let left = take_content(buf, remaining, out);
                    self.state = if left == 0 {
                        DecodeState::ChunkDataEnd
                    } else {
                        DecodeState::ChunkData(left)
                    };
                }
                DecodeState::ChunkDataEnd => {
                    if buf.len() < 2 {
                        return Ok(());
                    }
                    if &buf[..2] != b"\r\n" {
                        return Err(ChannelError::Decode(
                            "chunk data not followed by CRLF".into(),
                        ));
                    }
                    buf.advance(2);
                    self.state = DecodeState::ChunkSize;
                }
                DecodeState::Trailers => {
                    let Some(end) = memmem::find(&buf[..], b"\r\n") else {
                        return Ok(());
                    };
                    buf.advance(end + 2);
                    if end == 0 {
                        out.push(InboundMessage::Last);
                        self.state = DecodeState::Head;
                    }
                }
                DecodeState::UntilClose => {
                    if !buf.is_empty() {
                        out.push(InboundMessage::Content(buf.split().freeze()));
                    }
                    return Ok(());
                }
                DecodeState::Raw => {
                    if !buf.is_empty() {
                        out.push(InboundMessage::Raw(buf.split().freeze()));
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Finishes decoding once the peer closed its side of the connection.
    ///
    /// # Errors
    ///
    /// Returns `ChannelError::Decode` when the close cut a head or a framed
    /// body short.
    pub fn decode_eof(
        &mut self,
        buf: &mut BytesMut,
        out: &mut Vec<InboundMessage>,
    ) -> ChannelResult<()> {
        self.decode(buf, out)?;
        match self.state {
            DecodeState::UntilClose => {
                out.push(InboundMessage::Last);
                self.state = DecodeState::Head;
                Ok(())
            }
            DecodeState::Head if buf.is_empty() => Ok(()),
            DecodeState::Raw => Ok(()),
            DecodeState::Head => Err(ChannelError::Decode(
                "connection closed inside a response head".into(),
            )),
            _ => Err(ChannelError::Decode(
                "connection closed before the response body completed".into(),
            )),
        }
    }

    fn begin_body(&mut self, head: ResponseHead, out: &mut Vec<InboundMessage>) -> ChannelResult<()> {
        let status = head.status;
        if (100..200).contains(&status) && status != 101 {
            tracing::debug!("Skipping interim response with status {status}");
            return Ok(());
        }

        if status == 101 {
            out.push(InboundMessage::Head(head));
            out.push(InboundMessage::Last);
            self.state = DecodeState::Raw;
            return Ok(());
        }

        let bodiless = self.bodiless || status == 204 || status == 304;
        let chunked = head.headers.contains_token(names::TRANSFER_ENCODING, "chunked");
        let length = match head.headers.get(names::CONTENT_LENGTH) {
            Some(value) => Some(value.trim().parse::<u64>().map_err(|_| {
                ChannelError::Decode(format!("invalid Content-Length: {value:?}"))
            })?),
            None => None,
        };

        out.push(InboundMessage::Head(head));
        self.state = if bodiless {
            out.push(InboundMessage::Last);
            DecodeState::Head
        } else if chunked {
            DecodeState::ChunkSize
        } else {
            match length {
                Some(0) => {
                    out.push(InboundMessage::Last);
                    DecodeState::Head
                }
                Some(length) => DecodeState::Fixed(length),
                None => DecodeState::UntilClose,
            }
        };
        Ok(())
    }
}

/// Moves up to `remaining` bytes out of `buf` as content, returning what is still expected.
fn take_content(buf: &mut BytesMut, remaining: u64, out: &mut Vec<InboundMessage>) -> u64 {
    let take = usize::try_from(remaining)
        .unwrap_or(usize::MAX)
        .min(buf.len());
    out.push(InboundMessage::Content(buf.split_to(take).freeze()));
    remaining - take as u64
}

fn parse_chunk_size(line: &[u8]) -> ChannelResult<u64> {
    let text = std::str::from_utf8(line)
        .map_err(|_| ChannelError::Decode("chunk size is not valid UTF-8".into()))?;
    let size = text.split(';').next().unwrap_or_default().trim();
    u64::from_str_radix(size, 16)
        .map_err(|_| ChannelError::Decode(format!("invalid chunk size: {size:?}")))
}

fn parse_head(raw: &[u8]) -> ChannelResult<ResponseHead> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| ChannelError::Decode("response head is not valid UTF-8".into()))?;
    let mut lines = text.split("\r\n");
    let status_line = lines.next().unwrap_or_default();

    let mut parts = status_line.splitn(3, ' ');
    let version_text = parts.next().unwrap_or_default();
    let version = HttpVersion::parse(version_text).ok_or_else(|| {
        if version_text.starts_with("HTTP/") {
            ChannelError::UnsupportedVersion(version_text.to_string())
        } else {
            ChannelError::Decode(format!("malformed status line: {status_line:?}"))
        }
    })?;

    let status = parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .filter(|code| (100..1000).contains(code))
        .ok_or_else(|| ChannelError::Decode(format!("invalid status code in {status_line:?}")))?;
    let reason = parts.next().unwrap_or_default().to_string();

    let mut headers = HttpHeaders::new();
    for line in lines.filter(|line| !line.is_empty()) {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ChannelError::Decode(format!("malformed header line: {line:?}")))?;
        headers.add(name.trim(), value.trim());
    }

    Ok(ResponseHead {
        version,
        status,
        reason,
        headers,
    })
}

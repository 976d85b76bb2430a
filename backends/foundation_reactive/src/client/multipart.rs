//! Multipart response bodies.
//!
//! WHY: A `multipart/*` response is one body carrying several entities;
//! callers want the entities, not the delimiter bookkeeping.
//!
//! WHAT: `MultipartStream`, a view over a response body that yields one
//! `MultipartPart` (headers plus content) per entity, and the incremental
//! `MultipartDecoder` underneath it.
//!
//! HOW: The decoder buffers until it sees the next `--boundary` delimiter,
//! so a part is only handed out once it is complete. Preamble and epilogue
//! are dropped.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use futures_core::Stream;
use memchr::memmem;

use super::{BodyStream, HttpClientError, HttpClientResult};
use crate::http::HttpHeaders;

const CRLF: &[u8] = b"\r\n";
const HEADER_END: &[u8] = b"\r\n\r\n";

/// Reads the `boundary` parameter of a `multipart/*` content type.
#[must_use]
pub fn boundary(content_type: &str) -> Option<String> {
    let mut params = content_type.split(';');
    let mime = params.next()?.trim();
    if !mime.to_ascii_lowercase().starts_with("multipart/") {
        return None;
    }
    params.find_map(|param| {
        let (name, value) = param.split_once('=')?;
        if !name.trim().eq_ignore_ascii_case("boundary") {
            return None;
        }
        let value = value.trim().trim_matches('"');
        (!value.is_empty()).then(|| value.to_string())
    })
}

/// One entity of a multipart body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MultipartPart {
    pub headers: HttpHeaders,
    pub body: Bytes,
}

impl MultipartPart {
    /// The `name` parameter of the part's `Content-Disposition`, if any.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        let disposition = self.headers.get("content-disposition")?;
        disposition.split(';').skip(1).find_map(|param| {
            let (key, value) = param.split_once('=')?;
            key.trim()
                .eq_ignore_ascii_case("name")
                .then(|| value.trim().trim_matches('"'))
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DecodeState {
    Preamble,
    AfterDelimiter,
    Headers,
    Body,
    Done,
}

/// Incremental multipart parser; feed bytes with `push`, drain parts with `next_part`.
#[derive(Debug)]
pub struct MultipartDecoder {
    delimiter: Vec<u8>,
    buf: BytesMut,
    state: DecodeState,
    headers: HttpHeaders,
}

impl MultipartDecoder {
    #[must_use]
    pub fn new(boundary: &str) -> Self {
        let mut delimiter = b"--".to_vec();
        delimiter.extend_from_slice(boundary.as_bytes());
        Self {
            delimiter,
            buf: BytesMut::new(),
            state: DecodeState::Preamble,
            headers: HttpHeaders::new(),
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        if self.state != DecodeState::Done {
            self.buf.extend_from_slice(data);
        }
    }

    /// True once the closing delimiter was read.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state == DecodeState::Done
    }

    /// Next complete part, `Ok(None)` when more input is needed or the body ended.
    ///
    /// # Errors
    ///
    /// `InvalidMultipart` for a delimiter line or part header that cannot be parsed.
    pub fn next_part(&mut self) -> HttpClientResult<Option<MultipartPart>> {
        loop {
            match self.state {
                DecodeState::Done => return Ok(None),
                DecodeState::Preamble => {
                    let Some(at) = memmem::find(&self.buf, &self.delimiter) else {
                        // Keep a tail long enough to hold a delimiter split across reads.
                        let keep = self.delimiter.len().min(self.buf.len());
                        self.buf.advance(self.buf.len() - keep);
                        return Ok(None);
                    };
                    self.buf.advance(at + self.delimiter.len());
                    self.state = DecodeState::AfterDelimiter;
                }
                DecodeState::AfterDelimiter => {
                    let padding = self.buf.iter().take_while(|byte| matches!(byte, b' ' | b'\t')).count();
                    let rest = &self.buf[padding..];
                    if rest.len() < 2 {
                        return Ok(None);
                    }
                    if rest.starts_with(b"--") {
                        self.state = DecodeState::Done;
                        self.buf.clear();
                        return Ok(None);
                    }
                    if !rest.starts_with(CRLF) {
                        return Err(HttpClientError::InvalidMultipart(
                            "delimiter is not followed by a line break".into(),
                        ));
                    }
                    self.buf.advance(padding + CRLF.len());
                    self.state = DecodeState::Headers;
                }
                DecodeState::Headers => {
                    if self.buf.starts_with(CRLF) {
                        self.buf.advance(CRLF.len());
                        self.headers = HttpHeaders::new();
                        self.state = DecodeState::Body;
                        continue;
                    }
                    let Some(end) = memmem::find(&self.buf, HEADER_END) else {
                        return Ok(None);
                    };
                    let block = self.buf.split_to(end + HEADER_END.len());
                    self.headers = parse_part_headers(&block[..end])?;
                    self.state = DecodeState::Body;
                }
                DecodeState::Body => {
                    let mut marker = CRLF.to_vec();
                    marker.extend_from_slice(&self.delimiter);
                    let Some(end) = memmem::find(&self.buf, &marker) else {
                        return Ok(None);
                    };
                    let body = self.buf.split_to(end).freeze();
                    self.buf.advance(marker.len());
                    self.state = DecodeState::AfterDelimiter;
                    return Ok(Some(MultipartPart {
                        headers: std::mem::take(&mut self.headers),
                        body,
                    }));
                }
            }
        }
    }
}

fn parse_part_headers(block: &[u8]) -> HttpClientResult<HttpHeaders> {
    let text = std::str::from_utf8(block)
        .map_err(|_| HttpClientError::InvalidMultipart("part headers are not UTF-8".into()))?;
    let mut headers = HttpHeaders::new();
    for line in text.split("\r\n").filter(|line| !line.is_empty()) {
        let Some((name, value)) = line.split_once(':') else {
            return Err(HttpClientError::InvalidMultipart(format!("malformed part header: {line}")));
        };
        headers.add(name.trim(), value.trim());
    }
    Ok(headers)
}

/// The parts of a multipart response body, in order.
pub struct MultipartStream {
    body: BodyStream,
    decoder: MultipartDecoder,
    finished: bool,
}

impl MultipartStream {
    pub(crate) fn new(body: BodyStream, boundary: &str) -> Self {
        Self {
            body,
            decoder: MultipartDecoder::new(boundary),
            finished: false,
        }
    }

    /// Next part, `None` after the closing delimiter.
    pub async fn next_part(&mut self) -> Option<HttpClientResult<MultipartPart>> {
        std::future::poll_fn(|cx| self.poll_part(cx)).await
    }

    /// Collects every remaining part.
    ///
    /// # Errors
    ///
    /// The first body or parse failure.
    pub async fn collect_parts(mut self) -> HttpClientResult<Vec<MultipartPart>> {
        let mut parts = Vec::new();
        while let Some(part) = self.next_part().await {
            parts.push(part?);
        }
        Ok(parts)
    }

    fn poll_part(&mut self, cx: &mut Context<'_>) -> Poll<Option<HttpClientResult<MultipartPart>>> {
        loop {
            if self.finished {
                return Poll::Ready(None);
            }
            match self.decoder.next_part() {
                Ok(Some(part)) => return Poll::Ready(Some(Ok(part))),
                Ok(None) if self.decoder.is_done() => {
                    self.finished = true;
                    return Poll::Ready(None);
                }
                Ok(None) => {}
                Err(err) => {
                    self.finished = true;
                    return Poll::Ready(Some(Err(err)));
                }
            }

            match self.body.poll_chunk(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Ok(chunk))) => self.decoder.push(&chunk),
                Poll::Ready(Some(Err(err))) => {
                    self.finished = true;
                    return Poll::Ready(Some(Err(err)));
                }
                Poll::Ready(None) => {
                    self.finished = true;
                    return Poll::Ready(Some(Err(HttpClientError::InvalidMultipart(
                        "body ended before the closing delimiter".into(),
                    ))));
                }
            }
        }
    }
}

impl Stream for MultipartStream {
    type Item = HttpClientResult<MultipartPart>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().poll_part(cx)
    }
}

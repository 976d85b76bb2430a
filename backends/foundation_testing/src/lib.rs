//! Reusable test servers for the foundation HTTP client crates.
//!
//! This crate provides:
//! - **Threaded TCP server**: `http::TestHttpServer`, answering each request
//!   from a handler closure, with redirect, status and websocket responses
//! - **Scripted duplex servers**: `duplex` helpers that read a request and
//!   write a response over an in-memory `tokio::io::DuplexStream`
//!
//! # Examples
//!
//! ```rust
//! use foundation_testing::http::{HttpResponse, TestHttpServer};
//!
//! let server = TestHttpServer::with_response(|req| match req.path.as_str() {
//!     "/a" => HttpResponse::redirect("/b"),
//!     _ => HttpResponse::ok(b"ok"),
//! });
//!
//! assert!(server.url("/a").ends_with("/a"));
//! ```

#![allow(clippy::module_name_repetitions)] // Common for testing crates

pub mod duplex;
pub mod http;

pub use http::{HttpRequest, HttpResponse, TestHttpServer};

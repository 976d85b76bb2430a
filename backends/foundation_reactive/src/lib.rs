//! Reactive HTTP/1.1 client engine.
//!
//! WHY: A request over a non-blocking connection has to end in exactly one
//! outcome, respect backpressure in both directions and survive protocol
//! transitions (redirects onto new connections, upgrades on the same one)
//! without two parties ever owning a connection at once.
//!
//! WHAT: [`channel`] is the event driven connection with its pipeline and
//! operations slot. [`http`] holds the wire level types and codec. [`client`]
//! is the exchange state machine, the connection driver, the redirect bridge
//! and the caller facing handles. [`websocket`] is the one-shot upgrade.
//! [`retries`] holds the retry deciders the redirect bridge runs on.
//!
//! HOW: Every attempt is one channel with one `HttpClientOperations` bound
//! into its slot. Terminal outcomes flow through a single-fire completion;
//! redirects come back as a typed failure the bridge turns into the next
//! attempt.

pub mod channel;
pub mod client;
pub mod config;
pub mod http;
pub mod retries;
pub mod websocket;

mod sync;

pub use client::{
    BodyStream, ClientRequest, ClientResponse, HttpClient, HttpClientError, HttpClientResult, RedirectHistory,
    ResponseMono, Target, MAX_REDIRECTS,
};
pub use config::{ClientConfig, ConfigError, DuplicateResponsePolicy};
pub use websocket::WebsocketSession;

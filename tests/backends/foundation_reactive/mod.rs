//! End-to-end scenarios for the reactive HTTP client engine.
//!
//! `units` drive single components through the public API; `integrations`
//! run whole requests through `HttpClient` against scripted duplex servers
//! and the threaded TCP test server.

#[cfg(test)]
mod integrations;
#[cfg(test)]
mod units;

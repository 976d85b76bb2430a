//! HTTP/1.1 building blocks shared by the channel and the client.

pub mod aggregator;
pub mod codec;
pub mod cookies;
pub mod headers;
pub mod method;
pub mod version;

pub use aggregator::{HttpObjectAggregator, DEFAULT_MAX_AGGREGATE_SIZE};
pub use codec::{FullResponse, HttpResponseDecoder, InboundMessage, ResponseHead};
pub use cookies::{Cookie, Cookies};
pub use headers::{names, HttpHeaders};
pub use method::HttpMethod;
pub use version::HttpVersion;

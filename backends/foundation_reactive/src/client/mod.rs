//! The HTTP client engine: exchanges, acquisition, redirects and the caller facing handles.

pub mod capabilities;
pub mod completion;
pub mod driver;
mod errors;
mod http_client;
pub mod multipart;
pub mod operations;
pub mod redirects;
mod request;
pub mod response;
mod target;

pub use capabilities::{
    upgrade_to_text_websocket, upgrade_to_websocket_default, Inbound, InboundExt, Outbound, OutboundExt,
};
pub use completion::{completion, Completion, CompletionSink, Outcome};
pub use driver::{ChannelInitializer, ConnectionDriver, RequestHandler, RequestOptions};
pub use errors::{HttpClientError, HttpClientResult};
pub use http_client::{HttpClient, ResponseMono};
pub use multipart::{MultipartPart, MultipartStream};
pub use operations::{ExchangeState, HeadersLatch, HttpClientOperations, OutboundRequest, ResponseState};
pub use redirects::RedirectBridge;
pub use request::ClientRequest;
pub use response::{BodyStream, ClientResponse};
pub use target::{RedirectHistory, Target, MAX_REDIRECTS};

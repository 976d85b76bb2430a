use derive_more::From;

use crate::channel::ChannelError;

/// Errors surfaced by the HTTP client engine.
///
/// `Redirect` is the only variant the engine consumes itself: the redirect
/// bridge turns it into a new attempt. Every other variant reaches the
/// caller unchanged.
#[derive(From, Debug, Clone, PartialEq, Eq)]
pub enum HttpClientError {
    /// A header or cookie mutation was attempted after the request head was dispatched.
    HeaderLocked,

    /// The server asked to be followed elsewhere and following is allowed.
    Redirect { status: u16, location: String },

    /// A 4xx/5xx response, or a 3xx that was not followed.
    HttpStatus(u16),

    /// Resolving, dialling or securing the connection failed.
    ConnectFailure(String),

    /// The channel closed before the exchange produced a response.
    ConnectionClosed,

    /// An upgrade was requested on a channel that is already disposed.
    NotActive,

    /// The request head was already sent, so the upgrade request cannot be.
    UpgradeTooLate,

    /// Another actor replaced the channel operations first.
    UpgradeConflict,

    /// The upgrade handshake could not be performed or was rejected.
    UpgradeFailed(String),

    /// The response used a protocol version other than HTTP/1.0 or HTTP/1.1.
    UnsupportedVersion(String),

    InvalidUrl(String),

    InvalidLocation(String),

    InvalidHeader(String),

    InvalidCookie(String),

    /// The request body was sent whole with a `Content-Length`; nothing more may follow it.
    BodyAlreadySent,

    /// The response body stream may be taken only once.
    InboundAlreadyConsumed,

    /// The response is not a multipart body, or its parts are malformed.
    InvalidMultipart(String),

    /// The peer broke the exchange protocol, for example by sending a second response head.
    ProtocolViolation(String),

    /// The per-attempt request handler panicked or was cancelled.
    HandlerFailed(String),

    #[from]
    Channel(ChannelError),
}

impl HttpClientError {
    /// Groups the ways a websocket upgrade can be refused.
    #[must_use]
    pub fn is_upgrade_failure(&self) -> bool {
        matches!(
            self,
            Self::NotActive | Self::UpgradeTooLate | Self::UpgradeConflict | Self::UpgradeFailed(_)
        )
    }

    /// Maps a channel failure onto the client taxonomy.
    #[must_use]
    pub fn from_channel(err: ChannelError) -> Self {
        match err {
            ChannelError::Closed => Self::ConnectionClosed,
            ChannelError::UnsupportedVersion(version) => Self::UnsupportedVersion(version),
            other => Self::Channel(other),
        }
    }
}

impl std::error::Error for HttpClientError {}

impl core::fmt::Display for HttpClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HeaderLocked => write!(f, "headers were already sent, they can no longer be changed"),
            Self::Redirect { status, location } => {
                write!(f, "redirect ({status}) to {location}")
            }
            Self::HttpStatus(status) => write!(f, "request failed with status {status}"),
            Self::ConnectFailure(reason) => write!(f, "connection failed: {reason}"),
            Self::ConnectionClosed => write!(f, "connection closed before the exchange completed"),
            Self::NotActive => write!(f, "channel is no longer active"),
            Self::UpgradeTooLate => write!(f, "unable to upgrade: headers already sent"),
            Self::UpgradeConflict => write!(f, "unable to upgrade: channel already owned by another handler"),
            Self::UpgradeFailed(reason) => write!(f, "websocket upgrade failed: {reason}"),
            Self::UnsupportedVersion(version) => write!(f, "unsupported protocol version: {version}"),
            Self::InvalidUrl(reason) => write!(f, "invalid url: {reason}"),
            Self::InvalidLocation(reason) => write!(f, "invalid redirect location: {reason}"),
            Self::InvalidHeader(name) => write!(f, "invalid header: {name}"),
            Self::InvalidCookie(name) => write!(f, "invalid cookie: {name}"),
            Self::BodyAlreadySent => write!(f, "request body was already sent with a fixed length"),
            Self::InboundAlreadyConsumed => write!(f, "response body was already consumed"),
            Self::InvalidMultipart(reason) => write!(f, "invalid multipart body: {reason}"),
            Self::ProtocolViolation(reason) => write!(f, "protocol violation: {reason}"),
            Self::HandlerFailed(reason) => write!(f, "request handler failed: {reason}"),
            Self::Channel(err) => write!(f, "{err}"),
        }
    }
}

pub type HttpClientResult<T> = std::result::Result<T, HttpClientError>;

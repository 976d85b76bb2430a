use std::io;

/// Transport and pipeline errors raised by a [`super::Channel`].
///
/// I/O failures are stored as their rendered message so the error stays
/// `Clone`; the same failure is handed both to the completion of an exchange
/// and to whoever is streaming its body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    Io(String),

    /// The channel was closed before or while the operation ran.
    Closed,

    Timeout(String),

    /// No pipeline stage is registered under the given name.
    UnknownStage(String),

    /// A pipeline stage with the given name already exists.
    DuplicateStage(String),

    /// An aggregated message grew past the configured maximum size.
    TooLongFrame { limit: usize },

    /// The peer sent bytes the response decoder could not make sense of.
    Decode(String),

    /// The status line named a protocol version other than HTTP/1.0 or HTTP/1.1.
    UnsupportedVersion(String),
}

impl From<io::Error> for ChannelError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut => Self::Timeout(err.to_string()),
            _ => Self::Io(err.to_string()),
        }
    }
}

impl std::error::Error for ChannelError {}

impl core::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "channel I/O failure: {err}"),
            Self::Closed => write!(f, "channel is closed"),
            Self::Timeout(err) => write!(f, "channel operation timed out: {err}"),
            Self::UnknownStage(name) => write!(f, "no pipeline stage named {name:?}"),
            Self::DuplicateStage(name) => write!(f, "pipeline stage {name:?} already exists"),
            Self::TooLongFrame { limit } => {
                write!(f, "aggregated message exceeds the limit of {limit} bytes")
            }
            Self::Decode(reason) => write!(f, "failed to decode response: {reason}"),
            Self::UnsupportedVersion(version) => {
                write!(f, "unsupported protocol version: {version}")
            }
        }
    }
}

pub type ChannelResult<T> = std::result::Result<T, ChannelError>;

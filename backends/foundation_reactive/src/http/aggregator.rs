use bytes::BytesMut;

use super::codec::{FullResponse, InboundMessage, ResponseHead};
use crate::channel::{ChannelError, ChannelResult, ChannelStage};

/// Default bound on an aggregated response, matching the handshake needs of an upgrade.
pub const DEFAULT_MAX_AGGREGATE_SIZE: usize = 8192;

/// Folds `Head`, `Content*`, `Last` into a single `Full` message.
///
/// Messages that are already whole (`Full`, `Raw`) pass straight through.
pub struct HttpObjectAggregator {
    max_size: usize,
    head: Option<ResponseHead>,
    body: BytesMut,
}

impl HttpObjectAggregator {
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            head: None,
            body: BytesMut::new(),
        }
    }
}

impl ChannelStage for HttpObjectAggregator {
    fn inbound(
        &mut self,
        message: InboundMessage,
        out: &mut Vec<InboundMessage>,
    ) -> ChannelResult<()> {
        match message {
            InboundMessage::Head(head) => {
                self.head = Some(head);
                self.body.clear();
            }
            InboundMessage::Content(bytes) => {
                if self.body.len() + bytes.len() > self.max_size {
                    return Err(ChannelError::TooLongFrame {
                        limit: self.max_size,
                    });
                }
                self.body.extend_from_slice(&bytes);
            }
            InboundMessage::Last => match self.head.take() {
                Some(head) => out.push(InboundMessage::Full(FullResponse {
                    head,
                    body: self.body.split().freeze(),
                })),
                None => tracing::debug!("Aggregator saw an end of body without a head"),
            },
            whole => out.push(whole),
        }
        Ok(())
    }
}

//! Named processing stages between the socket and the bound operations.
//!
//! WHY: Protocol transitions change how inbound bytes must be interpreted.
//! A websocket handshake, for example, wants its `101` response as one
//! aggregated unit, which is achieved by inserting a stage ahead of the
//! reactive bridge without touching the codec or the operations.
//!
//! WHAT: `Pipeline`, an ordered list of `ChannelStage`s bracketed by the
//! HTTP codec (always first) and the reactive bridge marker (always last,
//! the point where messages are handed to the channel's operations slot).

use bytes::BytesMut;

use super::{ChannelError, ChannelResult};
use crate::http::codec::{HttpResponseDecoder, InboundMessage};

pub const HTTP_CODEC: &str = "http-codec";
pub const HTTP_AGGREGATOR: &str = "http-aggregator";
pub const REACTIVE_BRIDGE: &str = "reactive-bridge";

/// One inbound transformation step.
pub trait ChannelStage: Send {
    /// Consumes one message, pushing zero or more messages for the next stage.
    ///
    /// # Errors
    ///
    /// A stage error terminates the channel's inbound side.
    fn inbound(&mut self, message: InboundMessage, out: &mut Vec<InboundMessage>)
        -> ChannelResult<()>;
}

pub struct Pipeline {
    codec: HttpResponseDecoder,
    stages: Vec<(String, Box<dyn ChannelStage>)>,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipeline {
    #[must_use]
    pub fn new() -> Self {
        Self {
            codec: HttpResponseDecoder::new(),
            stages: Vec::new(),
        }
    }

    pub fn codec_mut(&mut self) -> &mut HttpResponseDecoder {
        &mut self.codec
    }

    /// Stage names in processing order, codec and bridge included.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names = Vec::with_capacity(self.stages.len() + 2);
        names.push(HTTP_CODEC);
        names.extend(self.stages.iter().map(|(name, _)| name.as_str()));
        names.push(REACTIVE_BRIDGE);
        names
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        name == HTTP_CODEC || name == REACTIVE_BRIDGE || self.position(name).is_some()
    }

    /// Inserts `stage` immediately ahead of the stage named `before`.
    ///
    /// # Errors
    ///
    /// `UnknownStage` when `before` is missing or is the codec (nothing runs
    /// ahead of it), `DuplicateStage` when `name` is already taken.
    pub fn insert_before(
        &mut self,
        before: &str,
        name: impl Into<String>,
        stage: Box<dyn ChannelStage>,
    ) -> ChannelResult<()> {
        let name = name.into();
        if self.contains(&name) {
            return Err(ChannelError::DuplicateStage(name));
        }

        let index = if before == REACTIVE_BRIDGE {
            self.stages.len()
        } else {
            self.position(before)
                .ok_or_else(|| ChannelError::UnknownStage(before.to_string()))?
        };

        tracing::debug!("Inserting pipeline stage {name:?} before {before:?}");
        self.stages.insert(index, (name, stage));
        Ok(())
    }

    /// Removes a previously inserted stage, returning whether it was present.
    pub fn remove(&mut self, name: &str) -> bool {
        match self.position(name) {
            Some(index) => {
                self.stages.remove(index);
                true
            }
            None => false,
        }
    }

    /// Runs newly read bytes through the codec and every stage.
    ///
    /// # Errors
    ///
    /// Propagates the first codec or stage failure.
    pub fn process(&mut self, buf: &mut BytesMut) -> ChannelResult<Vec<InboundMessage>> {
        let mut decoded = Vec::new();
        self.codec.decode(buf, &mut decoded)?;
        self.run_stages(decoded)
    }

    /// Like [`Pipeline::process`] for the final bytes before end of stream.
    ///
    /// # Errors
    ///
    /// Propagates the first codec or stage failure.
    pub fn process_eof(&mut self, buf: &mut BytesMut) -> ChannelResult<Vec<InboundMessage>> {
        let mut decoded = Vec::new();
        self.codec.decode_eof(buf, &mut decoded)?;
        self.run_stages(decoded)
    }

    fn run_stages(&mut self, mut messages: Vec<InboundMessage>) -> ChannelResult<Vec<InboundMessage>> {
        for (_, stage) in &mut self.stages {
            let mut next = Vec::with_capacity(messages.len());
            for message in messages {
                stage.inbound(message, &mut next)?;
            }
            messages = next;
        }
        Ok(messages)
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|(stage, _)| stage == name)
    }
}

//! The per-channel ownership cell for protocol operations.
//!
//! WHY: Exactly one protocol handler owns a channel at a time: first the
//! HTTP exchange, later possibly a websocket session. Hand-over has to be
//! atomic so two actors can never both believe they own the connection.
//!
//! WHAT: `ChannelOperations`, the callbacks a channel drives, and
//! `OperationsSlot`, the compare-and-set cell holding the current owner.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::ChannelError;
use crate::http::codec::InboundMessage;
use crate::sync::lock;

/// Callbacks a channel delivers to whichever operations currently own it.
#[async_trait]
pub trait ChannelOperations: Send + Sync {
    /// Short label used in logs.
    fn name(&self) -> &'static str;

    /// Delivers one inbound message. The channel's reader does not read
    /// further until this returns, which is how inbound backpressure reaches
    /// the socket.
    async fn on_inbound_next(&self, message: InboundMessage);

    /// The inbound side failed; no further messages follow.
    fn on_inbound_error(&self, error: ChannelError);

    /// The channel closed, locally or by the peer.
    fn on_channel_closed(&self);
}

#[derive(Default)]
pub struct OperationsSlot {
    current: Mutex<Option<Arc<dyn ChannelOperations>>>,
}

impl OperationsSlot {
    #[must_use]
    pub fn get(&self) -> Option<Arc<dyn ChannelOperations>> {
        lock(&self.current).clone()
    }

    /// Unconditionally binds `operations`, returning the previous owner.
    pub fn set(&self, operations: Arc<dyn ChannelOperations>) -> Option<Arc<dyn ChannelOperations>> {
        lock(&self.current).replace(operations)
    }

    /// Replaces the owner only if it is still `expected` (compared by identity).
    pub fn compare_and_set(
        &self,
        expected: &Arc<dyn ChannelOperations>,
        replacement: Arc<dyn ChannelOperations>,
    ) -> bool {
        let mut current = lock(&self.current);
        match current.as_ref() {
            Some(bound) if same_operations(bound, expected) => {
                tracing::debug!(
                    "Swapping channel operations {} -> {}",
                    bound.name(),
                    replacement.name()
                );
                *current = Some(replacement);
                true
            }
            _ => false,
        }
    }

    /// Unbinds the current owner, returning it.
    pub fn take(&self) -> Option<Arc<dyn ChannelOperations>> {
        lock(&self.current).take()
    }

    /// True when `operations` is the current owner.
    #[must_use]
    pub fn is_bound(&self, operations: &Arc<dyn ChannelOperations>) -> bool {
        lock(&self.current)
            .as_ref()
            .is_some_and(|bound| same_operations(bound, operations))
    }
}

/// Identity comparison on the data pointer; vtable addresses are not stable across codegen units.
fn same_operations(left: &Arc<dyn ChannelOperations>, right: &Arc<dyn ChannelOperations>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(left), Arc::as_ptr(right))
}

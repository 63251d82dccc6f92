//! Inbound message envelopes

use std::sync::Arc;

use fleet_protocol::{DecodedMessage, MessageTypeKey};

/// A decoded inbound message tagged with the link it arrived on
#[derive(Debug, Clone)]
pub struct InboundEnvelope<M> {
    /// Name of the link the message was received on
    pub link_name: Arc<str>,
    /// The decoded message
    pub message: M,
    /// Identifier of the sender, if the protocol carries one
    pub correlation_id: Option<String>,
}

impl<M: DecodedMessage> InboundEnvelope<M> {
    /// Wrap a message received on `link_name`
    pub fn new(link_name: Arc<str>, message: M) -> Self {
        let correlation_id = message.correlation_id();
        Self {
            link_name,
            message,
            correlation_id,
        }
    }

    /// Dispatch key of the wrapped message
    pub fn type_key(&self) -> MessageTypeKey {
        self.message.type_key()
    }
}

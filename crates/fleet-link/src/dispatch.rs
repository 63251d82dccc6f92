//! Message dispatch table
//!
//! Routes inbound envelopes to handlers by message type. The first time a
//! message type without a handler shows up, a single warning is logged and
//! the type is muted for the lifetime of the dispatcher.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::error::Error;
use std::sync::{Arc, PoisonError, RwLock};

use fleet_protocol::{DecodedMessage, MessageTypeKey};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::envelope::InboundEnvelope;

/// Result returned by message handlers
pub type HandlerResult = Result<(), Box<dyn Error + Send + Sync>>;

type HandlerFn<M> = dyn Fn(&M, &str, Option<&str>) -> HandlerResult + Send + Sync;

enum Handler<M> {
    /// Messages of this type are dropped silently
    Noop,
    Call(Arc<HandlerFn<M>>),
}

impl<M> Clone for Handler<M> {
    fn clone(&self) -> Self {
        match self {
            Handler::Noop => Handler::Noop,
            Handler::Call(f) => Handler::Call(f.clone()),
        }
    }
}

/// Message-type keyed handler registry
pub struct Dispatcher<M> {
    handlers: RwLock<HashMap<MessageTypeKey, Handler<M>>>,
}

impl<M: DecodedMessage> Dispatcher<M> {
    /// Create a dispatcher that only discards `BAD_DATA`
    pub fn new() -> Self {
        let mut handlers = HashMap::new();
        handlers.insert(MessageTypeKey::BAD_DATA, Handler::Noop);
        Self {
            handlers: RwLock::new(handlers),
        }
    }

    /// Register a handler for a message type
    ///
    /// Replaces an earlier handler for the same type. Returns `false`
    /// without installing the handler if the type has been muted.
    pub fn register<F>(&self, key: impl Into<MessageTypeKey>, handler: F) -> bool
    where
        F: Fn(&M, &str, Option<&str>) -> HandlerResult + Send + Sync + 'static,
    {
        let key = key.into();
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        match handlers.entry(key) {
            Entry::Occupied(entry) if matches!(entry.get(), Handler::Noop) => {
                debug!("Not registering handler for muted type {}", entry.key());
                false
            }
            Entry::Occupied(mut entry) => {
                entry.insert(Handler::Call(Arc::new(handler)));
                true
            }
            Entry::Vacant(entry) => {
                entry.insert(Handler::Call(Arc::new(handler)));
                true
            }
        }
    }

    /// Silently drop every message of this type
    pub fn ignore(&self, key: impl Into<MessageTypeKey>) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), Handler::Noop);
    }

    /// Whether messages of this type are dropped silently
    pub fn is_muted(&self, key: &MessageTypeKey) -> bool {
        matches!(
            self.handlers
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(key),
            Some(Handler::Noop)
        )
    }

    /// Whether any entry, handler or mute, exists for this type
    pub fn is_registered(&self, key: &MessageTypeKey) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    /// Route one envelope to its handler
    pub fn dispatch(&self, envelope: &InboundEnvelope<M>) {
        let key = envelope.type_key();
        let found = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned();

        let handler = match found {
            Some(handler) => handler,
            None => match self.mute_unknown(&key) {
                Some(handler) => handler,
                None => {
                    warn!(
                        message_type = %key,
                        link = %envelope.link_name,
                        correlation_id = ?envelope.correlation_id,
                        "Unhandled message type {} on link {}", key, envelope.link_name
                    );
                    return;
                }
            },
        };

        if let Handler::Call(f) = handler {
            let correlation_id = envelope.correlation_id.as_deref();
            if let Err(e) = f(&envelope.message, envelope.link_name.as_ref(), correlation_id) {
                error!(
                    message_type = %key,
                    link = %envelope.link_name,
                    "Error while handling {} message: {}", key, e
                );
            }
        }
    }

    /// Insert a no-op entry for `key` unless one appeared concurrently
    ///
    /// Returns the entry that won the race, or `None` if this call inserted
    /// the no-op and is responsible for reporting the type.
    fn mute_unknown(&self, key: &MessageTypeKey) -> Option<Handler<M>> {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        match handlers.entry(key.clone()) {
            Entry::Occupied(entry) => Some(entry.get().clone()),
            Entry::Vacant(entry) => {
                entry.insert(Handler::Noop);
                None
            }
        }
    }

    /// Dispatch envelopes until the stream closes
    pub async fn run(&self, mut inbound: mpsc::Receiver<InboundEnvelope<M>>) {
        while let Some(envelope) = inbound.recv().await {
            self.dispatch(&envelope);
        }
        debug!("Inbound stream closed, dispatcher stopping");
    }
}

impl<M: DecodedMessage> Default for Dispatcher<M> {
    fn default() -> Self {
        Self::new()
    }
}

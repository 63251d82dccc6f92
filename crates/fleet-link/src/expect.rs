//! Pending expectations for inbound messages
//!
//! A caller that is about to send a request registers what the reply looks
//! like: its message type, optionally the correlation id of the sender, and
//! a predicate on the message. Inbound envelopes are offered to the
//! expectations before they reach the dispatch table, and each expectation
//! resolves with the first message that matches it.
//!
//! Dropping an [`Expectation`] withdraws it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use fleet_protocol::{DecodedMessage, MessageTypeKey};
use tokio::sync::oneshot;
use tracing::trace;

use crate::envelope::InboundEnvelope;

type Predicate<M> = Box<dyn Fn(&M) -> bool + Send + Sync>;

struct Matcher<M> {
    id: u64,
    correlation_id: Option<String>,
    predicate: Predicate<M>,
    reply: oneshot::Sender<M>,
}

struct Registry<M> {
    next_id: u64,
    matchers: HashMap<MessageTypeKey, Vec<Matcher<M>>>,
}

impl<M> Registry<M> {
    fn withdraw(&mut self, key: &MessageTypeKey, id: u64) {
        if let Some(matchers) = self.matchers.get_mut(key) {
            matchers.retain(|m| m.id != id);
            if matchers.is_empty() {
                self.matchers.remove(key);
            }
        }
    }
}

/// Registry of messages that callers are waiting for
pub struct Expectations<M> {
    registry: Arc<Mutex<Registry<M>>>,
}

impl<M: DecodedMessage + Clone> Expectations<M> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                matchers: HashMap::new(),
            })),
        }
    }

    /// Wait for the next message of type `key` accepted by `predicate`
    ///
    /// With a `correlation_id`, only messages from that sender match. The
    /// predicate runs on the dispatch path and must not block.
    pub fn expect<F>(
        &self,
        key: impl Into<MessageTypeKey>,
        correlation_id: Option<&str>,
        predicate: F,
    ) -> Expectation<M>
    where
        F: Fn(&M) -> bool + Send + Sync + 'static,
    {
        let key = key.into();
        let (reply, response) = oneshot::channel();
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        let id = registry.next_id;
        registry.next_id += 1;
        registry.matchers.entry(key.clone()).or_default().push(Matcher {
            id,
            correlation_id: correlation_id.map(str::to_string),
            predicate: Box::new(predicate),
            reply,
        });

        Expectation {
            registry: Arc::downgrade(&self.registry),
            key,
            id,
            response,
        }
    }

    /// Hand `envelope` to every expectation it satisfies
    ///
    /// Returns the number of expectations resolved.
    pub fn resolve(&self, envelope: &InboundEnvelope<M>) -> usize {
        let key = envelope.type_key();
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(matchers) = registry.matchers.get_mut(&key) else {
            return 0;
        };

        let mut resolved = 0;
        let mut waiting = Vec::with_capacity(matchers.len());
        for matcher in matchers.drain(..) {
            let sender_matches = matcher.correlation_id.is_none()
                || matcher.correlation_id == envelope.correlation_id;
            if sender_matches && (matcher.predicate)(&envelope.message) {
                // A receiver that already gave up is not an error
                let _ = matcher.reply.send(envelope.message.clone());
                resolved += 1;
            } else {
                waiting.push(matcher);
            }
        }

        *matchers = waiting;
        if matchers.is_empty() {
            registry.matchers.remove(&key);
        }
        if resolved > 0 {
            trace!(message_type = %key, link = %envelope.link_name, "Resolved {} expectation(s)", resolved);
        }
        resolved
    }

    /// Number of expectations still waiting
    pub fn pending(&self) -> usize {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .matchers
            .values()
            .map(Vec::len)
            .sum()
    }

    /// Abandon every waiting expectation
    pub fn cancel_all(&self) {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .matchers
            .clear();
    }
}

impl<M: DecodedMessage + Clone> Default for Expectations<M> {
    fn default() -> Self {
        Self::new()
    }
}

/// A registered wait for one inbound message
pub struct Expectation<M> {
    registry: Weak<Mutex<Registry<M>>>,
    key: MessageTypeKey,
    id: u64,
    response: oneshot::Receiver<M>,
}

impl<M> Expectation<M> {
    /// Type of the message this expectation waits for
    pub fn key(&self) -> &MessageTypeKey {
        &self.key
    }

    /// Wait for the matching message
    ///
    /// Returns `None` if the expectation was abandoned before a match.
    pub async fn wait(mut self) -> Option<M> {
        (&mut self.response).await.ok()
    }
}

impl<M> Drop for Expectation<M> {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .withdraw(&self.key, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Msg {
        kind: &'static str,
        sender: &'static str,
        value: u8,
    }

    impl DecodedMessage for Msg {
        fn type_key(&self) -> MessageTypeKey {
            MessageTypeKey::from_static(self.kind)
        }

        fn correlation_id(&self) -> Option<String> {
            Some(self.sender.to_string())
        }
    }

    fn envelope(kind: &'static str, sender: &'static str, value: u8) -> InboundEnvelope<Msg> {
        InboundEnvelope::new(Arc::from("radio"), Msg { kind, sender, value })
    }

    #[tokio::test]
    async fn test_first_match_resolves() {
        let expectations = Expectations::new();
        let ack = expectations.expect("COMMAND_ACK", Some("3"), |m: &Msg| m.value == 1);
        assert_eq!(expectations.pending(), 1);

        // Wrong type, wrong sender, rejected by the predicate
        assert_eq!(expectations.resolve(&envelope("HEARTBEAT", "3", 1)), 0);
        assert_eq!(expectations.resolve(&envelope("COMMAND_ACK", "4", 1)), 0);
        assert_eq!(expectations.resolve(&envelope("COMMAND_ACK", "3", 0)), 0);

        assert_eq!(expectations.resolve(&envelope("COMMAND_ACK", "3", 1)), 1);
        assert_eq!(expectations.pending(), 0);
        let reply = ack.wait().await.unwrap();
        assert_eq!(reply.value, 1);
    }

    #[tokio::test]
    async fn test_any_sender() {
        let expectations = Expectations::new();
        let first = expectations.expect("PING", None, |_: &Msg| true);
        let second = expectations.expect("PING", None, |_: &Msg| true);

        assert_eq!(expectations.resolve(&envelope("PING", "9", 5)), 2);
        assert_eq!(first.wait().await.unwrap().sender, "9");
        assert_eq!(second.wait().await.unwrap().value, 5);
    }

    #[test]
    fn test_drop_withdraws() {
        let expectations = Expectations::new();
        let keep = expectations.expect("PING", None, |_: &Msg| true);
        drop(expectations.expect("PING", None, |_: &Msg| true));
        assert_eq!(expectations.pending(), 1);
        drop(keep);
        assert_eq!(expectations.pending(), 0);
    }

    #[tokio::test]
    async fn test_cancel_all_abandons_waiters() {
        let expectations = Expectations::new();
        let ack = expectations.expect("COMMAND_ACK", None, |_: &Msg| true);
        expectations.cancel_all();
        assert!(ack.wait().await.is_none());
    }
}

//! Communication manager
//!
//! Owns a set of named links that all speak the same protocol, runs one
//! supervised task per link and merges everything they decode into a single
//! inbound stream. The first link registered is the primary link; outbound
//! messages always go there.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use fleet_connect::Connection;
use fleet_protocol::CodecFactory;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::envelope::InboundEnvelope;
use crate::error::LinkError;
use crate::link::{Link, LinkRole};
use crate::supervisor::{Supervisor, TaskFactory, TaskFuture};

/// Default capacity of the inbound stream
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Receiving end of the merged inbound stream
pub type InboundReceiver<M> = mpsc::Receiver<InboundEnvelope<M>>;

/// Multiplexes several links speaking the protocol of `C`
pub struct CommunicationManager<C: CodecFactory> {
    codec: Arc<C>,
    links: RwLock<Vec<Arc<Link<C>>>>,
    running: AtomicBool,
    queue_capacity: usize,
}

/// Clears the running flag when `run` returns or is dropped
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<C: CodecFactory> CommunicationManager<C> {
    /// Create a manager without any links
    pub fn new(codec: C) -> Self {
        Self {
            codec: Arc::new(codec),
            links: RwLock::new(Vec::new()),
            running: AtomicBool::new(false),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    /// Set the capacity of the inbound stream
    ///
    /// Link tasks wait when the stream is full, so a slow consumer slows
    /// down reading instead of growing memory.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    fn snapshot(&self) -> Vec<Arc<Link<C>>> {
        self.links
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Register a connection under a unique name
    ///
    /// The first registered link becomes the primary link.
    pub fn add(&self, connection: Box<dyn Connection>, name: &str) -> Result<(), LinkError> {
        let mut links = self.links.write().unwrap_or_else(PoisonError::into_inner);
        if self.running.load(Ordering::Acquire) {
            return Err(LinkError::AlreadyRunning);
        }
        if links.iter().any(|link| link.name() == name) {
            return Err(LinkError::DuplicateLink(name.to_string()));
        }

        let role = if links.is_empty() {
            LinkRole::Primary
        } else {
            LinkRole::Secondary
        };
        debug!(link = %name, "Registering {:?} link for {}", role, connection.spec());
        links.push(Arc::new(Link::new(
            name,
            role,
            connection,
            self.codec.create_encoder(),
        )));
        Ok(())
    }

    /// Names of all links in registration order
    pub fn link_names(&self) -> Vec<String> {
        self.snapshot()
            .iter()
            .map(|link| link.name().to_string())
            .collect()
    }

    /// Name of the primary link, if any link is registered
    pub fn primary_link_name(&self) -> Option<String> {
        self.primary().map(|link| link.name().to_string())
    }

    /// Whether the named link currently has an open connection
    pub fn is_connected(&self, name: &str) -> bool {
        self.snapshot()
            .iter()
            .any(|link| link.name() == name && link.is_connected())
    }

    fn primary(&self) -> Option<Arc<Link<C>>> {
        self.links
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|link| link.role() == LinkRole::Primary)
            .cloned()
    }

    /// Send a message over the primary link
    pub async fn send(&self, message: &C::Outbound) -> Result<(), LinkError> {
        let link = self.primary().ok_or(LinkError::NoPrimaryLink)?;
        link.send(message).await
    }

    /// Run all links and the inbound consumer until they end
    ///
    /// Every link runs under `supervisor`. Cancelling `cancel` (or dropping
    /// the returned future) stops all tasks and closes every connection.
    /// The first failure that the supervisor propagates stops the remaining
    /// tasks and is returned.
    pub async fn run<F, Fut, S>(
        &self,
        consumer: F,
        supervisor: &S,
        cancel: CancellationToken,
    ) -> Result<(), LinkError>
    where
        F: FnOnce(InboundReceiver<C::Inbound>) -> Fut + Send,
        Fut: Future<Output = ()> + Send + 'static,
        S: Supervisor + ?Sized,
    {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(LinkError::AlreadyRunning);
        }
        let _running = RunningGuard(&self.running);

        let links = self.snapshot();
        let token = cancel.child_token();
        let (inbound_tx, inbound_rx) = mpsc::channel(self.queue_capacity);
        let mut tasks = JoinSet::new();

        info!("Starting communication manager with {} link(s)", links.len());

        for link in links {
            let name = link.name().to_string();
            let codec = self.codec.clone();
            let inbound = inbound_tx.clone();
            let factory: TaskFactory = Box::new(move || -> TaskFuture {
                Box::pin(link.clone().run_once(codec.clone(), inbound.clone()))
            });
            let supervised = supervisor.supervise(&name, factory);
            let token = token.clone();

            tasks.spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => Ok(()),
                    result = supervised => {
                        result.map_err(|failure| LinkError::Failure { link: name, failure })
                    }
                }
            });
        }
        // The consumer sees the end of the stream once every link task is gone
        drop(inbound_tx);

        let consume = consumer(inbound_rx);
        let consumer_token = token.clone();
        tasks.spawn(async move {
            tokio::select! {
                _ = consumer_token.cancelled() => {}
                _ = consume => {}
            }
            Ok(())
        });

        let mut outcome = Ok(());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("{}", e);
                    outcome = Err(e);
                    break;
                }
                Err(e) if e.is_panic() => error!("Communication task panicked: {}", e),
                Err(_) => {}
            }
        }

        token.cancel();
        tasks.shutdown().await;
        info!("Communication manager stopped");
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_connect::MemoryConnection;
    use fleet_protocol::mavlink::{heartbeat, MavlinkCodec};

    fn memory(spec: &str) -> Box<dyn Connection> {
        Box::new(MemoryConnection::new(spec))
    }

    #[test]
    fn test_first_link_is_primary() {
        let manager = CommunicationManager::new(MavlinkCodec::default());
        manager.add(memory("mem:radio"), "radio").unwrap();
        manager.add(memory("mem:wifi"), "wifi").unwrap();
        assert_eq!(manager.primary_link_name().as_deref(), Some("radio"));
        assert_eq!(manager.link_names(), vec!["radio", "wifi"]);
    }

    #[test]
    fn test_duplicate_link_name() {
        let manager = CommunicationManager::new(MavlinkCodec::default());
        manager.add(memory("mem:a"), "radio").unwrap();
        assert!(matches!(
            manager.add(memory("mem:b"), "radio"),
            Err(LinkError::DuplicateLink(name)) if name == "radio"
        ));
    }

    #[tokio::test]
    async fn test_send_without_links() {
        let manager = CommunicationManager::new(MavlinkCodec::default());
        assert!(matches!(
            manager.send(&heartbeat()).await,
            Err(LinkError::NoPrimaryLink)
        ));
    }

    #[tokio::test]
    async fn test_send_before_connected() {
        let manager = CommunicationManager::new(MavlinkCodec::default());
        manager.add(memory("mem:a"), "radio").unwrap();
        assert!(!manager.is_connected("radio"));
        assert!(matches!(
            manager.send(&heartbeat()).await,
            Err(LinkError::LinkNotConnected(name)) if name == "radio"
        ));
    }
}

//! Distribution of RTK corrections to the fleet
//!
//! Every accepted correction packet is split into `GPS_RTCM_DATA` messages
//! and sent over the primary link of every MAVLink network. Each network is
//! fed from its own queue, so a stalled link only loses its own corrections.

use std::sync::Arc;

use fleet_connect::ConnectionFactory;
use fleet_link::Supervisor;
use fleet_protocol::mavlink::{MavlinkMessage, RtcmDataFragmenter};
use fleet_rtk::{run_preset, CorrectionPacket, PresetRegistry};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::network::MavlinkNetwork;

/// Capacity of the queue between correction pipelines and the bridge
pub const CORRECTION_QUEUE_SIZE: usize = 64;

type Fragments = Arc<Vec<MavlinkMessage>>;

/// Queue of corrections waiting for one network
struct Outlet {
    network: String,
    queue: mpsc::Sender<Fragments>,
    /// Set while the queue is full, so the overflow is reported once
    overflowing: bool,
}

/// Forwards corrections to MAVLink networks
pub struct RtkBridge {
    outlets: Vec<Outlet>,
    fragmenter: RtcmDataFragmenter,
}

impl RtkBridge {
    /// Create the bridge and spawn one sender task per network
    ///
    /// Must be called within a tokio runtime. The sender tasks stop when the
    /// bridge is dropped.
    pub fn new(networks: Vec<Arc<MavlinkNetwork>>) -> Self {
        let outlets = networks
            .into_iter()
            .map(|network| {
                let (queue, pending) = mpsc::channel(CORRECTION_QUEUE_SIZE);
                let name = network.name().to_string();
                tokio::spawn(send_corrections(network, pending));
                Outlet {
                    network: name,
                    queue,
                    overflowing: false,
                }
            })
            .collect();
        Self {
            outlets,
            fragmenter: RtcmDataFragmenter::new(),
        }
    }

    /// Queue one correction packet for every network
    ///
    /// Never waits for a network. A network whose queue is full misses the
    /// correction.
    pub fn forward(&mut self, correction: &CorrectionPacket) {
        let messages = match self.fragmenter.fragment(&correction.bytes) {
            Ok(messages) => Arc::new(messages),
            Err(e) => {
                warn!(preset = %correction.preset_id, "Dropping correction: {}", e);
                return;
            }
        };

        for outlet in &mut self.outlets {
            match outlet.queue.try_send(messages.clone()) {
                Ok(()) => {
                    if outlet.overflowing {
                        debug!(network = %outlet.network, "Correction queue drained");
                        outlet.overflowing = false;
                    }
                }
                Err(TrySendError::Full(_)) => {
                    if !outlet.overflowing {
                        warn!(
                            network = %outlet.network,
                            "Network is not keeping up, dropping RTK corrections"
                        );
                        outlet.overflowing = true;
                    }
                }
                Err(TrySendError::Closed(_)) => {
                    trace!(network = %outlet.network, "Correction sender stopped");
                }
            }
        }
        trace!(
            preset = %correction.preset_id,
            "Queued {} byte correction in {} message(s)",
            correction.bytes.len(),
            messages.len()
        );
    }

    /// Forward corrections until every pipeline has stopped
    pub async fn run(mut self, mut corrections: mpsc::Receiver<CorrectionPacket>) {
        while let Some(correction) = corrections.recv().await {
            self.forward(&correction);
        }
        debug!("All correction pipelines stopped");
    }
}

/// Send queued corrections over the primary link of `network`
async fn send_corrections(network: Arc<MavlinkNetwork>, mut pending: mpsc::Receiver<Fragments>) {
    while let Some(messages) = pending.recv().await {
        if !network.is_connected() {
            continue;
        }
        for message in messages.iter() {
            if let Err(e) = network.send(message).await {
                trace!(network = %network.name(), "Correction not sent: {}", e);
                break;
            }
        }
    }
}

/// Run every preset of `registry` and bridge the corrections to `networks`
pub async fn run_corrections<S>(
    registry: &PresetRegistry,
    networks: Vec<Arc<MavlinkNetwork>>,
    factory: Arc<dyn ConnectionFactory>,
    supervisor: S,
    cancel: CancellationToken,
) where
    S: Supervisor + Clone + 'static,
{
    let (sink, corrections) = mpsc::channel(CORRECTION_QUEUE_SIZE);
    let mut pipelines = JoinSet::new();
    for preset in registry.iter() {
        let preset = preset.clone();
        let factory = factory.clone();
        let supervisor = supervisor.clone();
        let sink = sink.clone();
        let cancel = cancel.clone();
        pipelines.spawn(async move {
            let id = preset.id().to_string();
            (id, run_preset(preset, factory, &supervisor, sink, cancel).await)
        });
    }
    drop(sink);

    let bridge = tokio::spawn(RtkBridge::new(networks).run(corrections));

    while let Some(joined) = pipelines.join_next().await {
        match joined {
            Ok((_, Ok(()))) => {}
            Ok((id, Err(e))) => error!(preset = %id, "RTK preset failed: {}", e),
            Err(e) if e.is_panic() => error!("RTK pipeline panicked: {}", e),
            Err(_) => {}
        }
    }
    if let Err(e) = bridge.await {
        error!("RTK bridge task failed: {}", e);
    }
}

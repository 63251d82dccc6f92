//! Correction pipeline for one preset
//!
//! Every source of the preset runs in its own supervised task: it opens the
//! connection, writes the preset's init bytes, parses the stream and drops
//! packets the preset does not accept. Accepted packets from all sources are
//! re-encoded by a single encoder stage and published to the sink.

use std::sync::Arc;

use fleet_connect::ConnectionFactory;
use fleet_link::{LinkFailure, Supervisor, TaskFactory, TaskFuture};
use fleet_protocol::rtcm::RtcmPacket;
use fleet_protocol::{DecodedMessage, Encoder, Parser};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::error::RtkError;
use crate::preset::RtkConfigurationPreset;

const READ_BUFFER_SIZE: usize = 4096;
const PACKET_QUEUE_SIZE: usize = 128;

/// An accepted correction packet, ready for distribution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrectionPacket {
    pub preset_id: Arc<str>,
    /// Connection spec of the source the packet came from
    pub source: Arc<str>,
    pub packet: RtcmPacket,
    /// Packet re-encoded in the preset's output format
    pub bytes: Vec<u8>,
}

type SourcedPacket = (Arc<str>, RtcmPacket);

/// Run the correction pipeline of `preset` until cancelled
///
/// Returns when every source has ended, when the sink is closed, when
/// `cancel` is cancelled, or with the first source failure that the
/// supervisor propagates.
pub async fn run_preset<S>(
    preset: Arc<RtkConfigurationPreset>,
    factory: Arc<dyn ConnectionFactory>,
    supervisor: &S,
    sink: mpsc::Sender<CorrectionPacket>,
    cancel: CancellationToken,
) -> Result<(), RtkError>
where
    S: Supervisor + ?Sized,
{
    let token = cancel.child_token();
    let preset_id: Arc<str> = Arc::from(preset.id());
    let (packet_tx, packet_rx) = mpsc::channel(PACKET_QUEUE_SIZE);
    let mut tasks = JoinSet::new();

    info!(preset = %preset_id, "Starting RTK preset with {} source(s)", preset.sources().len());

    for source in preset.sources() {
        let source: Arc<str> = Arc::from(source.as_str());
        let task: TaskFactory = {
            let preset = preset.clone();
            let factory = factory.clone();
            let source = source.clone();
            let packets = packet_tx.clone();
            Box::new(move || -> TaskFuture {
                Box::pin(read_source(
                    preset.clone(),
                    factory.clone(),
                    source.clone(),
                    packets.clone(),
                ))
            })
        };
        let supervised = supervisor.supervise(&format!("{}/{}", preset_id, source), task);
        let token = token.clone();

        tasks.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => Ok(()),
                result = supervised => result.map_err(|failure| RtkError::Source {
                    spec: source.to_string(),
                    failure,
                }),
            }
        });
    }
    drop(packet_tx);

    let encoder = encode_packets(
        preset_id.clone(),
        preset.create_encoder(),
        packet_rx,
        sink,
        token.clone(),
    );
    let encoder_token = token.clone();
    tasks.spawn(async move {
        tokio::select! {
            _ = encoder_token.cancelled() => {}
            _ = encoder => {}
        }
        Ok(())
    });

    let mut outcome = Ok(());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            // The encoder stage is gone, which already ends the pipeline
            Ok(Err(RtkError::Source {
                failure: LinkFailure::InboundClosed,
                ..
            })) => {}
            Ok(Err(e)) => {
                error!(preset = %preset_id, "{}", e);
                outcome = Err(e);
                break;
            }
            Err(e) if e.is_panic() => error!(preset = %preset_id, "RTK task panicked: {}", e),
            Err(_) => {}
        }
    }

    token.cancel();
    tasks.shutdown().await;
    info!(preset = %preset_id, "RTK preset stopped");
    outcome
}

/// One connection attempt to a correction source
async fn read_source(
    preset: Arc<RtkConfigurationPreset>,
    factory: Arc<dyn ConnectionFactory>,
    source: Arc<str>,
    packets: mpsc::Sender<SourcedPacket>,
) -> Result<(), LinkFailure> {
    let connection = factory.create(&source)?;
    let mut io = connection.open().await?;

    if let Some(init) = preset.init() {
        io.writer.write_all(init).await?;
        io.writer.flush().await?;
        debug!(preset = %preset.id(), source = %source, "Sent {} init bytes", init.len());
    }
    info!(preset = %preset.id(), source = %source, "Correction source connected");

    let mut parser = preset.create_parser();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = io.reader.read(&mut buffer).await?;
        if n == 0 {
            return Err(LinkFailure::Closed);
        }

        for packet in parser.parse(&buffer[..n]) {
            if !preset.accepts(&packet) {
                trace!(preset = %preset.id(), "Filtered {}", packet.type_key());
                continue;
            }
            packets
                .send((source.clone(), packet))
                .await
                .map_err(|_| LinkFailure::InboundClosed)?;
        }
    }
}

/// Re-encode packets from all sources and publish them
async fn encode_packets<E>(
    preset_id: Arc<str>,
    mut encoder: E,
    mut packets: mpsc::Receiver<SourcedPacket>,
    sink: mpsc::Sender<CorrectionPacket>,
    token: CancellationToken,
) where
    E: Encoder<Item = RtcmPacket>,
{
    let mut mismatch_reported = false;
    while let Some((source, packet)) = packets.recv().await {
        let bytes = match encoder.encode(&packet) {
            Ok(bytes) => bytes,
            Err(e) => {
                if !mismatch_reported {
                    warn!(preset = %preset_id, "Cannot re-encode {}: {}", packet.type_key(), e);
                    mismatch_reported = true;
                }
                continue;
            }
        };

        let correction = CorrectionPacket {
            preset_id: preset_id.clone(),
            source,
            packet,
            bytes,
        };
        if sink.send(correction).await.is_err() {
            debug!(preset = %preset_id, "Correction sink closed");
            token.cancel();
            return;
        }
    }
}

//! MAVLink networks
//!
//! A network bundles the links to one fleet with its dispatch table, the
//! replies that callers are waiting for, and the ground station heartbeat.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use fleet_connect::{Connection, ConnectionFactory};
use fleet_link::{
    CommunicationManager, Dispatcher, Expectations, HandlerResult, LinkError, Supervisor,
};
use fleet_protocol::mavlink::{
    decode_statustext, heartbeat, MavlinkCodec, MavlinkFrame, MavlinkMessage, MavlinkPacket,
    GCS_COMPONENT_ID,
};
use fleet_protocol::MessageTypeKey;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::NetworkSettings;

/// Message types that are expected on the network but not processed
const MUTED_MESSAGES: &[&str] = &[
    "AUTOPILOT_VERSION",
    "COMMAND_ACK",
    "DATA16",
    "FILE_TRANSFER_PROTOCOL",
    "GLOBAL_POSITION_INT",
    "GPS_GLOBAL_ORIGIN",
    "GPS_RAW_INT",
    "HOME_POSITION",
    "HWSTATUS",
    "LOCAL_POSITION_NED",
    "MAG_CAL_PROGRESS",
    "MAG_CAL_REPORT",
    "MEMINFO",
    "MISSION_ACK",
    "MISSION_COUNT",
    "MISSION_CURRENT",
    "MISSION_ITEM_INT",
    "MISSION_REQUEST",
    "NAV_CONTROLLER_OUTPUT",
    "PARAM_VALUE",
    "POSITION_TARGET_GLOBAL_INT",
    "POWER_STATUS",
    "SYS_STATUS",
    "TIMESYNC",
    "V2_EXTENSION",
];

/// Links to one fleet plus the dispatch table for their traffic
pub struct MavlinkNetwork {
    name: String,
    manager: CommunicationManager<MavlinkCodec>,
    dispatcher: Arc<Dispatcher<MavlinkPacket>>,
    expectations: Arc<Expectations<MavlinkPacket>>,
    heartbeat_interval: Duration,
}

impl MavlinkNetwork {
    /// Create a network without links
    pub fn new(name: impl Into<String>, codec: MavlinkCodec, heartbeat_interval: Duration) -> Self {
        Self {
            name: name.into(),
            manager: CommunicationManager::new(codec),
            dispatcher: Arc::new(create_dispatcher()),
            expectations: Arc::new(Expectations::new()),
            heartbeat_interval,
        }
    }

    /// Create a network and its links from settings
    ///
    /// Links are named `<network>/<index>` in configuration order.
    pub fn from_settings(
        name: &str,
        settings: &NetworkSettings,
        factory: &dyn ConnectionFactory,
    ) -> anyhow::Result<Self> {
        let codec = MavlinkCodec {
            version: settings.version,
            system_id: settings.system_id,
            component_id: GCS_COMPONENT_ID,
        };
        let network = Self::new(name, codec, settings.heartbeat_interval());
        for (index, spec) in settings.connections.iter().enumerate() {
            let connection = factory
                .create(spec)
                .with_context(|| format!("Invalid connection {:?}", spec))?;
            network.add_connection(connection, &format!("{}/{}", name, index))?;
        }
        Ok(network)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_connection(&self, connection: Box<dyn Connection>, link: &str) -> Result<(), LinkError> {
        self.manager.add(connection, link)
    }

    /// Whether the primary link currently has an open connection
    pub fn is_connected(&self) -> bool {
        self.manager
            .primary_link_name()
            .is_some_and(|link| self.manager.is_connected(&link))
    }

    /// Send a message over the network's primary link
    pub async fn send(&self, message: &MavlinkMessage) -> Result<(), LinkError> {
        self.manager.send(message).await
    }

    /// Send `message` and wait for a `reply` message from `system_id`
    ///
    /// Only replies accepted by `accept` count. The wait is registered before
    /// the message goes out, so a reply cannot overtake it.
    pub async fn send_and_wait<F>(
        &self,
        message: &MavlinkMessage,
        reply: &str,
        system_id: u8,
        accept: F,
        timeout: Duration,
    ) -> Result<MavlinkFrame, LinkError>
    where
        F: Fn(&MavlinkFrame) -> bool + Send + Sync + 'static,
    {
        let key = MessageTypeKey::new(reply);
        let expectation = self.expectations.expect(
            key.clone(),
            Some(&system_id.to_string()),
            move |packet: &MavlinkPacket| match packet {
                MavlinkPacket::Frame(frame) => accept(frame),
                MavlinkPacket::BadData { .. } => false,
            },
        );
        self.send(message).await?;

        match tokio::time::timeout(timeout, expectation.wait()).await {
            Ok(Some(MavlinkPacket::Frame(frame))) => Ok(frame),
            Ok(_) => Err(LinkError::ResponseAbandoned(key)),
            Err(_) => Err(LinkError::ResponseTimeout(key)),
        }
    }

    /// Run links, dispatch and heartbeat until cancelled
    pub async fn run<S>(&self, supervisor: &S, cancel: CancellationToken) -> Result<(), LinkError>
    where
        S: Supervisor + ?Sized,
    {
        info!(network = %self.name, "Starting MAVLink network");
        let dispatcher = self.dispatcher.clone();
        let expectations = self.expectations.clone();
        let heartbeat_token = cancel.child_token();

        let links = async {
            let result = self
                .manager
                .run(
                    move |mut inbound| async move {
                        while let Some(envelope) = inbound.recv().await {
                            expectations.resolve(&envelope);
                            dispatcher.dispatch(&envelope);
                        }
                    },
                    supervisor,
                    cancel,
                )
                .await;
            heartbeat_token.cancel();
            self.expectations.cancel_all();
            result
        };
        let (result, ()) = tokio::join!(links, self.send_heartbeats(heartbeat_token.clone()));

        info!(network = %self.name, "MAVLink network stopped");
        result
    }

    async fn send_heartbeats(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.heartbeat_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let message = heartbeat();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = interval.tick() => {
                    if let Err(e) = self.send(&message).await {
                        trace!(network = %self.name, "Heartbeat not sent: {}", e);
                    }
                }
            }
        }
    }
}

/// Dispatch table shared by all MAVLink networks
pub fn create_dispatcher() -> Dispatcher<MavlinkPacket> {
    let dispatcher = Dispatcher::new();
    for name in MUTED_MESSAGES {
        dispatcher.ignore(*name);
    }
    dispatcher.register("HEARTBEAT", log_heartbeat);
    dispatcher.register("STATUSTEXT", log_statustext);
    dispatcher
}

fn log_heartbeat(packet: &MavlinkPacket, link: &str, system_id: Option<&str>) -> HandlerResult {
    if let MavlinkPacket::Frame(frame) = packet {
        debug!(
            link = %link,
            system_id = system_id.unwrap_or("?"),
            "Heartbeat from component {}", frame.component_id
        );
    }
    Ok(())
}

/// Forward a status message to the log at its MAV_SEVERITY
fn log_statustext(packet: &MavlinkPacket, link: &str, system_id: Option<&str>) -> HandlerResult {
    let MavlinkPacket::Frame(frame) = packet else {
        return Ok(());
    };
    let status = decode_statustext(frame).ok_or("not a STATUSTEXT frame")?;
    if status.text.is_empty() {
        return Ok(());
    }

    let system_id = system_id.unwrap_or("?");
    match status.severity {
        0..=3 => error!(link = %link, system_id, "{}", status.text),
        4 => warn!(link = %link, system_id, "{}", status.text),
        5 | 6 => info!(link = %link, system_id, "{}", status.text),
        _ => debug!(link = %link, system_id, "{}", status.text),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_connect::MemoryConnection;
    use fleet_link::StopOnFailure;
    use fleet_protocol::mavlink::{ids, MavlinkEncoder, MavlinkParser, MavlinkVersion};
    use fleet_protocol::{Encoder, Parser};
    use tokio::io::AsyncReadExt;

    fn statustext(severity: u8, text: &str) -> MavlinkPacket {
        let mut payload = vec![severity];
        payload.extend_from_slice(text.as_bytes());
        payload.resize(51, 0);
        let bytes = MavlinkEncoder::new(MavlinkVersion::V2, 1, 1)
            .encode(&MavlinkMessage::new(ids::STATUSTEXT, payload))
            .unwrap();
        MavlinkParser::new().parse(&bytes).next().unwrap()
    }

    #[test]
    fn test_dispatcher_mutes_known_types() {
        let dispatcher = create_dispatcher();
        assert!(dispatcher.is_muted(&MessageTypeKey::BAD_DATA));
        assert!(dispatcher.is_muted(&MessageTypeKey::from_static("PARAM_VALUE")));
        assert!(!dispatcher.is_muted(&MessageTypeKey::from_static("STATUSTEXT")));
        assert!(dispatcher.is_registered(&MessageTypeKey::from_static("HEARTBEAT")));
        assert!(!dispatcher.is_registered(&MessageTypeKey::from_static("ATTITUDE")));
    }

    #[test]
    fn test_statustext_handler() {
        for severity in 0..8 {
            assert!(log_statustext(&statustext(severity, "PreArm: GPS"), "mav/0", Some("1")).is_ok());
        }
        assert!(log_statustext(&statustext(6, ""), "mav/0", None).is_ok());
    }

    #[test]
    fn test_from_settings_rejects_bad_spec() {
        let settings = NetworkSettings {
            connections: vec!["carrier-pigeon:coop".to_string()],
            system_id: 255,
            version: MavlinkVersion::V2,
            heartbeat_interval_ms: 1000,
        };
        let result = MavlinkNetwork::from_settings("mav", &settings, &fleet_connect::DefaultConnectionFactory);
        assert!(result.is_err());
    }

    /// Vehicle with `system_id` answering every COMMAND_LONG with a
    /// COMMAND_ACK for command 400, preceded by an ack from another vehicle
    async fn acknowledge_commands(mut remote: tokio::io::DuplexStream, system_id: u8) {
        use tokio::io::AsyncWriteExt;

        let mut parser = MavlinkParser::new();
        let mut own = MavlinkEncoder::new(MavlinkVersion::V2, system_id, 1);
        let mut other = MavlinkEncoder::new(MavlinkVersion::V2, system_id + 1, 1);
        let ack = MavlinkMessage::new(ids::COMMAND_ACK, vec![0x90, 0x01, 0]);
        let mut buf = [0u8; 512];
        loop {
            let Ok(n) = remote.read(&mut buf).await else { return };
            if n == 0 {
                return;
            }
            let commands = parser
                .parse(&buf[..n])
                .filter(|p| matches!(p, MavlinkPacket::Frame(f) if f.message_id == ids::COMMAND_LONG))
                .count();
            for _ in 0..commands {
                let mut reply = other.encode(&ack).unwrap();
                reply.extend(own.encode(&ack).unwrap());
                if remote.write_all(&reply).await.is_err() {
                    return;
                }
            }
        }
    }

    type Running = (
        Arc<MavlinkNetwork>,
        tokio::io::DuplexStream,
        CancellationToken,
        tokio::task::JoinHandle<Result<(), LinkError>>,
    );

    async fn running_network(interval: Duration) -> Running {
        let network = Arc::new(MavlinkNetwork::new("mav", MavlinkCodec::default(), interval));
        let (conn, remote) = MemoryConnection::pair("mem:radio");
        network.add_connection(Box::new(conn), "mav/0").unwrap();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let network = network.clone();
            let cancel = cancel.clone();
            async move { network.run(&StopOnFailure, cancel).await }
        });
        for _ in 0..200 {
            if network.is_connected() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(network.is_connected());
        (network, remote, cancel, handle)
    }

    fn command_long() -> MavlinkMessage {
        MavlinkMessage::new(ids::COMMAND_LONG, vec![0; 33])
    }

    #[tokio::test]
    async fn test_send_and_wait_returns_reply_of_target() {
        let (network, remote, cancel, handle) = running_network(Duration::from_secs(3600)).await;
        tokio::spawn(acknowledge_commands(remote, 3));

        let reply = network
            .send_and_wait(
                &command_long(),
                "COMMAND_ACK",
                3,
                |frame| u16::from_le_bytes([frame.payload_byte(0), frame.payload_byte(1)]) == 400,
                Duration::from_secs(2),
            )
            .await
            .unwrap();
        assert_eq!(reply.system_id, 3);
        assert_eq!(reply.message_id, ids::COMMAND_ACK);

        cancel.cancel();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_send_and_wait_times_out() {
        let (network, _remote, cancel, handle) = running_network(Duration::from_secs(3600)).await;

        let result = network
            .send_and_wait(&command_long(), "COMMAND_ACK", 3, |_| true, Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(LinkError::ResponseTimeout(ref key)) if key.as_str() == "COMMAND_ACK"));
        assert_eq!(network.expectations.pending(), 0);

        cancel.cancel();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_send_and_wait_without_connection() {
        let network = MavlinkNetwork::new("mav", MavlinkCodec::default(), Duration::from_secs(1));
        network
            .add_connection(Box::new(MemoryConnection::new("mem:radio")), "mav/0")
            .unwrap();
        let result = network
            .send_and_wait(&command_long(), "COMMAND_ACK", 3, |_| true, Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(LinkError::LinkNotConnected(_))));
        assert_eq!(network.expectations.pending(), 0);
    }

    #[tokio::test]
    async fn test_heartbeat_reaches_primary_link() {
        let network = MavlinkNetwork::new("mav", MavlinkCodec::default(), Duration::from_millis(20));
        let (conn, mut remote) = MemoryConnection::pair("mem:radio");
        network.add_connection(Box::new(conn), "mav/0").unwrap();

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let receive = async move {
            let mut parser = MavlinkParser::new();
            let mut buf = [0u8; 256];
            loop {
                let n = remote.read(&mut buf).await.unwrap();
                assert!(n > 0);
                if let Some(MavlinkPacket::Frame(frame)) = parser.parse(&buf[..n]).next() {
                    assert_eq!(frame.message_id, ids::HEARTBEAT);
                    token.cancel();
                    return;
                }
            }
        };

        let (result, ()) = tokio::time::timeout(
            Duration::from_secs(2),
            async { tokio::join!(network.run(&StopOnFailure, cancel), receive) },
        )
        .await
        .unwrap();
        assert!(result.is_ok());
    }
}

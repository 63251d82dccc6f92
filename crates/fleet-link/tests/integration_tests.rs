//! Integration tests for the communication manager
//!
//! These tests drive complete managers over in-memory connections:
//! - Fan-in of several links with link provenance
//! - Outbound routing to the primary link
//! - Supervision policies (propagate, restart)
//! - Cancellation and the frozen link set
//! - Warn-once behavior of the dispatch table

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fleet_connect::MemoryConnection;
use fleet_link::{
    CommunicationManager, Dispatcher, InboundEnvelope, LinkError, LinkFailure, RestartWithBackoff,
    StopOnFailure, Supervisor,
};
use fleet_protocol::mavlink::{
    heartbeat, ids, MavlinkCodec, MavlinkEncoder, MavlinkMessage, MavlinkPacket, MavlinkParser,
    MavlinkVersion,
};
use fleet_protocol::{DecodedMessage, Encoder, MessageTypeKey, Parser};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Helper Functions
// ============================================================================

mod helpers {
    use super::*;

    pub type Manager = CommunicationManager<MavlinkCodec>;

    /// Run `manager` in the background, forwarding every envelope to the
    /// returned receiver
    pub fn spawn_manager<S>(
        manager: Arc<Manager>,
        supervisor: S,
        cancel: CancellationToken,
    ) -> (
        JoinHandle<Result<(), LinkError>>,
        mpsc::UnboundedReceiver<InboundEnvelope<MavlinkPacket>>,
    )
    where
        S: Supervisor + 'static,
    {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(async move {
            manager
                .run(
                    move |mut inbound| async move {
                        while let Some(envelope) = inbound.recv().await {
                            if out_tx.send(envelope).is_err() {
                                break;
                            }
                        }
                    },
                    &supervisor,
                    cancel,
                )
                .await
        });
        (handle, out_rx)
    }

    /// Wait until the named link reports an open connection
    pub async fn wait_connected(manager: &Manager, name: &str) {
        for _ in 0..200 {
            if manager.is_connected(name) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("link {} never connected", name);
    }

    /// Frames as a vehicle with `system_id` would send them
    pub fn vehicle_frames(system_id: u8, messages: &[MavlinkMessage]) -> Vec<u8> {
        let mut encoder = MavlinkEncoder::new(MavlinkVersion::V2, system_id, 1);
        messages
            .iter()
            .flat_map(|m| encoder.encode(m).unwrap())
            .collect()
    }

    pub async fn next_envelope(
        rx: &mut mpsc::UnboundedReceiver<InboundEnvelope<MavlinkPacket>>,
    ) -> InboundEnvelope<MavlinkPacket> {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for inbound message")
            .expect("inbound stream closed")
    }

    pub fn sequence(envelope: &InboundEnvelope<MavlinkPacket>) -> u8 {
        match &envelope.message {
            MavlinkPacket::Frame(frame) => frame.sequence,
            other => panic!("expected a frame, got {:?}", other),
        }
    }
}

// ============================================================================
// Inbound Tests
// ============================================================================

mod inbound_tests {
    use super::*;

    #[tokio::test]
    async fn envelopes_carry_link_name_and_sender() {
        let manager = Arc::new(helpers::Manager::new(MavlinkCodec::default()));
        let (radio, mut radio_remote) = MemoryConnection::pair("mem:radio");
        let (wifi, mut wifi_remote) = MemoryConnection::pair("mem:wifi");
        manager.add(Box::new(radio), "radio").unwrap();
        manager.add(Box::new(wifi), "wifi").unwrap();

        let cancel = CancellationToken::new();
        let (handle, mut rx) = helpers::spawn_manager(manager.clone(), StopOnFailure, cancel.clone());

        radio_remote
            .write_all(&helpers::vehicle_frames(1, &[heartbeat(), heartbeat(), heartbeat()]))
            .await
            .unwrap();
        wifi_remote
            .write_all(&helpers::vehicle_frames(2, &[heartbeat(), heartbeat()]))
            .await
            .unwrap();

        let mut radio_seq = Vec::new();
        let mut wifi_seq = Vec::new();
        for _ in 0..5 {
            let envelope = helpers::next_envelope(&mut rx).await;
            assert_eq!(envelope.type_key().as_str(), "HEARTBEAT");
            match &*envelope.link_name {
                "radio" => {
                    assert_eq!(envelope.correlation_id.as_deref(), Some("1"));
                    radio_seq.push(helpers::sequence(&envelope));
                }
                "wifi" => {
                    assert_eq!(envelope.correlation_id.as_deref(), Some("2"));
                    wifi_seq.push(helpers::sequence(&envelope));
                }
                other => panic!("unexpected link {}", other),
            }
        }

        // Per-link order is preserved
        assert_eq!(radio_seq, vec![0, 1, 2]);
        assert_eq!(wifi_seq, vec![0, 1]);

        cancel.cancel();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn frames_split_across_reads_are_reassembled() {
        let manager = Arc::new(helpers::Manager::new(MavlinkCodec::default()));
        let (radio, mut remote) = MemoryConnection::pair("mem:radio");
        manager.add(Box::new(radio), "radio").unwrap();

        let cancel = CancellationToken::new();
        let (_handle, mut rx) = helpers::spawn_manager(manager.clone(), StopOnFailure, cancel.clone());

        let bytes = helpers::vehicle_frames(3, &[heartbeat()]);
        let (head, tail) = bytes.split_at(7);
        remote.write_all(head).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        remote.write_all(tail).await.unwrap();

        let envelope = helpers::next_envelope(&mut rx).await;
        assert_eq!(envelope.type_key().as_str(), "HEARTBEAT");
        cancel.cancel();
    }

    #[tokio::test]
    async fn line_noise_becomes_bad_data() {
        let manager = Arc::new(helpers::Manager::new(MavlinkCodec::default()));
        let (radio, mut remote) = MemoryConnection::pair("mem:radio");
        manager.add(Box::new(radio), "radio").unwrap();

        let cancel = CancellationToken::new();
        let (_handle, mut rx) = helpers::spawn_manager(manager.clone(), StopOnFailure, cancel.clone());

        let mut bytes = b"garbage".to_vec();
        bytes.extend(helpers::vehicle_frames(1, &[heartbeat()]));
        remote.write_all(&bytes).await.unwrap();

        let first = helpers::next_envelope(&mut rx).await;
        let second = helpers::next_envelope(&mut rx).await;
        assert_eq!(first.type_key(), MessageTypeKey::BAD_DATA);
        assert_eq!(first.correlation_id, None);
        assert_eq!(second.type_key().as_str(), "HEARTBEAT");
        cancel.cancel();
    }
}

// ============================================================================
// Outbound Tests
// ============================================================================

mod outbound_tests {
    use super::*;

    #[tokio::test]
    async fn send_uses_primary_link_only() {
        let manager = Arc::new(helpers::Manager::new(MavlinkCodec::default()));
        let (radio, mut radio_remote) = MemoryConnection::pair("mem:radio");
        let (wifi, mut wifi_remote) = MemoryConnection::pair("mem:wifi");
        manager.add(Box::new(radio), "radio").unwrap();
        manager.add(Box::new(wifi), "wifi").unwrap();

        let cancel = CancellationToken::new();
        let (_handle, _rx) = helpers::spawn_manager(manager.clone(), StopOnFailure, cancel.clone());
        helpers::wait_connected(&manager, "radio").await;
        helpers::wait_connected(&manager, "wifi").await;

        manager.send(&heartbeat()).await.unwrap();

        let mut buf = [0u8; 64];
        let n = radio_remote.read(&mut buf).await.unwrap();
        let mut parser = MavlinkParser::new();
        let packets: Vec<_> = parser.parse(&buf[..n]).collect();
        assert_eq!(packets.len(), 1);
        match &packets[0] {
            MavlinkPacket::Frame(frame) => {
                assert_eq!(frame.message_id, ids::HEARTBEAT);
                assert_eq!(frame.system_id, 255);
            }
            other => panic!("expected a frame, got {:?}", other),
        }

        let nothing =
            tokio::time::timeout(Duration::from_millis(50), wifi_remote.read(&mut buf)).await;
        assert!(nothing.is_err(), "secondary link must not receive outbound traffic");
        cancel.cancel();
    }

    #[tokio::test]
    async fn unknown_outbound_message_is_an_encode_failure() {
        let manager = Arc::new(helpers::Manager::new(MavlinkCodec::default()));
        let (radio, _remote) = MemoryConnection::pair("mem:radio");
        manager.add(Box::new(radio), "radio").unwrap();

        let cancel = CancellationToken::new();
        let (_handle, _rx) = helpers::spawn_manager(manager.clone(), StopOnFailure, cancel.clone());
        helpers::wait_connected(&manager, "radio").await;

        let result = manager.send(&MavlinkMessage::new(50_000, vec![1])).await;
        assert!(matches!(
            result,
            Err(LinkError::Failure { failure: LinkFailure::Encode(_), .. })
        ));
        cancel.cancel();
    }

    /// Start two sends on a link whose remote never reads: the first one
    /// blocks in the write, the second one waits in the outbound queue
    async fn stalled_sends(
        manager: &Arc<helpers::Manager>,
    ) -> (
        JoinHandle<Result<(), LinkError>>,
        JoinHandle<Result<(), LinkError>>,
    ) {
        let first = tokio::spawn({
            let manager = manager.clone();
            async move { manager.send(&heartbeat()).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = tokio::spawn({
            let manager = manager.clone();
            async move { manager.send(&heartbeat()).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!first.is_finished());
        assert!(!second.is_finished());
        (first, second)
    }

    #[tokio::test]
    async fn queued_send_returns_when_link_closes() {
        let manager = Arc::new(helpers::Manager::new(MavlinkCodec::default()));
        let radio = MemoryConnection::with_capacity("mem:radio", 4);
        let remote = radio.attach();
        manager.add(Box::new(radio), "radio").unwrap();

        let (handle, _rx) =
            helpers::spawn_manager(manager.clone(), StopOnFailure, CancellationToken::new());
        helpers::wait_connected(&manager, "radio").await;

        let (first, second) = stalled_sends(&manager).await;
        drop(remote);

        let first = tokio::time::timeout(Duration::from_secs(2), first)
            .await
            .expect("blocked send never returned")
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(2), second)
            .await
            .expect("queued send never returned")
            .unwrap();
        assert!(first.is_err());
        assert!(matches!(second, Err(LinkError::LinkNotConnected(ref name)) if name == "radio"));

        assert!(handle.await.unwrap().is_err());
        assert!(!manager.is_connected("radio"));
    }

    #[tokio::test]
    async fn queued_send_returns_on_cancellation() {
        let manager = Arc::new(helpers::Manager::new(MavlinkCodec::default()));
        let radio = MemoryConnection::with_capacity("mem:radio", 4);
        let _remote = radio.attach();
        manager.add(Box::new(radio), "radio").unwrap();

        let cancel = CancellationToken::new();
        let (handle, _rx) = helpers::spawn_manager(manager.clone(), StopOnFailure, cancel.clone());
        helpers::wait_connected(&manager, "radio").await;

        let (first, second) = stalled_sends(&manager).await;
        cancel.cancel();

        for send in [first, second] {
            let result = tokio::time::timeout(Duration::from_secs(2), send)
                .await
                .expect("send outlived the cancelled link")
                .unwrap();
            assert!(matches!(result, Err(LinkError::LinkNotConnected(_))));
        }
        assert!(handle.await.unwrap().is_ok());
    }
}

// ============================================================================
// Supervision Tests
// ============================================================================

mod supervision_tests {
    use super::*;

    #[tokio::test]
    async fn stop_on_failure_propagates_closed_link() {
        let manager = Arc::new(helpers::Manager::new(MavlinkCodec::default()));
        let (radio, remote) = MemoryConnection::pair("mem:radio");
        manager.add(Box::new(radio), "radio").unwrap();

        let (handle, _rx) =
            helpers::spawn_manager(manager.clone(), StopOnFailure, CancellationToken::new());
        helpers::wait_connected(&manager, "radio").await;
        drop(remote);

        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            result,
            Err(LinkError::Failure { ref link, failure: LinkFailure::Closed }) if link == "radio"
        ));
        assert!(!manager.is_connected("radio"));
    }

    #[tokio::test]
    async fn restart_reopens_connection() {
        let manager = Arc::new(helpers::Manager::new(MavlinkCodec::default()));
        let radio = MemoryConnection::new("mem:radio");
        let mut first = radio.attach();
        let mut second = radio.attach();
        manager.add(Box::new(radio), "radio").unwrap();

        let supervisor =
            RestartWithBackoff::new(Duration::from_millis(10), Duration::from_millis(50));
        let cancel = CancellationToken::new();
        let (handle, mut rx) = helpers::spawn_manager(manager.clone(), supervisor, cancel.clone());

        first
            .write_all(&helpers::vehicle_frames(1, &[heartbeat()]))
            .await
            .unwrap();
        assert_eq!(helpers::next_envelope(&mut rx).await.correlation_id.as_deref(), Some("1"));
        drop(first);

        second
            .write_all(&helpers::vehicle_frames(2, &[heartbeat()]))
            .await
            .unwrap();
        let envelope = helpers::next_envelope(&mut rx).await;
        assert_eq!(&*envelope.link_name, "radio");
        assert_eq!(envelope.correlation_id.as_deref(), Some("2"));

        cancel.cancel();
        assert!(handle.await.unwrap().is_ok());
    }
}

// ============================================================================
// Lifecycle Tests
// ============================================================================

mod lifecycle_tests {
    use super::*;

    #[tokio::test]
    async fn cancellation_closes_connections() {
        let manager = Arc::new(helpers::Manager::new(MavlinkCodec::default()));
        let (radio, mut remote) = MemoryConnection::pair("mem:radio");
        manager.add(Box::new(radio), "radio").unwrap();

        let cancel = CancellationToken::new();
        let (handle, _rx) = helpers::spawn_manager(manager.clone(), StopOnFailure, cancel.clone());
        helpers::wait_connected(&manager, "radio").await;

        cancel.cancel();
        assert!(handle.await.unwrap().is_ok());

        let mut buf = [0u8; 8];
        assert_eq!(remote.read(&mut buf).await.unwrap(), 0);
        assert!(!manager.is_connected("radio"));
    }

    #[tokio::test]
    async fn link_set_is_frozen_while_running() {
        let manager = Arc::new(helpers::Manager::new(MavlinkCodec::default()));
        let (radio, _remote) = MemoryConnection::pair("mem:radio");
        manager.add(Box::new(radio), "radio").unwrap();

        let cancel = CancellationToken::new();
        let (handle, _rx) = helpers::spawn_manager(manager.clone(), StopOnFailure, cancel.clone());
        helpers::wait_connected(&manager, "radio").await;

        assert!(matches!(
            manager.add(Box::new(MemoryConnection::new("mem:late")), "late"),
            Err(LinkError::AlreadyRunning)
        ));
        let second_run = manager
            .run(|_inbound| async {}, &StopOnFailure, CancellationToken::new())
            .await;
        assert!(matches!(second_run, Err(LinkError::AlreadyRunning)));

        cancel.cancel();
        handle.await.unwrap().unwrap();

        // The link set opens up again once the run is over
        manager
            .add(Box::new(MemoryConnection::new("mem:late")), "late")
            .unwrap();
    }

    #[tokio::test]
    async fn run_without_links_returns_immediately() {
        let manager = helpers::Manager::new(MavlinkCodec::default());
        let result = tokio::time::timeout(
            Duration::from_secs(1),
            manager.run(|_inbound| async {}, &StopOnFailure, CancellationToken::new()),
        )
        .await
        .unwrap();
        assert!(result.is_ok());
    }
}

// ============================================================================
// Dispatch Tests
// ============================================================================

mod dispatch_tests {
    use super::*;
    use tracing::{Event, Level, Subscriber};
    use tracing_subscriber::layer::{Context, SubscriberExt};
    use tracing_subscriber::Layer;

    /// Counts warnings emitted by the dispatch table
    struct WarningCounter(Arc<AtomicUsize>);

    impl<S: Subscriber> Layer<S> for WarningCounter {
        fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
            let meta = event.metadata();
            if *meta.level() == Level::WARN && meta.target().starts_with("fleet_link::dispatch") {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn counting_dispatch() -> (tracing::Dispatch, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let subscriber = tracing_subscriber::registry().with(WarningCounter(count.clone()));
        (tracing::Dispatch::new(subscriber), count)
    }

    fn envelope(system_id: u8, message: MavlinkMessage) -> InboundEnvelope<MavlinkPacket> {
        let bytes = helpers::vehicle_frames(system_id, &[message]);
        let mut parser = MavlinkParser::new();
        let packet = parser.parse(&bytes).next().unwrap();
        InboundEnvelope::new(Arc::from("radio"), packet)
    }

    #[test]
    fn unknown_type_warns_once() {
        let (dispatch, warnings) = counting_dispatch();
        let dispatcher = Dispatcher::new();

        tracing::dispatcher::with_default(&dispatch, || {
            dispatcher.dispatch(&envelope(1, heartbeat()));
            dispatcher.dispatch(&envelope(2, heartbeat()));
        });

        assert_eq!(warnings.load(Ordering::SeqCst), 1);
        assert!(dispatcher.is_muted(&MessageTypeKey::from_static("HEARTBEAT")));
    }

    #[test]
    fn concurrent_first_occurrences_warn_once() {
        let (dispatch, warnings) = counting_dispatch();
        let dispatcher = Dispatcher::new();

        std::thread::scope(|scope| {
            for system_id in 1..=8u8 {
                let dispatcher = &dispatcher;
                let dispatch = dispatch.clone();
                scope.spawn(move || {
                    tracing::dispatcher::with_default(&dispatch, || {
                        for _ in 0..50 {
                            dispatcher.dispatch(&envelope(system_id, heartbeat()));
                        }
                    });
                });
            }
        });

        assert_eq!(warnings.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn bad_data_is_silent() {
        let (dispatch, warnings) = counting_dispatch();
        let dispatcher: Dispatcher<MavlinkPacket> = Dispatcher::new();
        let mut parser = MavlinkParser::new();
        let noise: Vec<_> = parser.parse(b"\x01\x02\x03").collect();
        assert_eq!(noise.len(), 1);

        tracing::dispatcher::with_default(&dispatch, || {
            for packet in noise {
                dispatcher.dispatch(&InboundEnvelope::new(Arc::from("radio"), packet));
            }
        });
        assert_eq!(warnings.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn start_markers_in_noise_are_silent() {
        let (dispatch, warnings) = counting_dispatch();
        let dispatcher: Dispatcher<MavlinkPacket> = Dispatcher::new();
        let mut parser = MavlinkParser::new();
        // v1 and v2 headers naming message ids nobody knows, checksums zeroed
        let noise = [0xFE, 1, 0, 7, 1, 99, 0x42, 0, 0, 0xFD, 1, 0, 0, 3, 1, 1, 0x39, 0x30, 0, 7, 0, 0];
        let packets: Vec<_> = parser.parse(&noise).collect();
        assert!(!packets.is_empty());

        tracing::dispatcher::with_default(&dispatch, || {
            for packet in packets {
                assert_eq!(packet.type_key(), MessageTypeKey::BAD_DATA);
                dispatcher.dispatch(&InboundEnvelope::new(Arc::from("radio"), packet));
            }
        });
        assert_eq!(warnings.load(Ordering::SeqCst), 0);
        assert!(!dispatcher.is_registered(&MessageTypeKey::new("UNKNOWN_99")));
    }

    #[tokio::test]
    async fn dispatcher_consumes_manager_stream() {
        let manager = Arc::new(helpers::Manager::new(MavlinkCodec::default()));
        let (radio, mut remote) = MemoryConnection::pair("mem:radio");
        manager.add(Box::new(radio), "radio").unwrap();

        let heartbeats = Arc::new(AtomicUsize::new(0));
        let counter = heartbeats.clone();
        let dispatcher = Arc::new(Dispatcher::new());
        dispatcher.register("HEARTBEAT", move |packet: &MavlinkPacket, link: &str, _: Option<&str>| {
            assert_eq!(link, "radio");
            assert_eq!(packet.type_key().as_str(), "HEARTBEAT");
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let cancel = CancellationToken::new();
        let run = {
            let manager = manager.clone();
            let dispatcher = dispatcher.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                manager
                    .run(
                        move |inbound| async move { dispatcher.run(inbound).await },
                        &StopOnFailure,
                        cancel,
                    )
                    .await
            })
        };

        remote
            .write_all(&helpers::vehicle_frames(1, &[heartbeat(), heartbeat()]))
            .await
            .unwrap();
        for _ in 0..200 {
            if heartbeats.load(Ordering::SeqCst) == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(heartbeats.load(Ordering::SeqCst), 2);

        cancel.cancel();
        run.await.unwrap().unwrap();
    }
}

// ============================================================================
// Property-Based Tests
// ============================================================================

mod proptest_tests {
    use super::*;
    use proptest::prelude::*;

    fn known_message_id() -> impl Strategy<Value = u32> {
        prop_oneof![
            Just(ids::HEARTBEAT),
            Just(ids::SYS_STATUS),
            Just(ids::GPS_RAW_INT),
            Just(ids::COMMAND_ACK),
            Just(ids::STATUSTEXT),
        ]
    }

    proptest! {
        #[test]
        fn dispatch_mutes_every_unknown_type(ids in prop::collection::vec(known_message_id(), 1..40)) {
            let dispatcher = Dispatcher::new();
            for (i, id) in ids.iter().enumerate() {
                let message = MavlinkMessage::new(*id, vec![1; 4]);
                let bytes = helpers::vehicle_frames(i as u8, &[message]);
                let mut parser = MavlinkParser::new();
                for packet in parser.parse(&bytes) {
                    dispatcher.dispatch(&InboundEnvelope::new(Arc::from("radio"), packet));
                }
            }
            for id in ids {
                let name = fleet_protocol::mavlink::message_info(id).unwrap().name;
                prop_assert!(dispatcher.is_muted(&MessageTypeKey::from_static(name)));
            }
        }
    }
}

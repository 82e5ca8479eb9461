//! End-to-end test fixtures
//!
//! Wires full clients together over an in-process signaling bus and memory
//! links, optionally with a live relay server on an ephemeral port. The
//! integration tests in `tests/` drive real `PeerDropClient` instances; only
//! the point-to-point transport is substituted.
//!
//! Basic usage pattern:
//!
//! 1. Create a `TestRoom` (add a relay with `TestRoom::with_relay()`)
//! 2. Spawn clients with `room.client("peer-a")`
//! 3. Drive them through their public API
//! 4. Await events with `wait_for_event`

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use peerdrop::config::ReconnectPolicy;
use peerdrop::peer::{MemoryHub, MemoryLinkFactory};
use peerdrop::signaling::RelayServer;
use peerdrop::{ClientEvent, LocalBus, PeerDropClient, PeerDropConfig};
use tokio::sync::mpsc;
use tokio::time::timeout;

/// How long event waits run before the test fails
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// One client plus its event stream
pub struct TestPeer {
    pub client: PeerDropClient,
    pub events: mpsc::UnboundedReceiver<ClientEvent>,
}

impl TestPeer {
    /// Await the first event matching `matches`, discarding everything else
    pub async fn wait_for_event<F>(&mut self, matches: F) -> ClientEvent
    where
        F: FnMut(&ClientEvent) -> bool,
    {
        wait_for_event(&mut self.events, matches).await
    }
}

/// A room of clients sharing one bus and one memory transport hub
pub struct TestRoom {
    pub room: String,
    pub bus: LocalBus,
    pub hub: MemoryHub,
    pub relay: Option<RelayServer>,
}

impl TestRoom {
    /// A room whose relay path points at an unreachable address
    pub fn new(room: &str) -> Self {
        Self {
            room: room.to_string(),
            bus: LocalBus::new(),
            hub: MemoryHub::new(),
            relay: None,
        }
    }

    /// A room with a live relay server on an ephemeral port
    pub async fn with_relay(room: &str) -> Self {
        let relay = RelayServer::bind("127.0.0.1:0")
            .await
            .expect("relay bind failed");
        Self {
            room: room.to_string(),
            bus: LocalBus::new(),
            hub: MemoryHub::new(),
            relay: Some(relay),
        }
    }

    /// Configuration pointing at this room's relay (or a dead address)
    pub fn config(&self, peer_id: &str) -> PeerDropConfig {
        PeerDropConfig {
            relay_url: self
                .relay
                .as_ref()
                .map(|r| r.url())
                .unwrap_or_else(|| "ws://127.0.0.1:1".to_string()),
            room: self.room.clone(),
            peer_id: Some(peer_id.to_string()),
            chunk_pacing_ms: 0,
            negotiation_timeout_secs: 0,
            reconnect: ReconnectPolicy {
                max_attempts: 2,
                delay_initial_ms: 10,
                delay_max_ms: 50,
            },
            ..Default::default()
        }
    }

    /// Start a client in this room over memory links
    pub async fn client(&self, peer_id: &str) -> TestPeer {
        self.client_with_config(self.config(peer_id)).await
    }

    /// Start a client with a customized configuration
    pub async fn client_with_config(&self, config: PeerDropConfig) -> TestPeer {
        let factory = Arc::new(MemoryLinkFactory::new(self.hub.clone()));
        let (client, events) = PeerDropClient::start_with(config, self.bus.clone(), factory)
            .await
            .expect("client start failed");
        TestPeer { client, events }
    }

    /// Stop the relay, if any
    pub async fn shutdown(&self) {
        if let Some(relay) = &self.relay {
            relay.shutdown().await;
        }
    }
}

/// Await the first event matching `matches`, discarding everything else
pub async fn wait_for_event<F>(
    events: &mut mpsc::UnboundedReceiver<ClientEvent>,
    mut matches: F,
) -> ClientEvent
where
    F: FnMut(&ClientEvent) -> bool,
{
    timeout(EVENT_TIMEOUT, async {
        loop {
            let event = events.recv().await.expect("event stream closed");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for client event")
}

/// Discover, dial, and wait until both sides report connected
pub async fn connect(a: &mut TestPeer, b: &mut TestPeer) {
    let b_id = b.client.peer_id().to_string();
    a.wait_for_event(|e| {
        matches!(e, ClientEvent::PeerDiscovered { peer_id } if *peer_id == b_id)
    })
    .await;
    a.client.connect_to_peer(&b_id).await.expect("dial failed");
    a.wait_for_event(|e| matches!(e, ClientEvent::PeerConnected { .. }))
        .await;
    b.wait_for_event(|e| matches!(e, ClientEvent::PeerConnected { .. }))
        .await;
}

/// Deterministic test payload of `len` bytes
pub fn payload(len: usize) -> Bytes {
    Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
}

/// Run a full offer/accept/receive round trip from `a` to `b`
///
/// Returns the reassembled bytes as seen by the receiver.
pub async fn transfer_file(
    a: &mut TestPeer,
    b: &mut TestPeer,
    file_name: &str,
    content: Bytes,
) -> Bytes {
    let id = a
        .client
        .send_file(file_name, content, None)
        .await
        .expect("offer failed");

    let offer_id = match b
        .wait_for_event(|e| matches!(e, ClientEvent::FileOffered { .. }))
        .await
    {
        ClientEvent::FileOffered { offer } => offer.transfer_id,
        other => panic!("unexpected event: {:?}", other),
    };
    assert_eq!(offer_id, id);
    b.client
        .accept_file_offer(&offer_id)
        .await
        .expect("accept failed");

    let received = match b
        .wait_for_event(|e| matches!(e, ClientEvent::TransferCompleted { .. }))
        .await
    {
        ClientEvent::TransferCompleted { data, .. } => data.expect("receiver gets content"),
        other => panic!("unexpected event: {:?}", other),
    };
    a.wait_for_event(|e| matches!(e, ClientEvent::TransferCompleted { .. }))
        .await;
    received
}

//! Per-peer connection orchestration
//!
//! The manager owns one record per remote peer and drives the offer/answer/
//! candidate exchange over the hybrid signaling coordinator until the
//! transport reports a ready data channel. Negotiation messages may arrive
//! duplicated or out of order because they ride two redundant signaling
//! paths; the handlers here are idempotent to duplicates and queue
//! candidates that arrive before the description making them applicable.

use crate::config::PeerDropConfig;
use crate::peer::link::{LinkEvent, LinkFactory, PeerLink};
use crate::signaling::broadcast::LocalBus;
use crate::signaling::hybrid::{ChannelStatus, HybridSignaling, SignalingEvent};
use crate::signaling::message::CandidateInit;
use crate::Result;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

/// Lifecycle of one peer record
///
/// Teardown removes the record outright, so a live record is always either
/// negotiating or connected; a later attempt toward the same peer starts
/// from a fresh record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    /// Negotiation in progress
    Connecting,
    /// Data channel ready
    Connected,
}

/// Aggregate status across all peer records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// No peer records
    Disconnected,
    /// At least one record, none connected yet
    Connecting,
    /// At least one connected peer
    Connected,
}

/// Reports from the manager to its owner
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A peer announced itself in the room
    Discovered { peer_id: String },
    /// A previously discovered peer left the room
    Left { peer_id: String },
    /// The data channel toward this peer became usable
    Connected { peer_id: String },
    /// The record for this peer was torn down
    Disconnected { peer_id: String },
    /// Aggregate status changed
    StatusChanged { status: ConnectionStatus },
    /// One inbound frame from a connected peer
    Frame { from: String, payload: Bytes },
}

struct PeerRecord {
    link: Arc<dyn PeerLink>,
    status: PeerStatus,
    remote_description_set: bool,
    dialed_at: Instant,
}

impl PeerRecord {
    fn new(link: Arc<dyn PeerLink>) -> Self {
        Self {
            link,
            status: PeerStatus::Connecting,
            remote_description_set: false,
            dialed_at: Instant::now(),
        }
    }
}

/// Drives per-peer negotiation and owns the resulting data channels
pub struct ConnectionManager {
    inner: Arc<Inner>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

struct Inner {
    peer_id: String,
    signaling: HybridSignaling,
    factory: Arc<dyn LinkFactory>,
    records: RwLock<HashMap<String, PeerRecord>>,
    pending_candidates: RwLock<HashMap<String, Vec<CandidateInit>>>,
    link_events: mpsc::UnboundedSender<LinkEvent>,
    events: mpsc::UnboundedSender<PeerEvent>,
    status: RwLock<ConnectionStatus>,
}

impl ConnectionManager {
    /// Open signaling, announce presence, and start the event loops
    pub async fn start(
        peer_id: &str,
        config: &PeerDropConfig,
        bus: LocalBus,
        factory: Arc<dyn LinkFactory>,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Self> {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let signaling = HybridSignaling::open(bus, config, peer_id, signal_tx).await;

        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            peer_id: peer_id.to_string(),
            signaling,
            factory,
            records: RwLock::new(HashMap::new()),
            pending_candidates: RwLock::new(HashMap::new()),
            link_events: link_tx,
            events,
            status: RwLock::new(ConnectionStatus::Disconnected),
        });

        inner.signaling.announce().await?;

        let mut tasks = vec![
            tokio::spawn(Inner::signaling_loop(Arc::clone(&inner), signal_rx)),
            tokio::spawn(Inner::link_loop(Arc::clone(&inner), link_rx)),
        ];
        if config.negotiation_timeout_secs > 0 {
            tasks.push(tokio::spawn(Inner::watchdog_loop(
                Arc::clone(&inner),
                Duration::from_secs(config.negotiation_timeout_secs),
            )));
        }

        info!("Connection manager for {} started", peer_id);
        Ok(Self { inner, tasks })
    }

    /// Local peer identifier
    pub fn peer_id(&self) -> &str {
        &self.inner.peer_id
    }

    /// Dial a remote peer
    ///
    /// A no-op while a record for `remote_id` already exists, which also
    /// absorbs offer glare from the dual signaling paths.
    pub async fn connect_to_peer(&self, remote_id: &str) -> Result<()> {
        self.inner.connect_to_peer(remote_id).await
    }

    /// Write a frame to one peer, or to every connected peer
    ///
    /// Channels that are not open are skipped, never queued. Returns whether
    /// at least one write succeeded.
    pub async fn send_data(&self, payload: Bytes, target: Option<&str>) -> bool {
        self.inner.send_data(payload, target).await
    }

    /// Aggregate status across all records
    pub async fn status(&self) -> ConnectionStatus {
        *self.inner.status.read().await
    }

    /// Peers with an open data channel
    pub async fn connected_peers(&self) -> Vec<String> {
        self.inner
            .records
            .read()
            .await
            .iter()
            .filter(|(_, record)| record.status == PeerStatus::Connected)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Number of live peer records, connected or still negotiating
    pub async fn peer_count(&self) -> usize {
        self.inner.records.read().await.len()
    }

    /// Reachability of the two signaling paths
    pub async fn signaling_status(&self) -> ChannelStatus {
        self.inner.signaling.status().await
    }

    /// Close every link, clear all records, and leave the room
    pub async fn cleanup(&self) {
        let links: Vec<Arc<dyn PeerLink>> = self
            .inner
            .records
            .write()
            .await
            .drain()
            .map(|(_, record)| record.link)
            .collect();
        futures::future::join_all(links.iter().map(|link| link.close())).await;

        self.inner.pending_candidates.write().await.clear();
        if let Err(e) = self.inner.signaling.close().await {
            warn!("Signaling close failed: {}", e);
        }
        for task in &self.tasks {
            task.abort();
        }
        *self.inner.status.write().await = ConnectionStatus::Disconnected;
        info!("Connection manager for {} shut down", self.inner.peer_id);
    }
}

impl Inner {
    async fn connect_to_peer(self: &Arc<Self>, remote_id: &str) -> Result<()> {
        if remote_id == self.peer_id {
            warn!("Refusing to dial self ({})", remote_id);
            return Ok(());
        }
        if self.records.read().await.contains_key(remote_id) {
            debug!("Record for {} already exists, ignoring dial", remote_id);
            return Ok(());
        }

        let link = self
            .factory
            .create_link(&self.peer_id, remote_id, self.link_events.clone())
            .await?;

        // The record exists from here on, so a concurrent dial or an inbound
        // offer for the same peer becomes a no-op.
        self.records
            .write()
            .await
            .insert(remote_id.to_string(), PeerRecord::new(Arc::clone(&link)));
        self.recompute_status().await;

        let offer = match link.create_offer().await {
            Ok(sdp) => sdp,
            Err(e) => {
                warn!("Offer generation for {} failed: {}", remote_id, e);
                self.discard_record(remote_id).await;
                return Err(e);
            }
        };

        if let Err(e) = self.signaling.send_offer(remote_id, &offer).await {
            warn!("Could not signal offer to {}: {}", remote_id, e);
            self.discard_record(remote_id).await;
            return Err(e);
        }

        info!("Dialing {}", remote_id);
        Ok(())
    }

    async fn send_data(&self, payload: Bytes, target: Option<&str>) -> bool {
        let links: Vec<Arc<dyn PeerLink>> = {
            let records = self.records.read().await;
            match target {
                Some(id) => records
                    .get(id)
                    .map(|record| Arc::clone(&record.link))
                    .into_iter()
                    .collect(),
                None => records
                    .values()
                    .map(|record| Arc::clone(&record.link))
                    .collect(),
            }
        };

        let mut delivered = false;
        for link in links {
            if !link.is_channel_open().await {
                debug!("Channel to {} not open, skipping write", link.peer_id());
                continue;
            }
            match link.send(payload.clone()).await {
                Ok(()) => delivered = true,
                Err(e) => warn!("Write to {} failed: {}", link.peer_id(), e),
            }
        }
        delivered
    }

    /// React to decoded signaling traffic
    async fn signaling_loop(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<SignalingEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                SignalingEvent::Offer { from, sdp } => self.handle_offer(&from, &sdp).await,
                SignalingEvent::Answer { from, sdp } => self.handle_answer(&from, &sdp).await,
                SignalingEvent::Candidate { from, candidate } => {
                    self.handle_candidate(&from, candidate).await
                }
                SignalingEvent::PeerJoined { peer_id } => {
                    self.emit(PeerEvent::Discovered { peer_id });
                }
                SignalingEvent::PeerLeft { peer_id } => {
                    self.teardown_peer(&peer_id, "peer left the room").await;
                    self.emit(PeerEvent::Left { peer_id });
                }
            }
        }
        debug!("Signaling loop for {} stopped", self.peer_id);
    }

    /// React to transport-level reports from all owned links
    async fn link_loop(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<LinkEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                LinkEvent::StateChanged { peer_id, state } => {
                    if state.is_terminal() {
                        self.teardown_peer(&peer_id, "transport ended").await;
                    }
                }
                LinkEvent::CandidateGathered { peer_id, candidate } => {
                    if let Err(e) = self.signaling.send_candidate(&peer_id, &candidate).await {
                        warn!("Could not signal candidate to {}: {}", peer_id, e);
                    }
                }
                LinkEvent::ChannelOpen { peer_id } => {
                    self.mark_connected(&peer_id).await;
                }
                LinkEvent::Frame { peer_id, payload } => {
                    self.emit(PeerEvent::Frame {
                        from: peer_id,
                        payload,
                    });
                }
            }
        }
        debug!("Link loop for {} stopped", self.peer_id);
    }

    /// Expire records stuck in negotiation
    async fn watchdog_loop(self: Arc<Self>, timeout: Duration) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let expired: Vec<String> = self
                .records
                .read()
                .await
                .iter()
                .filter(|(_, record)| {
                    record.status == PeerStatus::Connecting && record.dialed_at.elapsed() >= timeout
                })
                .map(|(id, _)| id.clone())
                .collect();
            for peer_id in expired {
                warn!(
                    "Negotiation with {} exceeded {:?}, tearing down",
                    peer_id, timeout
                );
                self.teardown_peer(&peer_id, "negotiation timeout").await;
            }
        }
    }

    /// Responder side of the exchange
    async fn handle_offer(self: &Arc<Self>, from: &str, sdp: &str) {
        if self.records.read().await.contains_key(from) {
            debug!("Duplicate offer from {} ignored", from);
            return;
        }

        let link = match self
            .factory
            .create_link(&self.peer_id, from, self.link_events.clone())
            .await
        {
            Ok(link) => link,
            Err(e) => {
                warn!("Could not create link for offer from {}: {}", from, e);
                return;
            }
        };
        self.records
            .write()
            .await
            .insert(from.to_string(), PeerRecord::new(Arc::clone(&link)));
        self.recompute_status().await;

        let answer = match link.create_answer(sdp).await {
            Ok(sdp) => sdp,
            Err(e) => {
                warn!("Answer generation for {} failed: {}", from, e);
                self.discard_record(from).await;
                return;
            }
        };
        self.mark_description_set(from).await;

        if let Err(e) = self.signaling.send_answer(from, &answer).await {
            warn!("Could not signal answer to {}: {}", from, e);
            self.discard_record(from).await;
            return;
        }

        self.flush_candidates(from, &link).await;
        info!("Answered offer from {}", from);
    }

    /// Dialing side receiving the response to its offer
    ///
    /// The same answer arrives once per signaling path; applying it twice
    /// would fail on a transport already in its stable state.
    async fn accept_answer(self: &Arc<Self>, from: &str, sdp: &str) -> Result<()> {
        let link = {
            let records = self.records.read().await;
            match records.get(from) {
                Some(record) if record.remote_description_set => {
                    debug!("Duplicate answer from {} ignored", from);
                    return Ok(());
                }
                Some(record) => Arc::clone(&record.link),
                None => {
                    warn!("Answer from {} without a matching record, dropping", from);
                    return Ok(());
                }
            }
        };

        link.accept_answer(sdp).await?;
        self.mark_description_set(from).await;
        self.flush_candidates(from, &link).await;
        Ok(())
    }

    async fn handle_answer(self: &Arc<Self>, from: &str, sdp: &str) {
        if let Err(e) = self.accept_answer(from, sdp).await {
            warn!("Accepting answer from {} failed: {}", from, e);
            self.discard_record(from).await;
        }
    }

    /// Apply a candidate now, or queue it until a remote description lands
    async fn handle_candidate(&self, from: &str, candidate: CandidateInit) {
        let ready = {
            let records = self.records.read().await;
            records
                .get(from)
                .filter(|record| record.remote_description_set)
                .map(|record| Arc::clone(&record.link))
        };

        match ready {
            Some(link) => {
                if let Err(e) = link.add_candidate(&candidate).await {
                    warn!("Applying candidate from {} failed: {}", from, e);
                }
            }
            None => {
                debug!("Queueing early candidate from {}", from);
                self.pending_candidates
                    .write()
                    .await
                    .entry(from.to_string())
                    .or_default()
                    .push(candidate);
            }
        }
    }

    /// Apply every queued candidate in arrival order, exactly once
    async fn flush_candidates(&self, peer_id: &str, link: &Arc<dyn PeerLink>) {
        let queued = self.pending_candidates.write().await.remove(peer_id);
        let Some(candidates) = queued else {
            return;
        };
        debug!(
            "Flushing {} queued candidates for {}",
            candidates.len(),
            peer_id
        );
        for candidate in candidates {
            if let Err(e) = link.add_candidate(&candidate).await {
                warn!("Applying queued candidate from {} failed: {}", peer_id, e);
            }
        }
    }

    async fn mark_description_set(&self, peer_id: &str) {
        if let Some(record) = self.records.write().await.get_mut(peer_id) {
            record.remote_description_set = true;
        }
    }

    /// Idempotent: the transport may report readiness more than once
    async fn mark_connected(&self, peer_id: &str) {
        {
            let mut records = self.records.write().await;
            match records.get_mut(peer_id) {
                Some(record) if record.status != PeerStatus::Connected => {
                    record.status = PeerStatus::Connected;
                }
                _ => return,
            }
        }
        info!("Peer {} connected", peer_id);
        self.emit(PeerEvent::Connected {
            peer_id: peer_id.to_string(),
        });
        self.recompute_status().await;
    }

    /// Remove a record and report the peer gone
    async fn teardown_peer(&self, peer_id: &str, reason: &str) {
        let removed = self.records.write().await.remove(peer_id);
        let Some(record) = removed else {
            return;
        };
        debug!("Tearing down {}: {}", peer_id, reason);

        self.pending_candidates.write().await.remove(peer_id);
        if let Err(e) = record.link.close().await {
            debug!("Closing link to {} failed: {}", peer_id, e);
        }
        self.emit(PeerEvent::Disconnected {
            peer_id: peer_id.to_string(),
        });
        self.recompute_status().await;
    }

    /// Drop a half-built record without a disconnect notification
    async fn discard_record(&self, peer_id: &str) {
        if let Some(record) = self.records.write().await.remove(peer_id) {
            let _ = record.link.close().await;
        }
        self.pending_candidates.write().await.remove(peer_id);
        self.recompute_status().await;
    }

    /// Derive the aggregate status from the record map
    async fn recompute_status(&self) {
        let derived = {
            let records = self.records.read().await;
            if records
                .values()
                .any(|record| record.status == PeerStatus::Connected)
            {
                ConnectionStatus::Connected
            } else if records.is_empty() {
                ConnectionStatus::Disconnected
            } else {
                ConnectionStatus::Connecting
            }
        };

        let mut status = self.status.write().await;
        if *status != derived {
            *status = derived;
            drop(status);
            self.emit(PeerEvent::StatusChanged { status: derived });
        }
    }

    fn emit(&self, event: PeerEvent) {
        // The owner may already be gone during teardown
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconnectPolicy;
    use crate::peer::memory::{MemoryHub, MemoryLinkFactory};
    use crate::signaling::message::SignalingMessage;
    use crate::Error;
    use async_trait::async_trait;
    use tokio::time::timeout;

    fn test_config(room: &str) -> PeerDropConfig {
        PeerDropConfig {
            relay_url: "ws://127.0.0.1:1".to_string(),
            room: room.to_string(),
            negotiation_timeout_secs: 0,
            reconnect: ReconnectPolicy {
                max_attempts: 1,
                delay_initial_ms: 1,
                delay_max_ms: 5,
            },
            ..Default::default()
        }
    }

    async fn start_manager(
        peer_id: &str,
        room: &str,
        bus: &LocalBus,
        hub: &MemoryHub,
    ) -> (ConnectionManager, mpsc::UnboundedReceiver<PeerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let factory = Arc::new(MemoryLinkFactory::new(hub.clone()));
        let manager =
            ConnectionManager::start(peer_id, &test_config(room), bus.clone(), factory, tx)
                .await
                .unwrap();
        (manager, rx)
    }

    async fn wait_for<F>(rx: &mut mpsc::UnboundedReceiver<PeerEvent>, mut matches: F) -> PeerEvent
    where
        F: FnMut(&PeerEvent) -> bool,
    {
        timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.expect("event stream closed");
                if matches(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for peer event")
    }

    #[tokio::test]
    async fn test_negotiation_connects_both_sides() {
        let bus = LocalBus::new();
        let hub = MemoryHub::new();
        let (a, mut rx_a) = start_manager("peer-a", "room-nego", &bus, &hub).await;
        let (b, mut rx_b) = start_manager("peer-b", "room-nego", &bus, &hub).await;

        wait_for(&mut rx_a, |e| matches!(e, PeerEvent::Discovered { .. })).await;

        a.connect_to_peer("peer-b").await.unwrap();

        wait_for(&mut rx_a, |e| {
            matches!(e, PeerEvent::Connected { peer_id } if peer_id == "peer-b")
        })
        .await;
        wait_for(&mut rx_b, |e| {
            matches!(e, PeerEvent::Connected { peer_id } if peer_id == "peer-a")
        })
        .await;

        assert_eq!(a.status().await, ConnectionStatus::Connected);
        assert_eq!(b.status().await, ConnectionStatus::Connected);
        assert_eq!(a.connected_peers().await, vec!["peer-b".to_string()]);

        a.cleanup().await;
        b.cleanup().await;
    }

    #[tokio::test]
    async fn test_duplicate_dial_creates_one_record() {
        let bus = LocalBus::new();
        let hub = MemoryHub::new();
        let (a, _rx_a) = start_manager("peer-a", "room-dup", &bus, &hub).await;

        a.connect_to_peer("peer-b").await.unwrap();
        a.connect_to_peer("peer-b").await.unwrap();

        assert_eq!(a.peer_count().await, 1);
        assert_eq!(hub.endpoint_count().await, 1);
        a.cleanup().await;
    }

    #[tokio::test]
    async fn test_duplicate_offer_ignored() {
        let bus = LocalBus::new();
        let hub = MemoryHub::new();
        let (a, _rx_a) = start_manager("peer-a", "room-glare", &bus, &hub).await;

        // The same offer delivered twice, as the dual paths will do
        let offer = SignalingMessage::offer("ghost", "peer-a", "room-glare", "memory-endpoint:g1");
        bus.publish(offer.clone()).await;
        bus.publish(offer).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(a.peer_count().await, 1);
        assert_eq!(hub.endpoint_count().await, 1);
        a.cleanup().await;
    }

    #[tokio::test]
    async fn test_answer_without_record_is_dropped() {
        let bus = LocalBus::new();
        let hub = MemoryHub::new();
        let (a, _rx_a) = start_manager("peer-a", "room-stale", &bus, &hub).await;

        bus.publish(SignalingMessage::answer(
            "ghost",
            "peer-a",
            "room-stale",
            "memory-endpoint:g1",
        ))
        .await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(a.peer_count().await, 0);
        assert_eq!(a.status().await, ConnectionStatus::Disconnected);
        a.cleanup().await;
    }

    /// Memory link that rejects a second answer, the way a real session
    /// refuses a remote description once signaling is stable
    struct SingleAnswerLink {
        inner: Arc<dyn PeerLink>,
        answered: RwLock<bool>,
    }

    #[async_trait]
    impl PeerLink for SingleAnswerLink {
        fn peer_id(&self) -> &str {
            self.inner.peer_id()
        }

        async fn create_offer(&self) -> Result<String> {
            self.inner.create_offer().await
        }

        async fn create_answer(&self, remote_sdp: &str) -> Result<String> {
            self.inner.create_answer(remote_sdp).await
        }

        async fn accept_answer(&self, remote_sdp: &str) -> Result<()> {
            let mut answered = self.answered.write().await;
            if *answered {
                return Err(Error::SdpError(
                    "invalid signaling state: stable".to_string(),
                ));
            }
            *answered = true;
            self.inner.accept_answer(remote_sdp).await
        }

        async fn add_candidate(&self, candidate: &CandidateInit) -> Result<()> {
            self.inner.add_candidate(candidate).await
        }

        async fn is_channel_open(&self) -> bool {
            self.inner.is_channel_open().await
        }

        async fn send(&self, payload: Bytes) -> Result<()> {
            self.inner.send(payload).await
        }

        async fn close(&self) -> Result<()> {
            self.inner.close().await
        }
    }

    struct SingleAnswerFactory {
        inner: MemoryLinkFactory,
    }

    #[async_trait]
    impl LinkFactory for SingleAnswerFactory {
        async fn create_link(
            &self,
            local_peer_id: &str,
            remote_peer_id: &str,
            events: mpsc::UnboundedSender<LinkEvent>,
        ) -> Result<Arc<dyn PeerLink>> {
            let inner = self
                .inner
                .create_link(local_peer_id, remote_peer_id, events)
                .await?;
            Ok(Arc::new(SingleAnswerLink {
                inner,
                answered: RwLock::new(false),
            }))
        }
    }

    #[tokio::test]
    async fn test_duplicate_answer_keeps_connection() {
        let bus = LocalBus::new();
        let hub = MemoryHub::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let factory = Arc::new(SingleAnswerFactory {
            inner: MemoryLinkFactory::new(hub.clone()),
        });
        let a = ConnectionManager::start("peer-a", &test_config("room-dupans"), bus.clone(), factory, tx)
            .await
            .unwrap();

        a.connect_to_peer("ghost").await.unwrap();

        // The same answer delivered twice, as the dual paths will do
        let answer =
            SignalingMessage::answer("ghost", "peer-a", "room-dupans", "memory-endpoint:g1");
        bus.publish(answer.clone()).await;
        bus.publish(answer).await;

        wait_for(&mut rx, |e| {
            matches!(e, PeerEvent::Connected { peer_id } if peer_id == "ghost")
        })
        .await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        // The second answer must not tear the record down
        assert_eq!(a.peer_count().await, 1);
        assert_eq!(a.connected_peers().await, vec!["ghost".to_string()]);
        a.cleanup().await;
    }

    #[tokio::test]
    async fn test_candidates_before_offer_apply_in_order() {
        let bus = LocalBus::new();
        let hub = MemoryHub::new();
        let (a, _rx_a) = start_manager("peer-a", "room-early", &bus, &hub).await;

        let first = CandidateInit {
            candidate: "candidate:first".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        };
        let second = CandidateInit {
            candidate: "candidate:second".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        };

        // Candidates land before the offer that makes them applicable
        bus.publish(
            SignalingMessage::ice_candidate("ghost", "peer-a", "room-early", &first).unwrap(),
        )
        .await;
        bus.publish(
            SignalingMessage::ice_candidate("ghost", "peer-a", "room-early", &second).unwrap(),
        )
        .await;
        bus.publish(SignalingMessage::offer(
            "ghost",
            "peer-a",
            "room-early",
            "memory-endpoint:g1",
        ))
        .await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let link = hub.link_between("peer-a", "ghost").await.unwrap();
        let applied = link.applied_candidates().await;
        assert_eq!(applied.len(), 2);
        assert_eq!(applied[0].candidate, "candidate:first");
        assert_eq!(applied[1].candidate, "candidate:second");
        a.cleanup().await;
    }

    #[tokio::test]
    async fn test_leave_tears_down_record() {
        let bus = LocalBus::new();
        let hub = MemoryHub::new();
        let (a, mut rx_a) = start_manager("peer-a", "room-leave", &bus, &hub).await;
        let (b, mut rx_b) = start_manager("peer-b", "room-leave", &bus, &hub).await;

        wait_for(&mut rx_a, |e| matches!(e, PeerEvent::Discovered { .. })).await;
        a.connect_to_peer("peer-b").await.unwrap();
        wait_for(&mut rx_a, |e| matches!(e, PeerEvent::Connected { .. })).await;

        b.cleanup().await;

        wait_for(&mut rx_a, |e| {
            matches!(e, PeerEvent::Disconnected { peer_id } if peer_id == "peer-b")
        })
        .await;
        assert_eq!(a.peer_count().await, 0);
        assert_eq!(a.status().await, ConnectionStatus::Disconnected);

        drop(rx_b);
        a.cleanup().await;
    }

    #[tokio::test]
    async fn test_send_data_without_open_channel_reports_failure() {
        let bus = LocalBus::new();
        let hub = MemoryHub::new();
        let (a, _rx_a) = start_manager("peer-a", "room-send", &bus, &hub).await;

        assert!(!a.send_data(Bytes::from_static(b"x"), None).await);
        assert!(!a.send_data(Bytes::from_static(b"x"), Some("peer-b")).await);
        a.cleanup().await;
    }

    #[tokio::test]
    async fn test_watchdog_expires_stuck_negotiation() {
        let bus = LocalBus::new();
        let hub = MemoryHub::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let factory = Arc::new(MemoryLinkFactory::new(hub.clone()));
        let mut config = test_config("room-stuck");
        config.negotiation_timeout_secs = 1;
        let a = ConnectionManager::start("peer-a", &config, bus, factory, tx)
            .await
            .unwrap();

        // Nobody answers this dial
        a.connect_to_peer("peer-gone").await.unwrap();
        assert_eq!(a.peer_count().await, 1);

        wait_for(&mut rx, |e| {
            matches!(e, PeerEvent::Disconnected { peer_id } if peer_id == "peer-gone")
        })
        .await;
        assert_eq!(a.peer_count().await, 0);
        a.cleanup().await;
    }
}

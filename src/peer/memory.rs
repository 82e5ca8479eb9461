//! In-process link pairs
//!
//! `MemoryHub` wires two `MemoryLink` endpoints living in the same process.
//! The offer/answer exchange carries endpoint ids instead of real SDP, frames
//! hop directly from one endpoint's `send` to the other's event stream, and
//! every applied candidate is recorded in arrival order so tests can assert
//! on negotiation behavior without a network.

use crate::peer::link::{LinkEvent, LinkFactory, LinkState, PeerLink};
use crate::signaling::message::CandidateInit;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

const SDP_PREFIX: &str = "memory-endpoint:";

/// Registry connecting in-process link endpoints
#[derive(Clone, Default)]
pub struct MemoryHub {
    endpoints: Arc<RwLock<HashMap<String, Arc<MemoryLink>>>>,
}

impl MemoryHub {
    /// Create an empty hub
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the link from `local` toward `remote`, if one exists
    pub async fn link_between(&self, local: &str, remote: &str) -> Option<Arc<MemoryLink>> {
        self.endpoints
            .read()
            .await
            .values()
            .find(|link| link.local_peer_id == local && link.remote_peer_id == remote)
            .cloned()
    }

    /// Number of live endpoints
    pub async fn endpoint_count(&self) -> usize {
        self.endpoints.read().await.len()
    }

    async fn register(&self, link: Arc<MemoryLink>) {
        self.endpoints
            .write()
            .await
            .insert(link.endpoint_id.clone(), link);
    }

    async fn lookup(&self, endpoint_id: &str) -> Option<Arc<MemoryLink>> {
        self.endpoints.read().await.get(endpoint_id).cloned()
    }

    async fn unregister(&self, endpoint_id: &str) {
        self.endpoints.write().await.remove(endpoint_id);
    }

    /// Mark both halves of a negotiated pair ready
    async fn establish(&self, a: &str, b: &str) {
        for endpoint_id in [a, b] {
            if let Some(link) = self.lookup(endpoint_id).await {
                link.mark_open().await;
            }
        }
    }
}

/// Factory handing out hub-wired links
#[derive(Clone)]
pub struct MemoryLinkFactory {
    hub: MemoryHub,
}

impl MemoryLinkFactory {
    /// Create a factory backed by `hub`
    pub fn new(hub: MemoryHub) -> Self {
        Self { hub }
    }

    /// The hub this factory registers endpoints in
    pub fn hub(&self) -> &MemoryHub {
        &self.hub
    }
}

#[async_trait]
impl LinkFactory for MemoryLinkFactory {
    async fn create_link(
        &self,
        local_peer_id: &str,
        remote_peer_id: &str,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn PeerLink>> {
        let link = Arc::new(MemoryLink {
            local_peer_id: local_peer_id.to_string(),
            remote_peer_id: remote_peer_id.to_string(),
            endpoint_id: uuid::Uuid::new_v4().to_string(),
            hub: self.hub.clone(),
            events,
            peer_endpoint: RwLock::new(None),
            remote_description_set: RwLock::new(false),
            open: RwLock::new(false),
            applied_candidates: RwLock::new(Vec::new()),
        });
        self.hub.register(link.clone()).await;
        Ok(link)
    }
}

/// One in-process endpoint of a link pair
pub struct MemoryLink {
    local_peer_id: String,
    remote_peer_id: String,
    endpoint_id: String,
    hub: MemoryHub,
    events: mpsc::UnboundedSender<LinkEvent>,
    peer_endpoint: RwLock<Option<String>>,
    remote_description_set: RwLock<bool>,
    open: RwLock<bool>,
    applied_candidates: RwLock<Vec<CandidateInit>>,
}

impl MemoryLink {
    /// Candidates applied to this endpoint, in arrival order
    pub async fn applied_candidates(&self) -> Vec<CandidateInit> {
        self.applied_candidates.read().await.clone()
    }

    fn local_sdp(&self) -> String {
        format!("{}{}", SDP_PREFIX, self.endpoint_id)
    }

    fn parse_endpoint(sdp: &str) -> Result<String> {
        sdp.strip_prefix(SDP_PREFIX)
            .map(|id| id.to_string())
            .ok_or_else(|| Error::SdpError(format!("Not a memory-link description: {}", sdp)))
    }

    fn emit(&self, event: LinkEvent) {
        // The manager may already be gone during teardown
        let _ = self.events.send(event);
    }

    fn emit_state(&self, state: LinkState) {
        self.emit(LinkEvent::StateChanged {
            peer_id: self.remote_peer_id.clone(),
            state,
        });
    }

    /// Emit one synthetic host candidate, standing in for ICE gathering
    fn gather_candidate(&self) {
        self.emit(LinkEvent::CandidateGathered {
            peer_id: self.remote_peer_id.clone(),
            candidate: CandidateInit {
                candidate: format!("candidate:{} 1 udp 2122252543 127.0.0.1 0 typ host", self.endpoint_id),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
            },
        });
    }

    async fn mark_open(&self) {
        *self.open.write().await = true;
        self.emit_state(LinkState::Connected);
        self.emit(LinkEvent::ChannelOpen {
            peer_id: self.remote_peer_id.clone(),
        });
    }

    async fn deliver_frame(&self, payload: Bytes) {
        self.emit(LinkEvent::Frame {
            peer_id: self.remote_peer_id.clone(),
            payload,
        });
    }

    async fn peer_closed(&self) {
        *self.open.write().await = false;
        self.emit_state(LinkState::Disconnected);
    }
}

#[async_trait]
impl PeerLink for MemoryLink {
    fn peer_id(&self) -> &str {
        &self.remote_peer_id
    }

    async fn create_offer(&self) -> Result<String> {
        debug!(
            "Memory link {} -> {} creating offer",
            self.local_peer_id, self.remote_peer_id
        );
        self.emit_state(LinkState::Connecting);
        self.gather_candidate();
        Ok(self.local_sdp())
    }

    async fn create_answer(&self, remote_sdp: &str) -> Result<String> {
        let peer_endpoint = Self::parse_endpoint(remote_sdp)?;
        debug!(
            "Memory link {} -> {} answering offer",
            self.local_peer_id, self.remote_peer_id
        );
        *self.peer_endpoint.write().await = Some(peer_endpoint);
        *self.remote_description_set.write().await = true;
        self.emit_state(LinkState::Connecting);
        self.gather_candidate();
        Ok(self.local_sdp())
    }

    async fn accept_answer(&self, remote_sdp: &str) -> Result<()> {
        let peer_endpoint = Self::parse_endpoint(remote_sdp)?;
        *self.peer_endpoint.write().await = Some(peer_endpoint.clone());
        *self.remote_description_set.write().await = true;

        // Both halves hold each other's endpoint now; the pair is ready
        self.hub.establish(&self.endpoint_id, &peer_endpoint).await;
        Ok(())
    }

    async fn add_candidate(&self, candidate: &CandidateInit) -> Result<()> {
        if !*self.remote_description_set.read().await {
            return Err(Error::IceCandidateError(
                "Candidate applied before remote description".to_string(),
            ));
        }
        self.applied_candidates.write().await.push(candidate.clone());
        Ok(())
    }

    async fn is_channel_open(&self) -> bool {
        *self.open.read().await
    }

    async fn send(&self, payload: Bytes) -> Result<()> {
        if !*self.open.read().await {
            return Err(Error::DataChannelError(format!(
                "Channel to {} is not open",
                self.remote_peer_id
            )));
        }

        let peer_endpoint = self
            .peer_endpoint
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::DataChannelError("Link has no paired endpoint".to_string()))?;

        let peer = self
            .hub
            .lookup(&peer_endpoint)
            .await
            .ok_or_else(|| Error::DataChannelError("Paired endpoint is gone".to_string()))?;

        peer.deliver_frame(payload).await;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        *self.open.write().await = false;
        self.hub.unregister(&self.endpoint_id).await;

        if let Some(peer_endpoint) = self.peer_endpoint.read().await.clone() {
            if let Some(peer) = self.hub.lookup(&peer_endpoint).await {
                peer.peer_closed().await;
            }
        }

        self.emit_state(LinkState::Closed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn paired_links() -> (
        Arc<dyn PeerLink>,
        mpsc::UnboundedReceiver<LinkEvent>,
        Arc<dyn PeerLink>,
        mpsc::UnboundedReceiver<LinkEvent>,
    ) {
        let hub = MemoryHub::new();
        let factory = MemoryLinkFactory::new(hub);

        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        let a = factory.create_link("peer-a", "peer-b", tx_a).await.unwrap();
        let b = factory.create_link("peer-b", "peer-a", tx_b).await.unwrap();

        let offer = a.create_offer().await.unwrap();
        let answer = b.create_answer(&offer).await.unwrap();
        a.accept_answer(&answer).await.unwrap();

        (a, rx_a, b, rx_b)
    }

    #[tokio::test]
    async fn test_handshake_opens_both_channels() {
        let (a, _rx_a, b, _rx_b) = paired_links().await;
        assert!(a.is_channel_open().await);
        assert!(b.is_channel_open().await);
    }

    #[tokio::test]
    async fn test_frame_crosses_to_peer_event_stream() {
        let (a, _rx_a, _b, mut rx_b) = paired_links().await;

        a.send(Bytes::from_static(b"hello")).await.unwrap();

        loop {
            match rx_b.recv().await.expect("event stream closed") {
                LinkEvent::Frame { peer_id, payload } => {
                    assert_eq!(peer_id, "peer-a");
                    assert_eq!(payload.as_ref(), b"hello");
                    break;
                }
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_send_before_handshake_fails() {
        let hub = MemoryHub::new();
        let factory = MemoryLinkFactory::new(hub);
        let (tx, _rx) = mpsc::unbounded_channel();
        let link = factory.create_link("peer-a", "peer-b", tx).await.unwrap();

        assert!(!link.is_channel_open().await);
        assert!(link.send(Bytes::from_static(b"x")).await.is_err());
    }

    #[tokio::test]
    async fn test_candidate_requires_remote_description() {
        let hub = MemoryHub::new();
        let factory = MemoryLinkFactory::new(hub.clone());
        let (tx, _rx) = mpsc::unbounded_channel();
        let link = factory.create_link("peer-a", "peer-b", tx).await.unwrap();

        let candidate = CandidateInit {
            candidate: "candidate:1".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        };
        assert!(link.add_candidate(&candidate).await.is_err());

        link.create_answer(&format!("{}remote", SDP_PREFIX))
            .await
            .unwrap();
        link.add_candidate(&candidate).await.unwrap();

        let concrete = hub.link_between("peer-a", "peer-b").await.unwrap();
        assert_eq!(concrete.applied_candidates().await.len(), 1);
    }

    #[tokio::test]
    async fn test_close_notifies_peer() {
        let (a, _rx_a, b, mut rx_b) = paired_links().await;

        a.close().await.unwrap();

        loop {
            match rx_b.recv().await.expect("event stream closed") {
                LinkEvent::StateChanged { peer_id, state } => {
                    if state == LinkState::Disconnected {
                        assert_eq!(peer_id, "peer-a");
                        break;
                    }
                }
                _ => continue,
            }
        }
        assert!(!b.is_channel_open().await);
        assert!(b.send(Bytes::from_static(b"x")).await.is_err());
    }

    #[tokio::test]
    async fn test_offer_gathers_synthetic_candidate() {
        let hub = MemoryHub::new();
        let factory = MemoryLinkFactory::new(hub);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let link = factory.create_link("peer-a", "peer-b", tx).await.unwrap();

        link.create_offer().await.unwrap();

        let mut saw_candidate = false;
        while let Ok(event) = rx.try_recv() {
            if let LinkEvent::CandidateGathered { peer_id, .. } = event {
                assert_eq!(peer_id, "peer-b");
                saw_candidate = true;
            }
        }
        assert!(saw_candidate);
    }
}

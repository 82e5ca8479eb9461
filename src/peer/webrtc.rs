//! WebRTC-backed peer links
//!
//! Production implementation of the `PeerLink` seam on top of `webrtc`.
//! Each link wraps one `RTCPeerConnection` plus a single ordered data
//! channel: the dialing side opens the channel eagerly before the offer,
//! the responding side adopts whatever channel the remote announces.

use crate::config::PeerDropConfig;
use crate::peer::link::{LinkEvent, LinkFactory, LinkState, PeerLink};
use crate::signaling::message::CandidateInit;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

/// Builds WebRTC links from the configured ICE servers
pub struct WebRtcLinkFactory {
    config: PeerDropConfig,
}

impl WebRtcLinkFactory {
    /// Create a factory using `config` for ICE servers and the channel label
    pub fn new(config: &PeerDropConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    fn ice_servers(&self) -> Vec<RTCIceServer> {
        self.config
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .chain(self.config.turn_servers.iter().map(|turn| {
                #[allow(clippy::needless_update)]
                RTCIceServer {
                    urls: vec![turn.url.clone()],
                    username: turn.username.clone(),
                    credential: turn.credential.clone(),
                    ..Default::default()
                }
            }))
            .collect()
    }
}

#[async_trait]
impl LinkFactory for WebRtcLinkFactory {
    async fn create_link(
        &self,
        local_peer_id: &str,
        remote_peer_id: &str,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn PeerLink>> {
        info!(
            "Creating WebRTC link: {} -> {}",
            local_peer_id, remote_peer_id
        );

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry =
            register_default_interceptors(Default::default(), &mut media_engine).map_err(|e| {
                Error::WebRtcError(format!("Failed to register interceptors: {}", e))
            })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: self.ice_servers(),
            ..Default::default()
        };

        let connection = Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
            Error::WebRtcError(format!("Failed to create peer connection: {}", e))
        })?);

        let link = Arc::new(WebRtcLink {
            peer_id: remote_peer_id.to_string(),
            label: self.config.data_channel_label.clone(),
            connection,
            channel: Arc::new(RwLock::new(None)),
            channel_open: Arc::new(RwLock::new(false)),
            events,
        });
        link.setup_connection_handlers();

        Ok(link)
    }
}

/// One `RTCPeerConnection` plus its data channel toward a single peer
pub struct WebRtcLink {
    peer_id: String,
    label: String,
    connection: Arc<RTCPeerConnection>,
    channel: Arc<RwLock<Option<Arc<RTCDataChannel>>>>,
    channel_open: Arc<RwLock<bool>>,
    events: mpsc::UnboundedSender<LinkEvent>,
}

impl WebRtcLink {
    fn setup_connection_handlers(&self) {
        let events = self.events.clone();
        let peer_id = self.peer_id.clone();

        self.connection.on_peer_connection_state_change(Box::new(
            move |s: RTCPeerConnectionState| {
                let events = events.clone();
                let peer_id = peer_id.clone();

                Box::pin(async move {
                    let state = match s {
                        RTCPeerConnectionState::New => LinkState::New,
                        RTCPeerConnectionState::Connecting => LinkState::Connecting,
                        RTCPeerConnectionState::Connected => LinkState::Connected,
                        RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
                        RTCPeerConnectionState::Failed => LinkState::Failed,
                        RTCPeerConnectionState::Closed => LinkState::Closed,
                        _ => return,
                    };
                    debug!("Link to {} transport state: {:?}", peer_id, state);
                    let _ = events.send(LinkEvent::StateChanged { peer_id, state });
                })
            },
        ));

        let events = self.events.clone();
        let peer_id = self.peer_id.clone();

        self.connection.on_ice_candidate(Box::new(move |candidate| {
            let events = events.clone();
            let peer_id = peer_id.clone();

            Box::pin(async move {
                if let Some(candidate) = candidate {
                    if let Ok(json) = candidate.to_json() {
                        let _ = events.send(LinkEvent::CandidateGathered {
                            peer_id,
                            candidate: CandidateInit {
                                candidate: json.candidate,
                                sdp_mid: json.sdp_mid,
                                sdp_mline_index: json.sdp_mline_index,
                            },
                        });
                    }
                }
            })
        }));

        // Responder side: adopt the channel the dialing peer announced
        let channel_slot = Arc::clone(&self.channel);
        let channel_open = Arc::clone(&self.channel_open);
        let events = self.events.clone();
        let peer_id = self.peer_id.clone();

        self.connection.on_data_channel(Box::new(move |channel| {
            let channel_slot = Arc::clone(&channel_slot);
            let channel_open = Arc::clone(&channel_open);
            let events = events.clone();
            let peer_id = peer_id.clone();

            Box::pin(async move {
                debug!(
                    "Adopting data channel '{}' announced by {}",
                    channel.label(),
                    peer_id
                );
                Self::attach_channel(&channel, channel_open, events, peer_id);
                *channel_slot.write().await = Some(channel);
            })
        }));
    }

    /// Wire open/close/error/message handlers onto a data channel
    fn attach_channel(
        channel: &Arc<RTCDataChannel>,
        channel_open: Arc<RwLock<bool>>,
        events: mpsc::UnboundedSender<LinkEvent>,
        peer_id: String,
    ) {
        let open = Arc::clone(&channel_open);
        let open_events = events.clone();
        let open_peer = peer_id.clone();
        channel.on_open(Box::new(move || {
            let open = Arc::clone(&open);
            let events = open_events.clone();
            let peer_id = open_peer.clone();
            Box::pin(async move {
                debug!("Data channel to {} opened", peer_id);
                *open.write().await = true;
                let _ = events.send(LinkEvent::ChannelOpen { peer_id });
            })
        }));

        let closed = Arc::clone(&channel_open);
        let close_peer = peer_id.clone();
        channel.on_close(Box::new(move || {
            let closed = Arc::clone(&closed);
            let peer_id = close_peer.clone();
            Box::pin(async move {
                debug!("Data channel to {} closed", peer_id);
                *closed.write().await = false;
            })
        }));

        let error_peer = peer_id.clone();
        channel.on_error(Box::new(move |err| {
            let peer_id = error_peer.clone();
            Box::pin(async move {
                error!("Data channel to {} error: {}", peer_id, err);
            })
        }));

        channel.on_message(Box::new(move |msg| {
            let events = events.clone();
            let peer_id = peer_id.clone();
            Box::pin(async move {
                let _ = events.send(LinkEvent::Frame {
                    peer_id,
                    payload: msg.data,
                });
            })
        }));
    }

    async fn local_description_sdp(&self) -> Result<String> {
        let local_desc = self.connection.local_description().await.ok_or_else(|| {
            Error::SdpError("No local description after setting it".to_string())
        })?;
        Ok(local_desc.sdp)
    }
}

#[async_trait]
impl PeerLink for WebRtcLink {
    fn peer_id(&self) -> &str {
        &self.peer_id
    }

    async fn create_offer(&self) -> Result<String> {
        // Dialing side opens the channel before offering so the offer
        // carries its description
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let channel = self
            .connection
            .create_data_channel(&self.label, Some(init))
            .await
            .map_err(|e| {
                Error::DataChannelError(format!("Failed to create data channel: {}", e))
            })?;
        Self::attach_channel(
            &channel,
            Arc::clone(&self.channel_open),
            self.events.clone(),
            self.peer_id.clone(),
        );
        *self.channel.write().await = Some(channel);

        let offer = self
            .connection
            .create_offer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create offer: {}", e)))?;

        self.connection
            .set_local_description(offer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))?;

        debug!("Created offer for peer {}", self.peer_id);
        self.local_description_sdp().await
    }

    async fn create_answer(&self, remote_sdp: &str) -> Result<String> {
        let offer = RTCSessionDescription::offer(remote_sdp.to_string())
            .map_err(|e| Error::SdpError(format!("Failed to parse offer: {}", e)))?;

        self.connection
            .set_remote_description(offer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))?;

        let answer = self
            .connection
            .create_answer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create answer: {}", e)))?;

        self.connection
            .set_local_description(answer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))?;

        debug!("Created answer for peer {}", self.peer_id);
        self.local_description_sdp().await
    }

    async fn accept_answer(&self, remote_sdp: &str) -> Result<()> {
        let answer = RTCSessionDescription::answer(remote_sdp.to_string())
            .map_err(|e| Error::SdpError(format!("Failed to parse answer: {}", e)))?;

        self.connection
            .set_remote_description(answer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))?;

        debug!("Accepted answer from peer {}", self.peer_id);
        Ok(())
    }

    async fn add_candidate(&self, candidate: &CandidateInit) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };

        self.connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| Error::IceCandidateError(format!("Failed to add ICE candidate: {}", e)))?;

        Ok(())
    }

    async fn is_channel_open(&self) -> bool {
        *self.channel_open.read().await
    }

    async fn send(&self, payload: Bytes) -> Result<()> {
        if !*self.channel_open.read().await {
            return Err(Error::DataChannelError(format!(
                "Channel to {} is not open",
                self.peer_id
            )));
        }

        let channel_guard = self.channel.read().await;
        let channel = channel_guard.as_ref().ok_or_else(|| {
            Error::DataChannelError(format!("No data channel toward {}", self.peer_id))
        })?;

        channel
            .send(&payload)
            .await
            .map_err(|e| Error::DataChannelError(format!("Failed to send frame: {}", e)))?;

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        info!("Closing WebRTC link to {}", self.peer_id);
        *self.channel_open.write().await = false;

        self.connection
            .close()
            .await
            .map_err(|e| Error::PeerConnectionError(format!("Failed to close connection: {}", e)))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_factory() -> WebRtcLinkFactory {
        WebRtcLinkFactory::new(&PeerDropConfig::default())
    }

    #[tokio::test]
    async fn test_offer_carries_data_channel() {
        let factory = test_factory();
        let (tx, _rx) = mpsc::unbounded_channel();
        let link = factory.create_link("peer-a", "peer-b", tx).await.unwrap();

        let sdp = link.create_offer().await.unwrap();
        assert!(!sdp.is_empty());
        // Data channels negotiate through an application m-line
        assert!(sdp.contains("application"));
    }

    #[tokio::test]
    async fn test_offer_answer_exchange() {
        let factory = test_factory();
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, _rx_b) = mpsc::unbounded_channel();
        let a = factory.create_link("peer-a", "peer-b", tx_a).await.unwrap();
        let b = factory.create_link("peer-b", "peer-a", tx_b).await.unwrap();

        let offer = a.create_offer().await.unwrap();
        let answer = b.create_answer(&offer).await.unwrap();
        assert!(answer.contains("application"));

        a.accept_answer(&answer).await.unwrap();
    }

    #[tokio::test]
    async fn test_candidate_before_remote_description_fails() {
        let factory = test_factory();
        let (tx, _rx) = mpsc::unbounded_channel();
        let link = factory.create_link("peer-a", "peer-b", tx).await.unwrap();

        let candidate = CandidateInit {
            candidate: "candidate:1 1 udp 2122252543 127.0.0.1 54321 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        };
        assert!(link.add_candidate(&candidate).await.is_err());
    }

    #[tokio::test]
    async fn test_send_without_open_channel_fails() {
        let factory = test_factory();
        let (tx, _rx) = mpsc::unbounded_channel();
        let link = factory.create_link("peer-a", "peer-b", tx).await.unwrap();

        assert!(!link.is_channel_open().await);
        let result = link.send(Bytes::from_static(b"payload")).await;
        assert!(matches!(result, Err(Error::DataChannelError(_))));
    }

    #[tokio::test]
    async fn test_turn_servers_join_ice_configuration() {
        let config = PeerDropConfig::default().with_turn_servers(vec![
            crate::config::TurnServerConfig {
                url: "turn:turn.example.com:3478".to_string(),
                username: "user".to_string(),
                credential: "pass".to_string(),
            },
        ]);
        let factory = WebRtcLinkFactory::new(&config);

        let servers = factory.ice_servers();
        assert_eq!(servers.len(), config.stun_servers.len() + 1);
        assert_eq!(servers.last().unwrap().username, "user");
    }
}

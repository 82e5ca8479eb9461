//! High-level client facade
//!
//! [`PeerDropClient`] ties the connection manager and the transfer protocol
//! together behind the application-facing surface: connect, chat, offer and
//! accept files, observe state. Everything asynchronous surfaces on a single
//! [`ClientEvent`] stream; a short human-readable activity log mirrors the
//! interesting ones for display.

use crate::config::PeerDropConfig;
use crate::peer::{
    ConnectionManager, ConnectionStatus, LinkFactory, PeerEvent, WebRtcLinkFactory,
};
use crate::signaling::{ChannelStatus, LocalBus};
use crate::transfer::{
    FileTransferManager, PeerMessage, PendingOffer, TransferEvent, TransferRecord,
};
use crate::{Error, Result};
use bytes::Bytes;
use std::collections::{BTreeSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

/// Most-recent entries kept in the activity log
const ACTIVITY_LOG_CAPACITY: usize = 20;

/// Everything the client reports to its owner
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// A peer announced itself in the room
    PeerDiscovered { peer_id: String },
    /// A discovered peer left the room
    PeerLeft { peer_id: String },
    /// A data channel toward this peer became usable
    PeerConnected { peer_id: String },
    /// The connection toward this peer ended
    PeerDisconnected { peer_id: String },
    /// Aggregate connection status changed
    StatusChanged { status: ConnectionStatus },
    /// A chat message arrived from a connected peer
    MessageReceived { from: String, text: String },
    /// A peer offered a file; accept or reject it by transfer id
    FileOffered { offer: PendingOffer },
    /// Progress advanced on a transfer
    TransferProgress {
        transfer_id: String,
        progress: f64,
        speed: f64,
    },
    /// A transfer finished; inbound ones carry the reassembled bytes and,
    /// when a download directory is configured, the path written to
    TransferCompleted {
        transfer_id: String,
        file_name: String,
        data: Option<Bytes>,
        saved_to: Option<PathBuf>,
    },
    /// A transfer ended without completing
    TransferFailed { transfer_id: String, reason: String },
}

/// One peer in a room: discovery, connections, chat, and file transfers
pub struct PeerDropClient {
    shared: Arc<ClientShared>,
    connections: Arc<ConnectionManager>,
    pump: tokio::task::JoinHandle<()>,
}

struct ClientShared {
    peer_id: String,
    download_dir: Option<PathBuf>,
    transfers: Arc<FileTransferManager>,
    discovered: RwLock<BTreeSet<String>>,
    activity: RwLock<VecDeque<String>>,
    events: mpsc::UnboundedSender<ClientEvent>,
}

impl PeerDropClient {
    /// Start a client over real WebRTC transport
    pub async fn start(
        config: PeerDropConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ClientEvent>)> {
        let factory = Arc::new(WebRtcLinkFactory::new(&config));
        Self::start_with(config, LocalBus::new(), factory).await
    }

    /// Start a client over an explicit bus and link factory
    ///
    /// Clients handed the same bus also reach each other without the relay;
    /// tests pair this with memory links.
    pub async fn start_with(
        config: PeerDropConfig,
        bus: LocalBus,
        factory: Arc<dyn LinkFactory>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ClientEvent>)> {
        config.validate()?;
        let peer_id = config
            .peer_id
            .clone()
            .unwrap_or_else(|| format!("peer-{}", uuid::Uuid::new_v4()));

        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let connections = Arc::new(
            ConnectionManager::start(&peer_id, &config, bus, factory, peer_tx).await?,
        );

        let (transfer_tx, transfer_rx) = mpsc::unbounded_channel();
        let sink: Arc<dyn crate::transfer::OutboundSink> = connections.clone();
        let transfers = Arc::new(FileTransferManager::new(
            sink,
            config.chunk_pacing_ms,
            transfer_tx,
        ));

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ClientShared {
            peer_id: peer_id.clone(),
            download_dir: config.download_dir.clone(),
            transfers,
            discovered: RwLock::new(BTreeSet::new()),
            activity: RwLock::new(VecDeque::new()),
            events: event_tx,
        });

        let pump = tokio::spawn(ClientShared::pump(
            Arc::clone(&shared),
            peer_rx,
            transfer_rx,
        ));

        info!("Client {} joined room {}", peer_id, config.room);
        Ok((
            Self {
                shared,
                connections,
                pump,
            },
            event_rx,
        ))
    }

    /// Local peer identifier
    pub fn peer_id(&self) -> &str {
        &self.shared.peer_id
    }

    /// Dial a discovered peer
    pub async fn connect_to_peer(&self, peer_id: &str) -> Result<()> {
        self.connections.connect_to_peer(peer_id).await?;
        self.shared
            .log_activity(format!("Connecting to {}", peer_id))
            .await;
        Ok(())
    }

    /// Broadcast a chat message to every connected peer
    ///
    /// Returns whether at least one peer received it.
    pub async fn send_message(&self, text: &str) -> Result<bool> {
        let message = PeerMessage::TestMessage {
            text: text.to_string(),
        };
        let delivered = self
            .connections
            .send_data(Bytes::from(message.to_bytes()?), None)
            .await;
        if delivered {
            self.shared
                .log_activity(format!("Sent message: {}", text))
                .await;
        } else {
            debug!("Chat message had no reachable peers");
        }
        Ok(delivered)
    }

    /// Offer a file to `target`, or to the first connected peer
    ///
    /// Returns the transfer id.
    pub async fn send_file(
        &self,
        file_name: &str,
        data: Bytes,
        target: Option<&str>,
    ) -> Result<String> {
        let peer_id = match target {
            Some(id) => id.to_string(),
            None => self
                .connections
                .connected_peers()
                .await
                .into_iter()
                .next()
                .ok_or_else(|| Error::PeerNotFound("No connected peer to offer to".to_string()))?,
        };

        let transfer_id = self
            .shared
            .transfers
            .offer_file(&peer_id, file_name, data)
            .await?;
        self.shared
            .log_activity(format!("Offered {} to {}", file_name, peer_id))
            .await;
        Ok(transfer_id)
    }

    /// Accept a pending inbound file offer
    pub async fn accept_file_offer(&self, transfer_id: &str) -> Result<()> {
        self.shared.transfers.accept_offer(transfer_id).await?;
        self.shared
            .log_activity(format!("Accepted transfer {}", transfer_id))
            .await;
        Ok(())
    }

    /// Decline a pending inbound file offer
    pub async fn reject_file_offer(&self, transfer_id: &str) -> Result<()> {
        self.shared.transfers.reject_offer(transfer_id).await?;
        self.shared
            .log_activity(format!("Rejected transfer {}", transfer_id))
            .await;
        Ok(())
    }

    /// Peers that announced themselves in the room
    pub async fn discovered_peers(&self) -> Vec<String> {
        self.shared.discovered.read().await.iter().cloned().collect()
    }

    /// Peers with an open data channel
    pub async fn connected_peers(&self) -> Vec<String> {
        self.connections.connected_peers().await
    }

    /// Aggregate connection status
    pub async fn status(&self) -> ConnectionStatus {
        self.connections.status().await
    }

    /// Reachability of the local and relay signaling paths
    pub async fn signaling_status(&self) -> ChannelStatus {
        self.connections.signaling_status().await
    }

    /// All transfer records, live and terminal
    pub async fn transfers(&self) -> Vec<TransferRecord> {
        self.shared.transfers.transfers().await
    }

    /// Inbound offers awaiting accept or reject
    pub async fn pending_offers(&self) -> Vec<PendingOffer> {
        self.shared.transfers.pending_offers().await
    }

    /// Activity log, oldest first, at most the most recent 20 entries
    pub async fn activity_log(&self) -> Vec<String> {
        self.shared.activity.read().await.iter().cloned().collect()
    }

    /// Leave the room and release every connection
    pub async fn shutdown(&self) {
        self.connections.cleanup().await;
        self.pump.abort();
        info!("Client {} shut down", self.shared.peer_id);
    }
}

impl ClientShared {
    /// Forward connection and transfer reports onto the client event stream
    async fn pump(
        self: Arc<Self>,
        mut peer_events: mpsc::UnboundedReceiver<PeerEvent>,
        mut transfer_events: mpsc::UnboundedReceiver<TransferEvent>,
    ) {
        loop {
            tokio::select! {
                event = peer_events.recv() => match event {
                    Some(event) => self.on_peer_event(event).await,
                    None => break,
                },
                event = transfer_events.recv() => match event {
                    Some(event) => self.on_transfer_event(event).await,
                    None => break,
                },
            }
        }
        debug!("Event pump for {} stopped", self.peer_id);
    }

    async fn on_peer_event(&self, event: PeerEvent) {
        match event {
            PeerEvent::Discovered { peer_id } => {
                if self.discovered.write().await.insert(peer_id.clone()) {
                    self.log_activity(format!("Discovered {}", peer_id)).await;
                    self.emit(ClientEvent::PeerDiscovered { peer_id });
                }
            }
            PeerEvent::Left { peer_id } => {
                if self.discovered.write().await.remove(&peer_id) {
                    self.log_activity(format!("{} left the room", peer_id)).await;
                    self.emit(ClientEvent::PeerLeft { peer_id });
                }
            }
            PeerEvent::Connected { peer_id } => {
                self.log_activity(format!("Connected to {}", peer_id)).await;
                self.emit(ClientEvent::PeerConnected { peer_id });
            }
            PeerEvent::Disconnected { peer_id } => {
                self.log_activity(format!("Disconnected from {}", peer_id))
                    .await;
                self.emit(ClientEvent::PeerDisconnected { peer_id });
            }
            PeerEvent::StatusChanged { status } => {
                self.emit(ClientEvent::StatusChanged { status });
            }
            PeerEvent::Frame { from, payload } => self.on_frame(&from, &payload).await,
        }
    }

    /// Decode one data channel frame and route it
    async fn on_frame(&self, from: &str, payload: &[u8]) {
        let message = match PeerMessage::from_bytes(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!("Undecodable frame from {}: {}", from, e);
                return;
            }
        };
        match message {
            PeerMessage::TestMessage { text } => {
                self.log_activity(format!("{}: {}", from, text)).await;
                self.emit(ClientEvent::MessageReceived {
                    from: from.to_string(),
                    text,
                });
            }
            other => self.transfers.handle_message(from, other).await,
        }
    }

    async fn on_transfer_event(&self, event: TransferEvent) {
        match event {
            TransferEvent::OfferReceived { offer } => {
                self.log_activity(format!(
                    "{} offers {} ({} bytes)",
                    offer.peer_id, offer.file_name, offer.file_size
                ))
                .await;
                self.emit(ClientEvent::FileOffered { offer });
            }
            TransferEvent::Progress {
                transfer_id,
                progress,
                speed,
            } => {
                self.emit(ClientEvent::TransferProgress {
                    transfer_id,
                    progress,
                    speed,
                });
            }
            TransferEvent::Completed {
                transfer_id,
                file_name,
                data,
            } => {
                let saved_to = match &data {
                    Some(content) => self.persist(&file_name, content).await,
                    None => None,
                };
                self.log_activity(match &saved_to {
                    Some(path) => format!("Received {} -> {}", file_name, path.display()),
                    None => format!("Transfer of {} completed", file_name),
                })
                .await;
                self.emit(ClientEvent::TransferCompleted {
                    transfer_id,
                    file_name,
                    data,
                    saved_to,
                });
            }
            TransferEvent::Failed {
                transfer_id,
                reason,
            } => {
                self.log_activity(format!("Transfer {} failed: {}", transfer_id, reason))
                    .await;
                self.emit(ClientEvent::TransferFailed {
                    transfer_id,
                    reason,
                });
            }
        }
    }

    /// Write a completed inbound file into the download directory, if set
    async fn persist(&self, file_name: &str, content: &Bytes) -> Option<PathBuf> {
        let dir = self.download_dir.as_ref()?;
        let path = dir.join(sanitize_file_name(file_name));
        if let Err(e) = tokio::fs::create_dir_all(dir).await {
            warn!("Could not create download dir {}: {}", dir.display(), e);
            return None;
        }
        match tokio::fs::write(&path, content).await {
            Ok(()) => Some(path),
            Err(e) => {
                warn!("Could not write {}: {}", path.display(), e);
                None
            }
        }
    }

    async fn log_activity(&self, line: String) {
        let mut activity = self.activity.write().await;
        if activity.len() == ACTIVITY_LOG_CAPACITY {
            activity.pop_front();
        }
        activity.push_back(line);
    }

    fn emit(&self, event: ClientEvent) {
        // The owner may have dropped the receiver already
        let _ = self.events.send(event);
    }
}

/// Strip anything that could escape the download directory
fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '-' | '_' | ' ') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches([' ', '.']);
    if trimmed.is_empty() {
        "download".to_string()
    } else {
        trimmed.to_string()
    }
}

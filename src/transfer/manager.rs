//! File transfer protocol on top of the connection manager's data API
//!
//! A transfer starts as an offer and moves no bytes until the receiving side
//! explicitly accepts it. The sender then walks the chunk indices in order,
//! paced by a small fixed delay; the receiver stores chunks by index
//! (duplicates overwrite, out-of-order arrival is fine) and reassembles once
//! every index is present. Records are never deleted, only marked terminal;
//! the bytes backing a pending send are purged the moment the transfer ends.

use crate::transfer::protocol::{total_chunks, PeerMessage, CHUNK_SIZE};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

/// Where the transfer protocol writes its outbound messages
///
/// Implemented by the connection manager; tests substitute collectors.
#[async_trait]
pub trait OutboundSink: Send + Sync {
    /// Deliver one message to `peer_id`, reporting whether the write landed
    async fn deliver(&self, peer_id: &str, message: &PeerMessage) -> bool;
}

#[async_trait]
impl OutboundSink for crate::peer::ConnectionManager {
    async fn deliver(&self, peer_id: &str, message: &PeerMessage) -> bool {
        let payload = match message.to_bytes() {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                warn!("Could not encode message for {}: {}", peer_id, e);
                return false;
            }
        };
        self.send_data(payload, Some(peer_id)).await
    }
}

/// Lifecycle of one transfer record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// Offered, awaiting accept/reject
    Pending,
    /// Chunks in flight
    Transferring,
    /// All chunks delivered and verified
    Completed,
    /// Ended without completing; terminal like `Completed`
    Failed,
}

impl TransferStatus {
    /// Whether this status ends the transfer
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::Failed)
    }
}

/// Which side of the transfer this record describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// Local peer offers and sends
    Sending,
    /// Local peer accepted and receives
    Receiving,
}

/// Bookkeeping for one transfer, kept after it ends
#[derive(Debug, Clone)]
pub struct TransferRecord {
    /// Transfer identifier shared by both sides
    pub transfer_id: String,
    /// File name as offered
    pub file_name: String,
    /// File size in bytes
    pub file_size: u64,
    /// Completion percentage, 0 to 100
    pub progress: f64,
    /// Current lifecycle status
    pub status: TransferStatus,
    /// Sending or receiving
    pub direction: TransferDirection,
    /// Remote peer on the other end
    pub peer_id: String,
    /// Sender-side throughput in bytes per second; stays 0 while receiving
    pub speed: f64,
    /// When the record was created
    pub started_at: Instant,
}

impl TransferRecord {
    fn new(
        transfer_id: &str,
        peer_id: &str,
        file_name: &str,
        file_size: u64,
        direction: TransferDirection,
    ) -> Self {
        Self {
            transfer_id: transfer_id.to_string(),
            file_name: file_name.to_string(),
            file_size,
            progress: 0.0,
            status: TransferStatus::Pending,
            direction,
            peer_id: peer_id.to_string(),
            speed: 0.0,
            started_at: Instant::now(),
        }
    }
}

/// An inbound offer waiting for the local user to accept or reject
#[derive(Debug, Clone)]
pub struct PendingOffer {
    /// Transfer the offer opens
    pub transfer_id: String,
    /// Peer offering the file
    pub peer_id: String,
    /// Offered file name
    pub file_name: String,
    /// Offered file size in bytes
    pub file_size: u64,
}

/// Reports from the transfer protocol to its owner
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// A remote peer offered a file
    OfferReceived { offer: PendingOffer },
    /// Progress advanced on either side
    Progress {
        transfer_id: String,
        progress: f64,
        speed: f64,
    },
    /// Transfer finished; receivers get the reassembled content
    Completed {
        transfer_id: String,
        file_name: String,
        data: Option<Bytes>,
    },
    /// Transfer ended without completing
    Failed { transfer_id: String, reason: String },
}

/// Chunked, accept-gated file transfers over one outbound sink
pub struct FileTransferManager {
    sink: Arc<dyn OutboundSink>,
    pacing: Duration,
    records: RwLock<HashMap<String, TransferRecord>>,
    outbound_payloads: RwLock<HashMap<String, Bytes>>,
    inbound_offers: RwLock<HashMap<String, PendingOffer>>,
    assembly: RwLock<HashMap<String, HashMap<u32, Vec<u8>>>>,
    events: mpsc::UnboundedSender<TransferEvent>,
}

impl FileTransferManager {
    /// Create a manager writing through `sink`
    pub fn new(
        sink: Arc<dyn OutboundSink>,
        chunk_pacing_ms: u64,
        events: mpsc::UnboundedSender<TransferEvent>,
    ) -> Self {
        Self {
            sink,
            pacing: Duration::from_millis(chunk_pacing_ms),
            records: RwLock::new(HashMap::new()),
            outbound_payloads: RwLock::new(HashMap::new()),
            inbound_offers: RwLock::new(HashMap::new()),
            assembly: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Offer `data` to `peer_id` under `file_name`
    ///
    /// Returns the transfer id. No chunk moves until the peer accepts.
    pub async fn offer_file(&self, peer_id: &str, file_name: &str, data: Bytes) -> Result<String> {
        let transfer_id = uuid::Uuid::new_v4().to_string();
        let file_size = data.len() as u64;

        self.records.write().await.insert(
            transfer_id.clone(),
            TransferRecord::new(
                &transfer_id,
                peer_id,
                file_name,
                file_size,
                TransferDirection::Sending,
            ),
        );
        self.outbound_payloads
            .write()
            .await
            .insert(transfer_id.clone(), data);

        let offer = PeerMessage::FileOffer {
            transfer_id: transfer_id.clone(),
            file_name: file_name.to_string(),
            file_size,
        };
        if !self.sink.deliver(peer_id, &offer).await {
            self.fail_transfer(&transfer_id, "could not deliver file offer")
                .await;
            return Err(Error::TransferError(format!(
                "Offer to {} was not delivered",
                peer_id
            )));
        }

        info!(
            "Offered {} ({} bytes) to {} as transfer {}",
            file_name, file_size, peer_id, transfer_id
        );
        Ok(transfer_id)
    }

    /// Accept a pending inbound offer and start receiving
    pub async fn accept_offer(&self, transfer_id: &str) -> Result<()> {
        let offer = self
            .inbound_offers
            .write()
            .await
            .remove(transfer_id)
            .ok_or_else(|| {
                Error::TransferError(format!("No pending offer with id {}", transfer_id))
            })?;

        self.records.write().await.insert(
            transfer_id.to_string(),
            TransferRecord::new(
                transfer_id,
                &offer.peer_id,
                &offer.file_name,
                offer.file_size,
                TransferDirection::Receiving,
            ),
        );

        let accept = PeerMessage::FileAccept {
            transfer_id: transfer_id.to_string(),
        };
        if !self.sink.deliver(&offer.peer_id, &accept).await {
            self.fail_transfer(transfer_id, "could not deliver accept")
                .await;
            return Err(Error::TransferError(format!(
                "Accept for {} was not delivered",
                transfer_id
            )));
        }

        // An empty file has no chunks; the accept is the whole transfer
        if offer.file_size == 0 {
            self.complete_transfer(transfer_id, &offer.file_name, Some(Bytes::new()))
                .await;
        }
        Ok(())
    }

    /// Decline a pending inbound offer
    pub async fn reject_offer(&self, transfer_id: &str) -> Result<()> {
        let offer = self
            .inbound_offers
            .write()
            .await
            .remove(transfer_id)
            .ok_or_else(|| {
                Error::TransferError(format!("No pending offer with id {}", transfer_id))
            })?;

        let reject = PeerMessage::FileReject {
            transfer_id: transfer_id.to_string(),
        };
        self.sink.deliver(&offer.peer_id, &reject).await;
        info!("Rejected transfer {} from {}", transfer_id, offer.peer_id);
        Ok(())
    }

    /// Dispatch one inbound protocol message
    pub async fn handle_message(self: &Arc<Self>, from: &str, message: PeerMessage) {
        match message {
            PeerMessage::TestMessage { .. } => {
                debug!("Chat message routed to transfer protocol, ignoring");
            }
            PeerMessage::FileOffer {
                transfer_id,
                file_name,
                file_size,
            } => {
                self.handle_offer(from, transfer_id, file_name, file_size)
                    .await
            }
            PeerMessage::FileAccept { transfer_id } => self.handle_accept(from, transfer_id).await,
            PeerMessage::FileReject { transfer_id } => self.handle_reject(from, &transfer_id).await,
            PeerMessage::FileChunk {
                transfer_id,
                chunk_index,
                total_chunks,
                file_name,
                bytes,
                ..
            } => {
                self.handle_chunk(from, &transfer_id, chunk_index, total_chunks, &file_name, bytes)
                    .await
            }
        }
    }

    /// All transfer records, live and terminal
    pub async fn transfers(&self) -> Vec<TransferRecord> {
        self.records.read().await.values().cloned().collect()
    }

    /// One record by id
    pub async fn record(&self, transfer_id: &str) -> Option<TransferRecord> {
        self.records.read().await.get(transfer_id).cloned()
    }

    /// Inbound offers not yet accepted or rejected
    pub async fn pending_offers(&self) -> Vec<PendingOffer> {
        self.inbound_offers.read().await.values().cloned().collect()
    }

    async fn handle_offer(&self, from: &str, transfer_id: String, file_name: String, file_size: u64) {
        let mut offers = self.inbound_offers.write().await;
        if offers.contains_key(&transfer_id) {
            warn!("Duplicate offer {} from {}, ignoring", transfer_id, from);
            return;
        }
        let offer = PendingOffer {
            transfer_id: transfer_id.clone(),
            peer_id: from.to_string(),
            file_name,
            file_size,
        };
        offers.insert(transfer_id, offer.clone());
        drop(offers);

        info!(
            "Peer {} offers {} ({} bytes)",
            from, offer.file_name, offer.file_size
        );
        self.emit(TransferEvent::OfferReceived { offer });
    }

    /// Sender side: the peer accepted, start moving chunks
    async fn handle_accept(self: &Arc<Self>, from: &str, transfer_id: String) {
        let record = self.records.read().await.get(&transfer_id).cloned();
        let Some(record) = record else {
            // Association already purged or never existed; a hard error for
            // the application, not for the protocol
            warn!("Accept from {} for unknown transfer {}", from, transfer_id);
            self.emit(TransferEvent::Failed {
                transfer_id,
                reason: "accept references an unknown transfer".to_string(),
            });
            return;
        };
        if record.peer_id != from {
            warn!(
                "Accept for {} came from {}, expected {}; ignoring",
                transfer_id, from, record.peer_id
            );
            return;
        }
        if record.direction != TransferDirection::Sending
            || record.status != TransferStatus::Pending
        {
            debug!("Duplicate or stale accept for {}, ignoring", transfer_id);
            return;
        }

        let payload = self.outbound_payloads.read().await.get(&transfer_id).cloned();
        let Some(payload) = payload else {
            self.fail_transfer(&transfer_id, "payload for accepted transfer is gone")
                .await;
            return;
        };

        if let Some(rec) = self.records.write().await.get_mut(&transfer_id) {
            rec.status = TransferStatus::Transferring;
        }

        let this = Arc::clone(self);
        let record = record.clone();
        tokio::spawn(async move {
            this.run_send(record, payload).await;
        });
    }

    /// Walk the chunk indices in order, pacing each write
    async fn run_send(&self, record: TransferRecord, payload: Bytes) {
        let total = total_chunks(record.file_size);
        let started = Instant::now();
        let mut sent_bytes: u64 = 0;

        debug!(
            "Sending transfer {} to {} in {} chunks",
            record.transfer_id, record.peer_id, total
        );
        for index in 0..total {
            let start = index as usize * CHUNK_SIZE;
            let end = (start + CHUNK_SIZE).min(payload.len());
            let message = PeerMessage::FileChunk {
                transfer_id: record.transfer_id.clone(),
                chunk_index: index,
                total_chunks: total,
                file_name: record.file_name.clone(),
                file_size: record.file_size,
                bytes: payload[start..end].to_vec(),
            };

            if !self.sink.deliver(&record.peer_id, &message).await {
                self.fail_transfer(&record.transfer_id, "chunk write failed")
                    .await;
                return;
            }

            sent_bytes += (end - start) as u64;
            let progress = (sent_bytes as f64 / record.file_size as f64) * 100.0;
            let elapsed = started.elapsed().as_secs_f64();
            let speed = if elapsed > 0.0 {
                sent_bytes as f64 / elapsed
            } else {
                0.0
            };
            self.update_progress(&record.transfer_id, progress, speed)
                .await;

            if !self.pacing.is_zero() && index + 1 < total {
                tokio::time::sleep(self.pacing).await;
            }
        }

        self.complete_transfer(&record.transfer_id, &record.file_name, None)
            .await;
    }

    /// Sender side: the peer declined before any chunk moved
    async fn handle_reject(&self, from: &str, transfer_id: &str) {
        let known = {
            let records = self.records.read().await;
            records
                .get(transfer_id)
                .map(|record| record.peer_id == from)
        };
        match known {
            Some(true) => {
                info!("Peer {} rejected transfer {}", from, transfer_id);
                self.fail_transfer(transfer_id, "rejected by peer").await;
            }
            Some(false) => warn!(
                "Reject for {} came from {}, not the offered peer; ignoring",
                transfer_id, from
            ),
            None => debug!("Reject for unknown transfer {}, ignoring", transfer_id),
        }
    }

    /// Receiver side: store a chunk, reassemble once every index is present
    async fn handle_chunk(
        &self,
        from: &str,
        transfer_id: &str,
        chunk_index: u32,
        total: u32,
        file_name: &str,
        bytes: Vec<u8>,
    ) {
        {
            let records = self.records.read().await;
            match records.get(transfer_id) {
                Some(record) if record.peer_id != from => {
                    warn!("Chunk for {} from unexpected peer {}", transfer_id, from);
                    return;
                }
                // A late retransmission must not regrow the assembly buffer
                Some(record) if record.status.is_terminal() => {
                    debug!("Chunk for finished transfer {}, dropping", transfer_id);
                    return;
                }
                Some(_) => {}
                None => {
                    warn!("Chunk for unaccepted transfer {}, dropping", transfer_id);
                    return;
                }
            }
        }
        if total == 0 || chunk_index >= total || bytes.len() > CHUNK_SIZE {
            self.fail_transfer(transfer_id, "malformed chunk").await;
            return;
        }

        if let Some(record) = self.records.write().await.get_mut(transfer_id) {
            if record.status == TransferStatus::Pending {
                record.status = TransferStatus::Transferring;
            }
        }

        let stored = {
            let mut assembly = self.assembly.write().await;
            let buffer = assembly.entry(transfer_id.to_string()).or_default();
            // Duplicates from a retransmitting sender simply overwrite
            buffer.insert(chunk_index, bytes);
            buffer.len() as u32
        };

        let progress = (stored as f64 / total as f64) * 100.0;
        self.update_progress(transfer_id, progress, 0.0).await;

        if stored == total {
            self.reassemble(transfer_id, total, file_name).await;
        }
    }

    /// Verify completeness, concatenate in index order, drop the buffer
    async fn reassemble(&self, transfer_id: &str, total: u32, file_name: &str) {
        let buffer = self.assembly.write().await.remove(transfer_id);
        let Some(mut buffer) = buffer else {
            return;
        };

        let mut content = Vec::new();
        for index in 0..total {
            match buffer.remove(&index) {
                Some(chunk) => content.extend_from_slice(&chunk),
                None => {
                    // Count matched but an index is missing; never retried
                    self.fail_transfer(
                        transfer_id,
                        &format!("chunk {} missing at reassembly", index),
                    )
                    .await;
                    return;
                }
            }
        }

        self.complete_transfer(transfer_id, file_name, Some(Bytes::from(content)))
            .await;
    }

    async fn update_progress(&self, transfer_id: &str, progress: f64, speed: f64) {
        {
            let mut records = self.records.write().await;
            let Some(record) = records.get_mut(transfer_id) else {
                return;
            };
            if record.status.is_terminal() {
                return;
            }
            record.progress = progress;
            record.speed = speed;
        }
        self.emit(TransferEvent::Progress {
            transfer_id: transfer_id.to_string(),
            progress,
            speed,
        });
    }

    async fn complete_transfer(&self, transfer_id: &str, file_name: &str, data: Option<Bytes>) {
        {
            let mut records = self.records.write().await;
            let Some(record) = records.get_mut(transfer_id) else {
                return;
            };
            if record.status.is_terminal() {
                return;
            }
            record.status = TransferStatus::Completed;
            record.progress = 100.0;
        }
        self.outbound_payloads.write().await.remove(transfer_id);

        info!("Transfer {} completed", transfer_id);
        self.emit(TransferEvent::Completed {
            transfer_id: transfer_id.to_string(),
            file_name: file_name.to_string(),
            data,
        });
    }

    async fn fail_transfer(&self, transfer_id: &str, reason: &str) {
        {
            let mut records = self.records.write().await;
            if let Some(record) = records.get_mut(transfer_id) {
                if record.status.is_terminal() {
                    return;
                }
                record.status = TransferStatus::Failed;
            }
        }
        self.outbound_payloads.write().await.remove(transfer_id);
        self.assembly.write().await.remove(transfer_id);

        warn!("Transfer {} failed: {}", transfer_id, reason);
        self.emit(TransferEvent::Failed {
            transfer_id: transfer_id.to_string(),
            reason: reason.to_string(),
        });
    }

    fn emit(&self, event: TransferEvent) {
        // The owner may already be gone during teardown
        let _ = self.events.send(event);
    }
}

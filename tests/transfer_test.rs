//! File transfer behavior end to end

mod harness;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use harness::TestRoom;
use peerdrop::transfer::{
    total_chunks, FileTransferManager, OutboundSink, PeerMessage, TransferEvent, TransferStatus,
};
use peerdrop::ClientEvent;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Chunk count and reassembled bytes across the interesting size boundaries
#[tokio::test]
async fn test_round_trip_across_size_boundaries() {
    let room = TestRoom::new("room-sizes");
    let mut a = room.client("peer-a").await;
    let mut b = room.client("peer-b").await;
    harness::connect(&mut a, &mut b).await;

    for size in [0usize, 1, 16384, 16385, 1_000_000] {
        let content = harness::payload(size);
        let id = a
            .client
            .send_file("blob.bin", content.clone(), None)
            .await
            .unwrap();

        let offer_id = match b
            .wait_for_event(|e| matches!(e, ClientEvent::FileOffered { .. }))
            .await
        {
            ClientEvent::FileOffered { offer } => {
                assert_eq!(offer.file_size, size as u64);
                offer.transfer_id
            }
            other => panic!("unexpected event: {:?}", other),
        };
        assert_eq!(offer_id, id);
        b.client.accept_file_offer(&offer_id).await.unwrap();

        // Every stored chunk surfaces as one receiver progress event
        let mut chunk_events = 0u32;
        let received = loop {
            match b.wait_for_event(|_| true).await {
                ClientEvent::TransferProgress { .. } => chunk_events += 1,
                ClientEvent::TransferCompleted { data, .. } => {
                    break data.expect("receiver gets content")
                }
                ClientEvent::TransferFailed { reason, .. } => {
                    panic!("transfer of {} bytes failed: {}", size, reason)
                }
                _ => {}
            }
        };
        assert_eq!(chunk_events, total_chunks(size as u64), "size {}", size);
        assert_eq!(received, content, "size {}", size);

        a.wait_for_event(|e| matches!(e, ClientEvent::TransferCompleted { .. }))
            .await;
    }

    a.client.shutdown().await;
    b.client.shutdown().await;
}

/// Forwards protocol traffic into a receiving manager, optionally dropping
/// one chunk index on the floor
struct LossySink {
    receiver: Arc<FileTransferManager>,
    sender_id: String,
    drop_chunk: Option<u32>,
}

#[async_trait]
impl OutboundSink for LossySink {
    async fn deliver(&self, _peer_id: &str, message: &PeerMessage) -> bool {
        if let PeerMessage::FileChunk { chunk_index, .. } = message {
            if Some(*chunk_index) == self.drop_chunk {
                return true;
            }
        }
        self.receiver
            .handle_message(&self.sender_id, message.clone())
            .await;
        true
    }
}

/// Swallows everything the receiving side answers with
struct NullSink;

#[async_trait]
impl OutboundSink for NullSink {
    async fn deliver(&self, _peer_id: &str, _message: &PeerMessage) -> bool {
        true
    }
}

/// A transfer missing one chunk index never reports completion
#[tokio::test]
async fn test_withheld_chunk_never_completes() {
    let (recv_tx, mut recv_rx) = mpsc::unbounded_channel();
    let receiver = Arc::new(FileTransferManager::new(Arc::new(NullSink), 0, recv_tx));

    let (send_tx, _send_rx) = mpsc::unbounded_channel();
    let sink = Arc::new(LossySink {
        receiver: Arc::clone(&receiver),
        sender_id: "peer-a".to_string(),
        drop_chunk: Some(1),
    });
    let sender = Arc::new(FileTransferManager::new(sink, 0, send_tx));

    let content = harness::payload(50000);
    let id = sender
        .offer_file("peer-b", "holey.bin", content)
        .await
        .unwrap();

    match timeout(harness::EVENT_TIMEOUT, recv_rx.recv())
        .await
        .unwrap()
        .unwrap()
    {
        TransferEvent::OfferReceived { offer } => assert_eq!(offer.transfer_id, id),
        other => panic!("unexpected event: {:?}", other),
    }
    receiver.accept_offer(&id).await.unwrap();
    sender
        .handle_message("peer-b", PeerMessage::FileAccept {
            transfer_id: id.clone(),
        })
        .await;

    // 3 of 4 chunks arrive; completion must never fire
    assert!(timeout(Duration::from_millis(500), async {
        loop {
            match recv_rx.recv().await.expect("event stream closed") {
                TransferEvent::Completed { .. } => break,
                _ => continue,
            }
        }
    })
    .await
    .is_err());

    let record = receiver.record(&id).await.unwrap();
    assert_eq!(record.status, TransferStatus::Transferring);
    assert!(record.progress < 100.0);
}

/// A rejected offer moves zero chunks and fails the sender-side record
#[tokio::test]
async fn test_reject_moves_no_chunks() {
    let room = TestRoom::new("room-reject");
    let mut a = room.client("peer-a").await;
    let mut b = room.client("peer-b").await;
    harness::connect(&mut a, &mut b).await;

    let id = a
        .client
        .send_file("unwanted.bin", harness::payload(40000), None)
        .await
        .unwrap();

    let offer_id = match b
        .wait_for_event(|e| matches!(e, ClientEvent::FileOffered { .. }))
        .await
    {
        ClientEvent::FileOffered { offer } => offer.transfer_id,
        other => panic!("unexpected event: {:?}", other),
    };
    b.client.reject_file_offer(&offer_id).await.unwrap();

    a.wait_for_event(|e| matches!(e, ClientEvent::TransferFailed { .. }))
        .await;

    // No chunk ever reached the receiving side
    assert!(timeout(Duration::from_millis(200), async {
        loop {
            match b.events.recv().await {
                Some(ClientEvent::TransferProgress { .. }) => break,
                Some(_) => continue,
                None => std::future::pending::<()>().await,
            }
        }
    })
    .await
    .is_err());

    let record = a
        .client
        .transfers()
        .await
        .into_iter()
        .find(|r| r.transfer_id == id)
        .unwrap();
    assert_eq!(record.status, TransferStatus::Failed);
    assert!((record.progress - 0.0).abs() < f64::EPSILON);

    a.client.shutdown().await;
    b.client.shutdown().await;
}

/// Sender progress is non-decreasing and lands exactly on 100
#[tokio::test]
async fn test_sender_progress_monotonic_to_completion() {
    let room = TestRoom::new("room-progress");
    let mut a = room.client("peer-a").await;
    let mut b = room.client("peer-b").await;
    harness::connect(&mut a, &mut b).await;

    let id = a
        .client
        .send_file("steady.bin", harness::payload(100000), None)
        .await
        .unwrap();
    let offer_id = match b
        .wait_for_event(|e| matches!(e, ClientEvent::FileOffered { .. }))
        .await
    {
        ClientEvent::FileOffered { offer } => offer.transfer_id,
        other => panic!("unexpected event: {:?}", other),
    };
    b.client.accept_file_offer(&offer_id).await.unwrap();

    let mut progress_values = Vec::new();
    loop {
        match a.wait_for_event(|_| true).await {
            ClientEvent::TransferProgress {
                transfer_id,
                progress,
                ..
            } if transfer_id == id => progress_values.push(progress),
            ClientEvent::TransferCompleted { .. } => break,
            ClientEvent::TransferFailed { reason, .. } => panic!("transfer failed: {}", reason),
            _ => {}
        }
    }

    assert_eq!(progress_values.len() as u32, total_chunks(100000));
    for pair in progress_values.windows(2) {
        assert!(pair[1] >= pair[0]);
    }
    assert!((progress_values.last().unwrap() - 100.0).abs() < f64::EPSILON);

    a.client.shutdown().await;
    b.client.shutdown().await;
}

/// The canonical scenario: 50000 bytes as "report.pdf" arrives in 4 chunks
#[tokio::test]
async fn test_report_pdf_scenario() {
    let room = TestRoom::new("room-report");
    let mut a = room.client("peer-a").await;
    let mut b = room.client("peer-b").await;
    harness::connect(&mut a, &mut b).await;

    let content = harness::payload(50000);
    let id = a
        .client
        .send_file("report.pdf", content.clone(), None)
        .await
        .unwrap();
    let offer_id = match b
        .wait_for_event(|e| matches!(e, ClientEvent::FileOffered { .. }))
        .await
    {
        ClientEvent::FileOffered { offer } => {
            assert_eq!(offer.file_name, "report.pdf");
            assert_eq!(offer.file_size, 50000);
            offer.transfer_id
        }
        other => panic!("unexpected event: {:?}", other),
    };
    b.client.accept_file_offer(&offer_id).await.unwrap();

    let mut chunk_events = 0u32;
    let received = loop {
        match b.wait_for_event(|_| true).await {
            ClientEvent::TransferProgress { .. } => chunk_events += 1,
            ClientEvent::TransferCompleted { data, .. } => break data.unwrap(),
            ClientEvent::TransferFailed { reason, .. } => panic!("transfer failed: {}", reason),
            _ => {}
        }
    };
    assert_eq!(chunk_events, 4);
    assert_eq!(received, content);

    let record = b
        .client
        .transfers()
        .await
        .into_iter()
        .find(|r| r.transfer_id == id)
        .unwrap();
    assert_eq!(record.status, TransferStatus::Completed);
    assert!((record.progress - 100.0).abs() < f64::EPSILON);

    a.client.shutdown().await;
    b.client.shutdown().await;
}

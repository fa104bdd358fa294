use std::sync::Arc;
use std::time::Duration;

use peerlink_protocol::Transport;
use peerlink_recovery::RecoveryPhase;
use peerlink_session::{RecoveryEvent, SessionConfig, TransferEvent};
use peerlink_transfer::{CHUNK_SIZE, Direction, TransferErrorKind};

use crate::harness::{CutAfter, Pair, sample_file, settle, until_progress, until_terminal};

#[tokio::test(start_paused = true)]
async fn resumes_from_checkpoint_after_link_drop() {
    let p = Pair::with_alice_transport(SessionConfig::default(), |t, net| {
        Arc::new(CutAfter::new(t, net, 24)) as Arc<dyn Transport>
    });
    settle().await;
    let mut recovery = p.alice.subscribe_recovery();
    let mut sent = p.alice.subscribe_transfers();
    let mut received = p.bob.subscribe_transfers();
    let file = sample_file("archive.zip", 30 * CHUNK_SIZE);
    let id = p.alice.send_file("bob", file.clone(), &file.checksum()).await.unwrap();

    let outgoing = until_terminal(&mut sent).await;
    assert!(matches!(outgoing.last(), Some(TransferEvent::Complete { .. })));
    let resumed = outgoing.iter().find_map(|e| match e {
        TransferEvent::Resumed { checkpoint, remaining, .. } => Some((*checkpoint, *remaining)),
        _ => None,
    });
    assert_eq!(resumed, Some((20, 10)));

    let expected: Vec<u32> = (0..24).chain(20..30).collect();
    assert_eq!(p.sent_chunks(), expected);

    match until_terminal(&mut received).await.last() {
        Some(TransferEvent::Complete { file: Some(got), .. }) => assert_eq!(got.data, file.data),
        other => panic!("expected complete, got {other:?}"),
    }

    let episode = recovery.drain();
    assert_eq!(
        episode.first(),
        Some(&RecoveryEvent::Started {
            peer_id: "bob".into()
        })
    );
    assert!(episode.contains(&RecoveryEvent::Success {
        peer_id: "bob".into(),
        resumed: vec![id],
    }));
    assert_eq!(p.alice.recovery().phase("bob"), RecoveryPhase::Stable);
}

#[tokio::test(start_paused = true)]
async fn unreachable_peer_fails_transfer_as_connection_lost() {
    let p = Pair::new();
    settle().await;
    let mut sent = p.alice.subscribe_transfers();
    let file = sample_file("big.iso", 60 * CHUNK_SIZE);
    let id = p.alice.send_file("bob", file, "x").await.unwrap();
    settle().await;

    p.net.set_reconnect_allowed("alice", "bob", false);
    p.net.disconnect("alice", "bob");

    let started = tokio::time::Instant::now();
    match until_terminal(&mut sent).await.last() {
        Some(TransferEvent::Error { kind, transfer_id, .. }) => {
            assert_eq!(*kind, TransferErrorKind::ConnectionLost);
            assert_eq!(transfer_id, &id);
        }
        other => panic!("expected connection lost, got {other:?}"),
    }
    // 2000 + 3000 + 4500 + 6750 + 10125 ms of backoff.
    assert!(started.elapsed() >= Duration::from_millis(26_375));
    assert_eq!(p.alice.recovery().phase("bob"), RecoveryPhase::Failed);

    settle().await;
    assert_eq!(p.alice.engine().live_timer_count(), 0);
    assert!(p.alice.transfers().is_empty());
}

#[tokio::test(start_paused = true)]
async fn receiver_fails_half_received_file_when_sender_is_lost() {
    let p = Pair::new();
    settle().await;
    let mut received = p.bob.subscribe_transfers();
    let file = sample_file("big.iso", 60 * CHUNK_SIZE);
    let id = p.alice.send_file("bob", file.clone(), &file.checksum()).await.unwrap();
    until_progress(&mut received, 3).await;

    p.net.set_reconnect_allowed("alice", "bob", false);
    p.net.set_reconnect_allowed("bob", "alice", false);
    p.net.disconnect("alice", "bob");

    match until_terminal(&mut received).await.last() {
        Some(TransferEvent::Error {
            kind,
            direction,
            transfer_id,
            ..
        }) => {
            assert_eq!(*kind, TransferErrorKind::ConnectionLost);
            assert_eq!(*direction, Direction::Incoming);
            assert_eq!(transfer_id, &id);
        }
        other => panic!("expected connection lost, got {other:?}"),
    }

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(received.drain().iter().all(|e| !e.is_terminal()));
    assert!(p.bob.transfers().is_empty());
    assert_eq!(p.bob.recovery().phase("alice"), RecoveryPhase::Failed);
}

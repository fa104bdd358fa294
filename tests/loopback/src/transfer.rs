use std::sync::Arc;
use std::time::Duration;

use peerlink_crypto::{ChunkNonce, decrypt_chunk, import_key};
use peerlink_protocol::{FileMessage, Transport, WireMessage};
use peerlink_session::{SessionConfig, TransferEvent};
use peerlink_transfer::{CHUNK_SIZE, TransferErrorKind, checksum_bytes, total_chunks};

use crate::harness::{Pair, Tamper, sample_file, settle, until_progress, until_terminal};

#[tokio::test(start_paused = true)]
async fn chunks_on_the_wire_decrypt_to_the_file() {
    let p = Pair::new();
    let file = sample_file("photo.jpg", 2 * CHUNK_SIZE + 100);
    let mut sent = p.alice.subscribe_transfers();
    p.alice.send_file("bob", file.clone(), &file.checksum()).await.unwrap();
    until_terminal(&mut sent).await;

    let messages: Vec<FileMessage> = p
        .net
        .sent_by("alice")
        .into_iter()
        .map(|(_, WireMessage::File(message))| message)
        .collect();
    let FileMessage::Start(start) = &messages[0] else {
        panic!("first message must be start");
    };
    let key = import_key(&start.key).unwrap();

    let mut plaintext = Vec::new();
    for message in &messages[1..messages.len() - 1] {
        let FileMessage::Chunk(chunk) = message else {
            panic!("expected chunk, got {message:?}");
        };
        let nonce = ChunkNonce::from_slice(&chunk.iv).unwrap();
        assert_ne!(&chunk.data[..16], &file.data[plaintext.len()..plaintext.len() + 16]);
        plaintext.extend(decrypt_chunk(&chunk.data, &key, &nonce).unwrap());
    }
    assert!(matches!(messages.last(), Some(FileMessage::Complete(_))));
    assert_eq!(plaintext, file.data);
}

#[tokio::test(start_paused = true)]
async fn every_size_arrives_with_matching_checksum() {
    for size in [0, 1, CHUNK_SIZE - 1, CHUNK_SIZE, CHUNK_SIZE + 1, 10 * CHUNK_SIZE] {
        let p = Pair::new();
        let file = sample_file("blob.bin", size);
        let checksum = file.checksum();
        assert_eq!(checksum, checksum_bytes(&file.data));
        let mut received = p.bob.subscribe_transfers();

        p.alice.send_file("bob", file.clone(), &checksum).await.unwrap();

        match until_terminal(&mut received).await.last() {
            Some(TransferEvent::Complete { file: Some(got), .. }) => {
                assert_eq!(got.data, file.data, "size {size}");
                assert_eq!(got.checksum, checksum, "size {size}");
            }
            other => panic!("size {size}: expected complete, got {other:?}"),
        }
        let expected: Vec<u32> = (0..total_chunks(size as u64, CHUNK_SIZE).unwrap()).collect();
        assert_eq!(p.sent_chunks(), expected, "size {size}");
    }
}

#[tokio::test(start_paused = true)]
async fn flipped_bit_fails_the_receiver_once() {
    let p = Pair::with_alice_transport(SessionConfig::default(), |t, _| {
        Arc::new(Tamper::new(t, 1)) as Arc<dyn Transport>
    });
    let mut received = p.bob.subscribe_transfers();
    let file = sample_file("doc.pdf", 4 * CHUNK_SIZE);
    p.alice.send_file("bob", file.clone(), &file.checksum()).await.unwrap();

    let seen = until_terminal(&mut received).await;
    match seen.last() {
        Some(TransferEvent::Error { kind, .. }) => assert_eq!(*kind, TransferErrorKind::Integrity),
        other => panic!("expected integrity error, got {other:?}"),
    }

    // The rest of the transfer, Complete included, is swallowed.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(received.drain().iter().all(|e| !e.is_terminal()));
    assert!(p.bob.transfers().is_empty());
}

#[tokio::test(start_paused = true)]
async fn backoff_grows_then_cancel_stops_it() {
    let p = Pair::new();
    settle().await;
    let mut events = p.alice.subscribe_transfers();
    let id = p
        .alice
        .send_file("bob", sample_file("a.bin", CHUNK_SIZE), "x")
        .await
        .unwrap();
    p.net.fail_next_sends("alice", 100);

    let mut delays = Vec::new();
    while delays.len() < 3 {
        if let Some(TransferEvent::Retry { next_attempt_in, .. }) = events.recv().await {
            delays.push(next_attempt_in);
        }
    }
    assert_eq!(
        delays,
        [1_000, 2_000, 4_000].map(Duration::from_millis).to_vec()
    );

    assert!(p.alice.cancel_transfer(&id));
    tokio::time::sleep(Duration::from_secs(10)).await;

    let after = events.drain();
    assert_eq!(after.len(), 1, "{after:?}");
    assert!(matches!(after[0], TransferEvent::Cancel { .. }));
    assert_eq!(p.alice.engine().live_timer_count(), 0);
    assert!(p.sent_chunks().is_empty());
}

#[tokio::test(start_paused = true)]
async fn pause_resume_sends_each_chunk_once() {
    let p = Pair::new();
    let mut sent = p.alice.subscribe_transfers();
    let mut received = p.bob.subscribe_transfers();
    let file = sample_file("movie.mkv", 25 * CHUNK_SIZE);
    let id = p.alice.send_file("bob", file.clone(), &file.checksum()).await.unwrap();

    until_progress(&mut sent, 8).await;
    assert!(p.alice.pause_transfer(&id));
    tokio::time::sleep(Duration::from_secs(3)).await;
    let paused_at = p.sent_chunks().len();
    assert!(paused_at < 25);
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(p.sent_chunks().len(), paused_at);

    assert!(p.alice.resume_transfer(&id));
    assert!(matches!(
        until_terminal(&mut sent).await.last(),
        Some(TransferEvent::Complete { .. })
    ));
    assert_eq!(p.sent_chunks(), (0..25).collect::<Vec<u32>>());

    match until_terminal(&mut received).await.last() {
        Some(TransferEvent::Complete { file: Some(got), .. }) => assert_eq!(got.data, file.data),
        other => panic!("expected complete, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn cancelling_everything_leaves_no_timers() {
    let p = Pair::new();
    let mut sent = p.alice.subscribe_transfers();
    let mut ids = Vec::new();
    for n in 0..3 {
        let file = sample_file(&format!("f{n}.bin"), 20 * CHUNK_SIZE);
        ids.push(p.alice.send_file("bob", file, "x").await.unwrap());
    }
    p.net.fail_next_sends("alice", 2);
    until_progress(&mut sent, 3).await;
    assert!(p.alice.engine().live_timer_count() > 0);

    for id in &ids {
        assert!(p.alice.cancel_transfer(id));
    }
    settle().await;

    assert_eq!(p.alice.engine().live_timer_count(), 0);
    for id in &ids {
        assert!(p.alice.engine().transfer(id).is_none());
        assert!(p.alice.engine().checkpoint(id).is_none());
    }
    assert!(p.alice.recovery().registered_transfers("bob").is_empty());
}

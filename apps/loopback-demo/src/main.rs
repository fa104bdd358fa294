//! PeerLink loopback demo.
//!
//! Usage: `peerlink-demo [FILE] [CONFIG]`
//!
//! Sends FILE (or 1 MiB of generated data) from `alice` to `bob`, drops the
//! link part way through and lets recovery resume the transfer.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use peerlink_protocol::{Inbound, MemoryNetwork};
use peerlink_session::{QualityEvent, RecoveryEvent, Session, SessionConfig, TransferEvent};
use peerlink_transfer::{Direction, OutgoingFile, calculate_file_checksum, format_size};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let (file, checksum) = match args.next() {
        Some(path) => {
            let file = OutgoingFile::from_path(Path::new(&path), "application/octet-stream")
                .with_context(|| format!("reading {path}"))?;
            // Digest of the file as stored, not of the loaded copy.
            let checksum = calculate_file_checksum(Path::new(&path))
                .with_context(|| format!("hashing {path}"))?;
            (file, checksum)
        }
        None => {
            let file = OutgoingFile::new(
                "sample.bin",
                "application/octet-stream",
                (0..1024 * 1024).map(|i| (i % 251) as u8).collect(),
            );
            let checksum = file.checksum();
            (file, checksum)
        }
    };
    let config = match args.next() {
        Some(path) => SessionConfig::load(&path).with_context(|| format!("loading {path}"))?,
        None => SessionConfig::default(),
    };

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        name = %file.name,
        size = %format_size(file.size()),
        "starting loopback demo"
    );

    let net = MemoryNetwork::new();
    let (alice_t, alice_rx) = net.endpoint("alice");
    let (bob_t, bob_rx) = net.endpoint("bob");
    let alice = Arc::new(Session::new(Arc::new(alice_t), config.clone()));
    let bob = Arc::new(Session::new(Arc::new(bob_t), config));
    pump(Arc::clone(&alice), alice_rx);
    pump(Arc::clone(&bob), bob_rx);
    net.connect("alice", "bob");

    log_quality(&alice);
    log_recovery(&alice);
    let mut sent = alice.subscribe_transfers();
    let mut received = bob.subscribe_transfers();

    let id = alice.send_file("bob", file, &checksum).await?;

    // Drop the link once a third of the chunks are out.
    let mut dropped = false;
    loop {
        tokio::select! {
            Some(event) = sent.recv() => {
                if let TransferEvent::Progress { fraction, .. } = &event
                    && !dropped
                    && *fraction > 0.33
                {
                    tracing::warn!("simulating link loss");
                    net.disconnect("alice", "bob");
                    dropped = true;
                }
                log_transfer("alice", &event);
            }
            Some(event) = received.recv() => {
                log_transfer("bob", &event);
                match event {
                    TransferEvent::Complete { file: Some(file), .. } => {
                        anyhow::ensure!(file.checksum == checksum, "checksum mismatch");
                        tracing::info!(transfer = %id, name = %file.name, "file verified on bob");
                        break;
                    }
                    TransferEvent::Error { message, .. } => anyhow::bail!("receive failed: {message}"),
                    _ => {}
                }
            }
            _ = tokio::time::sleep(Duration::from_secs(120)) => anyhow::bail!("demo timed out"),
        }
    }

    alice.shutdown();
    bob.shutdown();
    Ok(())
}

fn pump(session: Arc<Session>, mut rx: mpsc::UnboundedReceiver<Inbound>) {
    tokio::spawn(async move {
        while let Some(inbound) = rx.recv().await {
            match inbound {
                Inbound::Frame { from, bytes } => session.handle_incoming(&from, &bytes),
                Inbound::Link { peer, state } => session.handle_link_state(&peer, state),
            }
        }
    });
}

fn log_transfer(side: &str, event: &TransferEvent) {
    match event {
        TransferEvent::Progress {
            direction: Direction::Outgoing,
            current,
            total,
            speed,
            ..
        } if current % 16 == 0 => {
            tracing::info!(side, current, total, speed = %format_size(*speed as u64), "progress")
        }
        TransferEvent::Progress { .. } => {}
        other => tracing::info!(side, event = ?other, "transfer event"),
    }
}

fn log_quality(session: &Session) {
    let mut events = session.subscribe_quality();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                QualityEvent::Update { peer_id, tier, .. } => {
                    tracing::info!(peer = %peer_id, %tier, "quality")
                }
                QualityEvent::Warning { peer_id, message, .. } => {
                    tracing::warn!(peer = %peer_id, %message, "quality warning")
                }
            }
        }
    });
}

fn log_recovery(session: &Session) {
    let mut events = session.subscribe_recovery();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            tracing::info!(event = ?event, "recovery");
        }
    });
}

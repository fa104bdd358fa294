use std::time::Duration;

use peerlink_protocol::StatsReport;
use peerlink_quality::QualityTier;
use peerlink_session::QualityEvent;

use crate::harness::{Pair, settle};

fn rtt(ms: u64) -> StatsReport {
    StatsReport::link_summary(Duration::from_millis(ms), 0, 1000)
}

#[tokio::test(start_paused = true)]
async fn rtt_boundary_between_excellent_and_good() {
    let p = Pair::new();
    settle().await;
    let quality = p.alice.quality();

    p.net.set_stats("alice", "bob", rtt(99));
    assert_eq!(quality.sample_now("bob").await, Some(QualityTier::Excellent));

    p.net.set_stats("alice", "bob", rtt(100));
    assert_eq!(quality.sample_now("bob").await, Some(QualityTier::Good));
}

#[tokio::test(start_paused = true)]
async fn degraded_link_warns_and_slows_pacing() {
    let p = Pair::new();
    settle().await;
    let mut events = p.alice.subscribe_quality();
    p.net.set_stats("alice", "bob", rtt(250));

    let mut warned = false;
    let mut updated = false;
    while !(warned && updated) {
        match events.recv().await {
            Some(QualityEvent::Update { tier, .. }) => {
                assert_eq!(tier, QualityTier::Poor);
                updated = true;
            }
            Some(QualityEvent::Warning { tier, .. }) => {
                assert_eq!(tier, QualityTier::Poor);
                warned = true;
            }
            None => panic!("monitor dropped"),
        }
    }
    settle().await;
    assert_eq!(p.alice.engine().peer_tier("bob"), Some(QualityTier::Poor));
}

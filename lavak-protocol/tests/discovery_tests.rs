//! Discovery integration tests
//!
//! These exercise real multicast sockets. CI runners and containers
//! frequently lack working multicast, so the churn test is ignored by
//! default; run it with `cargo test -- --ignored` on a real network.

use std::time::Duration;

use tokio::time::{sleep, timeout};

use lavak_protocol::discovery::{Discovery, DiscoveryConfig};
use lavak_protocol::{DeviceIdentity, DiscoveryEvent};

/// Off the well-known port so these tests don't fight a running daemon
const TEST_PORT: u16 = 41235;

fn node(name: &str) -> Discovery {
    let identity = DeviceIdentity::new(name, 0, 45000);
    let config = DiscoveryConfig {
        port: TEST_PORT,
        ..DiscoveryConfig::default()
    };
    Discovery::new(identity, config)
}

#[tokio::test]
async fn test_service_lifecycle_events() {
    let mut discovery = node("lifecycle-node");
    let mut events = discovery.subscribe().await;

    discovery.start().await.expect("discovery start");
    let started = timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out")
        .expect("channel closed");
    assert!(matches!(
        started,
        DiscoveryEvent::ServiceStarted { port: TEST_PORT }
    ));

    discovery.stop().await;
    assert!(discovery.peers().await.is_empty());
}

#[tokio::test]
#[ignore]
async fn test_discovery_churn() {
    let mut x = node("node-x");
    let mut y = node("node-y");
    let mut z = node("node-z");

    x.start().await.expect("x start");
    y.start().await.expect("y start");
    z.start().await.expect("z start");

    let mut x_events = x.subscribe().await;

    // Within one broadcast interval everyone has said hello
    sleep(Duration::from_secs(4)).await;

    let x_peers = x.peers().await;
    let z_peers = z.peers().await;
    assert_eq!(x_peers.len(), 2, "x should see y and z: {:?}", x_peers);
    assert_eq!(z_peers.len(), 2, "z should see x and y: {:?}", z_peers);

    // A node never lists itself, no matter how many of its own hellos
    // it has observed by now
    assert!(x_peers.iter().all(|p| !p.device_name.contains("node-x")));
    assert!(z_peers.iter().all(|p| !p.device_name.contains("node-z")));

    // Stop y; x and z must evict it within timeout + sweep
    y.stop().await;

    let evicted = timeout(Duration::from_secs(16), async {
        loop {
            match x_events.recv().await {
                Some(DiscoveryEvent::PeerLeft(peer)) => break peer,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("y was not evicted in time");
    assert!(evicted.device_name.contains("node-y"));

    let x_peers = x.peers().await;
    assert_eq!(x_peers.len(), 1);
    assert!(x_peers[0].device_name.contains("node-z"));

    x.stop().await;
    z.stop().await;
}

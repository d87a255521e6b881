//! Gen-2 end-to-end scenarios: trader-mediated buys with paired
//! confirmations, commission accounting, and the bully election after a
//! simulated leader failure.

use peermarket::config::{Generation, MarketConfig};
use peermarket::market::{MarketPeer, RoleSpec};
use peermarket::registry::PeerRegistry;
use peermarket::snapshot::SnapshotStore;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn mediated_config() -> MarketConfig {
    MarketConfig {
        products: vec!["fish".into()],
        seller_stock: 10,
        max_transactions: 1,
        buy_probability: 0.0,
        timeout_secs: 5.0,
        ok_timeout_secs: 0.2,
        ..Default::default()
    }
}

fn temp_store(tag: &str) -> SnapshotStore {
    SnapshotStore::new(
        std::env::temp_dir().join(format!("pmkt-{}-{}.bin", tag, uuid::Uuid::new_v4())),
    )
}

async fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    cond()
}

async fn mediated_peer(
    id: u32,
    role: RoleSpec,
    total: usize,
    config: &Arc<MarketConfig>,
    registry: &Arc<PeerRegistry>,
    store: &SnapshotStore,
) -> Arc<MarketPeer> {
    MarketPeer::new(
        id,
        Generation::Mediated,
        role,
        total,
        Arc::clone(config),
        Arc::clone(registry),
        store.clone(),
    )
    .await
    .expect("bind peer")
}

/// Seller announces stock, buyer buys through the trader, both receive
/// their confirmations, and the trader accrues its commission.
#[tokio::test]
async fn trader_mediates_a_buy_and_takes_commission() {
    let config = Arc::new(mediated_config());
    let registry = Arc::new(PeerRegistry::new());
    let store = temp_store("mediated");

    let trader = mediated_peer(
        0,
        RoleSpec {
            trader: true,
            ..Default::default()
        },
        3,
        &config,
        &registry,
        &store,
    )
    .await;
    let seller = mediated_peer(
        1,
        RoleSpec {
            seller: Some("fish".into()),
            ..Default::default()
        },
        3,
        &config,
        &registry,
        &store,
    )
    .await;
    let buyer = mediated_peer(
        2,
        RoleSpec {
            buyer: true,
            ..Default::default()
        },
        3,
        &config,
        &registry,
        &store,
    )
    .await;
    registry.connect_all();

    trader.start().await;
    seller.start().await;
    buyer.start().await;
    assert!(trader.is_leading(), "bootstrap trader must lead immediately");

    seller.announce_inventory().await;
    assert!(
        wait_until(Duration::from_secs(3), || {
            trader
                .trader_state()
                .map(|s| s.total_stock("fish") == 10)
                .unwrap_or(false)
        })
        .await,
        "inventory announcement should reach the trader"
    );

    buyer.start_buying().await;
    assert!(
        wait_until(Duration::from_secs(5), || !buyer.is_running()).await,
        "buyer should complete its transaction and stop"
    );

    let bought = buyer.buyer_state().unwrap().items_bought();
    assert!(bought >= 1, "at least one item bought, got {}", bought);

    let state = trader.trader_state().unwrap();
    // commission · price · qty with commission 0.1 and price 10
    let expected = 0.1 * 10.0 * bought as f64;
    assert!(
        (state.earnings() - expected).abs() < 1e-9,
        "earnings {} != expected {}",
        state.earnings(),
        expected
    );
    // Seller stock mirrors the fill (or was restocked after a sell-out).
    assert!(
        wait_until(Duration::from_secs(2), || {
            let stock = seller.seller_state().unwrap().stock();
            stock == 10 - bought || stock == 10
        })
        .await
    );

    trader.shutdown();
    seller.shutdown();
}

/// A buy with no inventory behind it fails, and with only one product in
/// the catalog the buyer gives up.
#[tokio::test]
async fn buy_without_inventory_fails() {
    let config = Arc::new(mediated_config());
    let registry = Arc::new(PeerRegistry::new());
    let store = temp_store("mediated-fail");

    let trader = mediated_peer(
        0,
        RoleSpec {
            trader: true,
            ..Default::default()
        },
        2,
        &config,
        &registry,
        &store,
    )
    .await;
    let buyer = mediated_peer(
        1,
        RoleSpec {
            buyer: true,
            ..Default::default()
        },
        2,
        &config,
        &registry,
        &store,
    )
    .await;
    registry.connect_all();

    trader.start().await;
    buyer.start().await;
    buyer.start_buying().await;

    assert!(
        wait_until(Duration::from_secs(5), || !buyer.is_running()).await,
        "buyer should stop after the failed buy"
    );
    assert_eq!(buyer.buyer_state().unwrap().items_bought(), 0);
    trader.shutdown();
}

/// Three peers, 0 initially leading. After 0's simulated death (and bar
/// from re-election) peer 1 initiates; peer 2 answers OK, hears nothing
/// above itself, declares leadership, and everyone converges on 2.
#[tokio::test]
async fn bully_election_after_leader_failure() {
    let config = Arc::new(mediated_config());
    let registry = Arc::new(PeerRegistry::new());
    let store = temp_store("election");

    let peer0 = mediated_peer(
        0,
        RoleSpec {
            trader: true,
            ..Default::default()
        },
        3,
        &config,
        &registry,
        &store,
    )
    .await;
    let peer1 = mediated_peer(1, RoleSpec::default(), 3, &config, &registry, &store).await;
    let peer2 = mediated_peer(2, RoleSpec::default(), 3, &config, &registry, &store).await;
    registry.connect_all();

    peer0.start().await;
    peer1.start().await;
    peer2.start().await;
    assert_eq!(registry.leader().unwrap().id, 0);

    // Simulated failure: mark 0 dead, bar it, clear the leader, and let
    // peer 1 initiate.
    registry.set_alive(0, false);
    registry.bar_from_election(0);
    registry.set_leader(None);
    peer1.election().start_election().await;

    assert!(
        wait_until(Duration::from_secs(5), || {
            registry.leader().map(|l| l.id) == Some(2) && peer2.is_leading()
        })
        .await,
        "peer 2 should win the election and lead"
    );
    assert!(!peer1.is_leading());

    peer0.shutdown();
    peer1.shutdown();
    peer2.shutdown();
}

/// The successor loads the failed leader's persisted snapshot: inventory
/// and earnings both survive the handover.
#[tokio::test]
async fn successor_resumes_from_snapshot() {
    let config = Arc::new(mediated_config());
    let registry = Arc::new(PeerRegistry::new());
    let store = temp_store("handover");

    let peer0 = mediated_peer(
        0,
        RoleSpec {
            trader: true,
            ..Default::default()
        },
        3,
        &config,
        &registry,
        &store,
    )
    .await;
    let seller = mediated_peer(
        1,
        RoleSpec {
            seller: Some("fish".into()),
            ..Default::default()
        },
        3,
        &config,
        &registry,
        &store,
    )
    .await;
    let peer2 = mediated_peer(2, RoleSpec::default(), 3, &config, &registry, &store).await;
    registry.connect_all();

    peer0.start().await;
    seller.start().await;
    peer2.start().await;

    seller.announce_inventory().await;
    assert!(
        wait_until(Duration::from_secs(3), || {
            peer0
                .trader_state()
                .map(|s| s.total_stock("fish") == 10)
                .unwrap_or(false)
        })
        .await
    );

    // Kill the leader and elect a successor.
    registry.set_alive(0, false);
    registry.bar_from_election(0);
    registry.set_leader(None);
    peer2.election().start_election().await;

    assert!(
        wait_until(Duration::from_secs(5), || peer2.is_leading()).await,
        "peer 2 should take over"
    );
    assert_eq!(
        peer2.trader_state().unwrap().total_stock("fish"),
        10,
        "successor must resume with the persisted inventory"
    );

    peer0.shutdown();
    seller.shutdown();
    peer2.shutdown();
}

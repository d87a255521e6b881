//! Gen-1 end-to-end scenarios: flooded lookup, reverse-path replies,
//! direct buys, and buyer timeout behavior - over real UDP sockets.

use peermarket::config::{Generation, MarketConfig};
use peermarket::market::{MarketPeer, RoleSpec};
use peermarket::registry::PeerRegistry;
use peermarket::snapshot::SnapshotStore;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn gossip_config() -> MarketConfig {
    MarketConfig {
        products: vec!["salt".into()],
        seller_stock: 1,
        max_transactions: 1,
        buy_probability: 0.0,
        timeout_secs: 5.0,
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

async fn gossip_peer(
    id: u32,
    role: RoleSpec,
    total: usize,
    config: &Arc<MarketConfig>,
    registry: &Arc<PeerRegistry>,
) -> Arc<MarketPeer> {
    MarketPeer::new(
        id,
        Generation::Gossip,
        role,
        total,
        Arc::clone(config),
        Arc::clone(registry),
        temp_store("gossip"),
    )
    .await
    .expect("bind peer")
}

/// Buyer 0 neighbors seller 1 selling salt with stock 1. One lookup with
/// a single hop ends in a purchase, the buyer hits its transaction cap,
/// and the seller passes through zero stock into a restock.
#[tokio::test]
async fn single_buyer_and_seller_complete_a_sale() {
    let config = Arc::new(gossip_config());
    let registry = Arc::new(PeerRegistry::new());

    let buyer = gossip_peer(
        0,
        RoleSpec {
            buyer: true,
            ..Default::default()
        },
        2,
        &config,
        &registry,
    )
    .await;
    let seller = gossip_peer(
        1,
        RoleSpec {
            seller: Some("salt".into()),
            ..Default::default()
        },
        2,
        &config,
        &registry,
    )
    .await;
    registry.connect(0, 1);
    registry.bootstrap_hop_budget(3);
    assert_eq!(registry.hop_budget(), 1, "diameter caps the budget");

    buyer.start().await;
    seller.start().await;
    buyer.start_buying().await;

    assert!(
        wait_until(Duration::from_secs(5), || !buyer.is_running()).await,
        "buyer should reach its transaction cap and shut down"
    );
    assert_eq!(buyer.buyer_state().unwrap().items_bought(), 1);

    // The sale drained the stock to zero, which triggers a restock back
    // to SELLER_STOCK.
    let seller_state = seller.seller_state().unwrap();
    assert_eq!(seller_state.stock(), config.seller_stock);
    seller.shutdown();
}

/// A lookup travels buyer → relay → seller; the reply walks the reverse
/// path through the relay before the buyer issues its direct buy.
#[tokio::test]
async fn lookup_and_reply_traverse_a_relay() {
    let config = Arc::new(gossip_config());
    let registry = Arc::new(PeerRegistry::new());

    let buyer = gossip_peer(
        0,
        RoleSpec {
            buyer: true,
            ..Default::default()
        },
        3,
        &config,
        &registry,
    )
    .await;
    let relay = gossip_peer(1, RoleSpec::default(), 3, &config, &registry).await;
    let seller = gossip_peer(
        2,
        RoleSpec {
            seller: Some("salt".into()),
            ..Default::default()
        },
        3,
        &config,
        &registry,
    )
    .await;
    // A chain: the buyer cannot reach the seller directly.
    registry.connect(0, 1);
    registry.connect(1, 2);
    registry.bootstrap_hop_budget(3);
    assert_eq!(registry.diameter(), 2);
    assert_eq!(registry.hop_budget(), 2);

    buyer.start().await;
    relay.start().await;
    seller.start().await;
    buyer.start_buying().await;

    assert!(
        wait_until(Duration::from_secs(5), || !buyer.is_running()).await,
        "two-hop purchase should complete"
    );
    assert_eq!(buyer.buyer_state().unwrap().items_bought(), 1);

    relay.shutdown();
    seller.shutdown();
}

/// With no seller anywhere, the pending request times out, the product is
/// recorded as exhausted, and - it being the only product - the buyer
/// shuts down empty-handed.
#[tokio::test]
async fn buyer_exhausts_products_and_shuts_down() {
    let config = Arc::new(MarketConfig {
        timeout_secs: 0.3,
        ..gossip_config()
    });
    let registry = Arc::new(PeerRegistry::new());

    let buyer = gossip_peer(
        0,
        RoleSpec {
            buyer: true,
            ..Default::default()
        },
        2,
        &config,
        &registry,
    )
    .await;
    let relay = gossip_peer(1, RoleSpec::default(), 2, &config, &registry).await;
    registry.connect(0, 1);
    registry.bootstrap_hop_budget(3);

    buyer.start().await;
    relay.start().await;
    buyer.start_buying().await;

    assert!(
        wait_until(Duration::from_secs(5), || !buyer.is_running()).await,
        "buyer should give up after exhausting every product"
    );
    assert_eq!(buyer.buyer_state().unwrap().items_bought(), 0);
    relay.shutdown();
}

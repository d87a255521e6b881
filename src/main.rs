//! peermarket - simulation driver
//!
//! Boots one of the three marketplace generations from a YAML config and
//! runs it until every buyer has shut down:
//!
//! ```text
//! ┌──────────┐    ┌───────────┐    ┌──────────┐    ┌─────────┐
//! │  Config  │───▶│ Bootstrap │───▶│   Run    │───▶│ Summary │
//! │  (YAML)  │    │ (network) │    │ (market) │    └─────────┘
//! └──────────┘    └───────────┘    └──────────┘
//! ```

use anyhow::Result;
use peermarket::config::{Config, Generation};
use peermarket::election::run_leader_monitor;
use peermarket::logging::init_logging;
use peermarket::market::{MarketPeer, RoleSpec};
use peermarket::registry::PeerRegistry;
use peermarket::snapshot::SnapshotStore;
use peermarket::warehouse::{Gen3Buyer, Gen3Seller, TradingPost, WarehouseServer};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args().nth(1).unwrap_or_else(|| "peermarket.yaml".to_string());

    println!("=== peermarket ===");
    println!("[1] Loading configuration from {}...", config_path);
    let config = Config::load(&config_path)?;

    println!("[2] Initializing logging...");
    let _guard = init_logging(&config.app);

    println!("[3] Running {:?} market...\n", config.sim.generation);
    match config.sim.generation {
        Generation::Gossip => run_gossip(&config).await?,
        Generation::Mediated => run_mediated(&config).await?,
        Generation::Warehouse => run_warehouse(&config).await?,
    }

    println!("\n=== Done ({}) ===", chrono::Utc::now().format("%d.%m.%Y %H:%M:%S%.3f"));
    Ok(())
}

/// Wait until every buyer peer has shut down.
async fn wait_for_buyers(buyers: &[Arc<MarketPeer>]) {
    loop {
        if buyers.iter().all(|b| !b.is_running()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

// ============================================================
// GEN-1: GOSSIP MARKET
// ============================================================

async fn run_gossip(config: &Config) -> Result<()> {
    let market = Arc::new(config.market.clone());
    let registry = Arc::new(PeerRegistry::new());
    let total = config.sim.num_buyers + config.sim.num_sellers;

    let mut peers: Vec<Arc<MarketPeer>> = Vec::with_capacity(total);
    for id in 0..total as u32 {
        let role = if (id as usize) < config.sim.num_buyers {
            RoleSpec {
                buyer: true,
                ..Default::default()
            }
        } else {
            let product = market.products[id as usize % market.products.len()].clone();
            RoleSpec {
                seller: Some(product),
                ..Default::default()
            }
        };
        let peer = MarketPeer::new(
            id,
            Generation::Gossip,
            role,
            total,
            Arc::clone(&market),
            Arc::clone(&registry),
            SnapshotStore::new(&config.sim.snapshot_file),
        )
        .await?;
        peers.push(peer);
    }

    // Ring topology; the computed diameter caps the hop budget.
    for id in 0..total as u32 {
        registry.connect(id, (id + 1) % total as u32);
    }
    registry.bootstrap_hop_budget(config.sim.hop_budget);
    info!(
        diameter = registry.diameter(),
        hop_budget = registry.hop_budget(),
        "gossip graph bootstrapped"
    );

    for peer in &peers {
        peer.start().await;
    }
    for peer in peers.iter().filter(|p| p.buyer_state().is_some()) {
        peer.start_buying().await;
    }

    let buyers: Vec<Arc<MarketPeer>> = peers.iter().filter(|p| p.buyer_state().is_some()).cloned().collect();
    wait_for_buyers(&buyers).await;

    println!("All buyers have shut down; stopping sellers.");
    for peer in &peers {
        peer.shutdown();
    }
    for buyer in &buyers {
        if let Some(state) = buyer.buyer_state() {
            println!("Buyer {} bought {} item(s)", buyer.id(), state.items_bought());
        }
    }
    Ok(())
}

// ============================================================
// GEN-2: MEDIATED MARKET
// ============================================================

async fn run_mediated(config: &Config) -> Result<()> {
    let market = Arc::new(config.market.clone());
    let registry = Arc::new(PeerRegistry::new());
    // Peer 0 is the bootstrap trader; sellers and buyers follow.
    let total = 1 + config.sim.num_sellers + config.sim.num_buyers;
    let store = SnapshotStore::new(&config.sim.snapshot_file);

    let mut peers: Vec<Arc<MarketPeer>> = Vec::with_capacity(total);
    for id in 0..total as u32 {
        let role = if id == 0 {
            RoleSpec {
                trader: true,
                ..Default::default()
            }
        } else if (id as usize) <= config.sim.num_sellers {
            let product = market.products[id as usize % market.products.len()].clone();
            RoleSpec {
                seller: Some(product),
                ..Default::default()
            }
        } else {
            RoleSpec {
                buyer: true,
                ..Default::default()
            }
        };
        let peer = MarketPeer::new(
            id,
            Generation::Mediated,
            role,
            total,
            Arc::clone(&market),
            Arc::clone(&registry),
            store.clone(),
        )
        .await?;
        peers.push(peer);
    }

    registry.connect_all();
    for peer in &peers {
        peer.start().await;
    }

    for peer in peers.iter().filter(|p| p.seller_state().is_some()) {
        peer.announce_inventory().await;
    }
    for peer in peers.iter().filter(|p| p.buyer_state().is_some()) {
        peer.start_buying().await;
    }

    let coordinators = peers.iter().map(|p| Arc::clone(p.election())).collect();
    let monitor = tokio::spawn(run_leader_monitor(
        Arc::clone(&registry),
        coordinators,
        (*market).clone(),
    ));

    let buyers: Vec<Arc<MarketPeer>> = peers.iter().filter(|p| p.buyer_state().is_some()).cloned().collect();
    wait_for_buyers(&buyers).await;
    monitor.abort();

    println!("All buyers have shut down; stopping the market.");
    for peer in &peers {
        peer.shutdown();
    }
    for buyer in &buyers {
        if let Some(state) = buyer.buyer_state() {
            println!("Buyer {} bought {} item(s)", buyer.id(), state.items_bought());
        }
    }
    if let Some(leader) = registry.leader() {
        println!("Final leader: peer {}", leader.id);
    }
    Ok(())
}

// ============================================================
// GEN-3: WAREHOUSE MARKET
// ============================================================

async fn run_warehouse(config: &Config) -> Result<()> {
    let market = Arc::new(config.market.clone());

    // Warehouse database server.
    let listener = TcpListener::bind(("127.0.0.1", config.sim.warehouse_port)).await?;
    let warehouse_addr = listener.local_addr()?;
    let warehouse = Arc::new(WarehouseServer::new(
        &config.sim.warehouse_file,
        market.max_workers,
    ));
    for product in &market.products {
        if warehouse.stock(product) == 0 {
            warehouse.set_stock(product, market.seller_stock * 10);
        }
    }
    let (wh_shutdown_tx, wh_shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(Arc::clone(&warehouse).serve(listener, wh_shutdown_rx));

    // The trader pair, each heartbeating the other.
    let mut traders = Vec::new();
    for (i, port) in config.sim.trader_ports.iter().take(2).enumerate() {
        let trader = TradingPost::bind(
            i as u32 + 1,
            *port,
            warehouse_addr,
            true,
            Arc::clone(&market),
        )
        .await?;
        traders.push(trader);
    }
    if traders.is_empty() {
        anyhow::bail!("warehouse generation needs at least one trader port");
    }
    if traders.len() == 2 {
        traders[0].set_peer_trader(traders[1].addr());
        traders[1].set_peer_trader(traders[0].addr());
    }

    // Clients, split across the trading posts.
    let mut buyers = Vec::new();
    for i in 0..config.sim.num_buyers {
        let assigned = traders[i % traders.len()].addr();
        let buyer = Gen3Buyer::bind(
            i as u32 + 1,
            vec![assigned],
            market.products.clone(),
            Arc::clone(&market),
        )
        .await?;
        buyers.push(buyer);
    }
    let mut sellers = Vec::new();
    for i in 0..config.sim.num_sellers {
        let assigned = traders[i % traders.len()].addr();
        let seller = Gen3Seller::bind(
            i as u32 + 1,
            vec![assigned],
            market.products.clone(),
            Arc::clone(&market),
        )
        .await?;
        sellers.push(seller);
    }

    let client_addrs: Vec<_> = buyers
        .iter()
        .map(|b| b.listener_addr())
        .chain(sellers.iter().map(|s| s.listener_addr()))
        .collect();
    for trader in &traders {
        trader.register_clients(client_addrs.clone());
        trader.run().await;
    }

    for seller in &sellers {
        tokio::spawn(Arc::clone(seller).run());
    }
    let buyer_tasks: Vec<_> = buyers
        .iter()
        .map(|buyer| tokio::spawn(Arc::clone(buyer).run()))
        .collect();
    futures::future::join_all(buyer_tasks).await;

    println!("All buyers finished; stopping the tier.");
    for seller in &sellers {
        seller.stop();
    }
    for trader in &traders {
        if let Some(cache) = trader.cache() {
            println!(
                "Trader {}: {} buys, {} over-sells (rate {:.2}%)",
                trader.port(),
                cache.total_buy_requests(),
                cache.oversell_detected(),
                cache.oversell_rate() * 100.0
            );
        }
        trader.shutdown();
    }
    let _ = wh_shutdown_tx.send(true);
    println!("Warehouse shipped {} good(s) in total.", warehouse.shipped_goods());

    for buyer in &buyers {
        println!(
            "Buyer completed {} transaction(s)",
            buyer.completed_transactions()
        );
    }
    Ok(())
}

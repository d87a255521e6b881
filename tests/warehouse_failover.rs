//! Gen-3 end-to-end scenarios: cached trading against the warehouse,
//! over-sell detection, heartbeat failover, and the SOLOTRADER retry
//! ladder - over real TCP sockets.

use peermarket::config::MarketConfig;
use peermarket::warehouse::protocol::{HEARTBEAT_MESSAGE, HEARTBEAT_RESPONSE};
use peermarket::warehouse::{Gen3Buyer, TradingPost, WarehouseServer};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

fn warehouse_config() -> MarketConfig {
    MarketConfig {
        products: vec!["apple".into()],
        max_transactions: 3,
        buy_probability: 1.0,
        inter_buy_delay_secs: 0.05,
        heartbeat_interval_secs: 0.2,
        // Keep the periodic refresher out of the deterministic steps.
        cache_refresh_secs: 30.0,
        ..Default::default()
    }
}

fn temp_inventory() -> PathBuf {
    std::env::temp_dir().join(format!("pmkt-wh-{}.json", uuid::Uuid::new_v4()))
}

async fn start_warehouse(
    apples: u32,
) -> (Arc<WarehouseServer>, SocketAddr, tokio::sync::watch::Sender<bool>, PathBuf) {
    let file = temp_inventory();
    let warehouse = Arc::new(WarehouseServer::new(&file, 8));
    warehouse.set_stock("apple", apples);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(Arc::clone(&warehouse).serve(listener, shutdown_rx));
    (warehouse, addr, shutdown_tx, file)
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

/// Raw one-line exchange with a trader, the way heartbeats travel.
async fn raw_exchange(addr: SocketAddr, line: &str) -> Option<String> {
    let stream = TcpStream::connect(addr).await.ok()?;
    let (read_half, mut write_half) = stream.into_split();
    write_half
        .write_all(format!("{}\n", line).as_bytes())
        .await
        .ok()?;
    BufReader::new(read_half).lines().next_line().await.ok()?
}

/// Scenario: warehouse holds apple=100, cache fetched=100. A buy of 10
/// succeeds (warehouse 90, cache 90). The warehouse is drained to 5
/// behind the trader's back; a buy of 50 is admitted by the cache but
/// rejected by the warehouse - one over-sell, then a refresh to 5. A buy
/// of 5 succeeds; a buy of 1 is rejected straight from the cache.
#[tokio::test]
async fn oversell_is_detected_and_cache_refreshed() {
    let config = Arc::new(warehouse_config());
    let (warehouse, wh_addr, wh_shutdown, file) = start_warehouse(100).await;

    let trader = TradingPost::bind(1, 0, wh_addr, true, Arc::clone(&config))
        .await
        .unwrap();
    trader.run().await;
    let cache = trader.cache().unwrap();
    assert_eq!(cache.get("apple"), 100, "initial sync should see 100");

    // Buy 10 through the real client path.
    let buyer = Gen3Buyer::bind(1, vec![trader.addr()], vec!["apple".into()], Arc::clone(&config))
        .await
        .unwrap();
    let response = buyer.buy_once("apple", 10).await.expect("trader reachable");
    assert!(response.starts_with("OK"), "got {}", response);
    assert_eq!(warehouse.stock("apple"), 90);
    assert_eq!(cache.get("apple"), 90);

    // External drain the cache cannot see.
    warehouse.set_stock("apple", 5);

    let response = trader.process_command("buy|apple|50|rid-over").await;
    assert!(response.starts_with("ERROR"), "got {}", response);
    assert_eq!(cache.oversell_detected(), 1);
    assert_eq!(cache.get("apple"), 5, "rejection must trigger a refresh");

    let response = trader.process_command("buy|apple|5|rid-rest").await;
    assert!(response.starts_with("OK"), "got {}", response);
    assert_eq!(warehouse.stock("apple"), 0);

    // The last unit does not exist; the cache rejects without warehouse
    // traffic.
    let shipped_before = warehouse.shipped_goods();
    let response = trader.process_command("buy|apple|1|rid-under").await;
    assert!(response.starts_with("ERROR"), "got {}", response);
    assert_eq!(warehouse.shipped_goods(), shipped_before);

    trader.shutdown();
    let _ = wh_shutdown.send(true);
    let _ = std::fs::remove_file(file);
}

/// Sells are applied to the cache optimistically and reach the warehouse.
#[tokio::test]
async fn sell_path_updates_cache_and_warehouse() {
    let config = Arc::new(warehouse_config());
    let (warehouse, wh_addr, wh_shutdown, file) = start_warehouse(10).await;

    let trader = TradingPost::bind(1, 0, wh_addr, true, Arc::clone(&config))
        .await
        .unwrap();
    trader.run().await;

    let response = trader.process_command("sell|apple|7|rid-sell").await;
    assert!(response.starts_with("OK"), "got {}", response);
    assert_eq!(warehouse.stock("apple"), 17);
    assert_eq!(trader.cache().unwrap().get("apple"), 17);

    trader.shutdown();
    let _ = wh_shutdown.send(true);
    let _ = std::fs::remove_file(file);
}

/// With the cache disabled every buy goes straight to the warehouse, so
/// over-sells cannot be observed.
#[tokio::test]
async fn cache_disabled_trader_never_oversells() {
    let config = Arc::new(warehouse_config());
    let (warehouse, wh_addr, wh_shutdown, file) = start_warehouse(5).await;

    let trader = TradingPost::bind(1, 0, wh_addr, false, Arc::clone(&config))
        .await
        .unwrap();
    trader.run().await;
    assert!(trader.cache().is_none());

    let response = trader.process_command("buy|apple|50|rid-big").await;
    assert!(response.starts_with("ERROR"), "got {}", response);
    assert_eq!(warehouse.stock("apple"), 5, "authoritative stock untouched");

    trader.shutdown();
    let _ = wh_shutdown.send(true);
    let _ = std::fs::remove_file(file);
}

/// Scenario: two traders with mutual heartbeats. T1 dies; within two
/// heartbeat intervals T2 notices and broadcasts SOLOTRADER with its
/// port. A buyer assigned to T1 fails twice there and succeeds on the
/// third attempt at T2.
#[tokio::test]
async fn heartbeat_failover_redirects_clients() {
    let config = Arc::new(warehouse_config());
    let (_warehouse, wh_addr, wh_shutdown, file) = start_warehouse(100).await;

    let trader1 = TradingPost::bind(1, 0, wh_addr, true, Arc::clone(&config))
        .await
        .unwrap();
    let trader2 = TradingPost::bind(2, 0, wh_addr, true, Arc::clone(&config))
        .await
        .unwrap();
    trader1.set_peer_trader(trader2.addr());
    trader2.set_peer_trader(trader1.addr());

    let buyer = Gen3Buyer::bind(
        1,
        vec![trader1.addr()],
        vec!["apple".into()],
        Arc::clone(&config),
    )
    .await
    .unwrap();
    trader1.register_clients(vec![buyer.listener_addr()]);
    trader2.register_clients(vec![buyer.listener_addr()]);

    trader1.run().await;
    trader2.run().await;

    // Both alive: heartbeats are answered.
    let answer = raw_exchange(trader2.addr(), HEARTBEAT_MESSAGE).await;
    assert_eq!(answer.as_deref(), Some(HEARTBEAT_RESPONSE));

    // A buy at the assigned trader works while it lives.
    let response = buyer.buy_once("apple", 1).await.expect("trader1 up");
    assert!(response.starts_with("OK"), "got {}", response);

    // Kill T1; T2's next missed probe triggers the broadcast.
    trader1.shutdown();
    assert!(
        wait_until(Duration::from_secs(5), || buyer.backup_port().is_some()).await,
        "buyer should learn the survivor port"
    );
    assert_eq!(buyer.backup_port(), Some(trader2.port()));

    // Two failed attempts at T1, third at the survivor.
    let response = buyer
        .buy_once("apple", 2)
        .await
        .expect("survivor should answer");
    assert!(response.starts_with("OK"), "got {}", response);
    assert_eq!(buyer.completed_transactions(), 2);

    trader2.shutdown();
    let _ = wh_shutdown.send(true);
    let _ = std::fs::remove_file(file);
}

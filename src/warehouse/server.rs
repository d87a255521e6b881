//! Warehouse server - the authoritative inventory database
//!
//! Serves the text protocol over TCP. Per-product mutexes serialize
//! buy/sell updates so different products proceed concurrently; a global
//! lock guards full-inventory snapshots (fetch and the durable rewrite).
//! A shared shipped-goods counter is incremented under the lock on every
//! successful buy. The inventory is rewritten to a JSON file after each
//! successful mutation.

use crate::core_types::{Product, Qty};
use dashmap::DashMap;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Semaphore, watch};
use tracing::{debug, error, info, warn};

use super::protocol::{WarehouseRequest, WarehouseResponse};

#[derive(Error, Debug)]
pub enum WarehouseError {
    #[error("inventory file error: {0}")]
    File(#[from] std::io::Error),

    #[error("inventory encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

struct WarehouseState {
    /// Authoritative product → quantity map.
    inventory: RwLock<HashMap<Product, Qty>>,
    /// Per-product mutexes serializing buy/sell on the same product.
    product_locks: DashMap<Product, Arc<tokio::sync::Mutex<()>>>,
    /// Guards full-inventory snapshots: fetch responses and file rewrites.
    snapshot_lock: Mutex<()>,
    /// Goods shipped to buyers since startup.
    shipped_goods: AtomicU64,
    file: PathBuf,
}

impl WarehouseState {
    fn product_lock(&self, product: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.product_locks
            .entry(product.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Rewrite the durable JSON map. Takes the snapshot lock so the file
    /// never interleaves with a fetch.
    fn save(&self) -> Result<(), WarehouseError> {
        let _guard = self.snapshot_lock.lock().unwrap();
        let inventory = self.inventory.read().unwrap().clone();
        let json = serde_json::to_string_pretty(&inventory)?;
        std::fs::write(&self.file, json)?;
        Ok(())
    }
}

pub struct WarehouseServer {
    state: Arc<WarehouseState>,
    max_workers: usize,
}

impl WarehouseServer {
    /// Open (or create) the warehouse backed by `file`. An existing JSON
    /// map is loaded; a missing or unreadable one starts empty.
    pub fn new(file: impl AsRef<Path>, max_workers: usize) -> Self {
        let file = file.as_ref().to_path_buf();
        let inventory: HashMap<Product, Qty> = match std::fs::read_to_string(&file) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(map) => {
                    info!(path = %file.display(), "warehouse inventory loaded");
                    map
                }
                Err(e) => {
                    warn!(path = %file.display(), error = %e, "unreadable inventory, starting empty");
                    HashMap::new()
                }
            },
            Err(_) => {
                info!(path = %file.display(), "no inventory file, starting empty");
                HashMap::new()
            }
        };

        Self {
            state: Arc::new(WarehouseState {
                inventory: RwLock::new(inventory),
                product_locks: DashMap::new(),
                snapshot_lock: Mutex::new(()),
                shipped_goods: AtomicU64::new(0),
                file,
            }),
            max_workers,
        }
    }

    /// Replace the stock of one product directly (bootstrap and tests).
    pub fn set_stock(&self, product: &str, quantity: Qty) {
        self.state
            .inventory
            .write()
            .unwrap()
            .insert(product.to_string(), quantity);
        if let Err(e) = self.state.save() {
            error!(error = %e, "failed to persist inventory");
        }
    }

    pub fn stock(&self, product: &str) -> Qty {
        self.state
            .inventory
            .read()
            .unwrap()
            .get(product)
            .copied()
            .unwrap_or(0)
    }

    pub fn shipped_goods(&self) -> u64 {
        self.state.shipped_goods.load(Ordering::SeqCst)
    }

    /// Accept trader connections until `shutdown` flips.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let workers = Arc::new(Semaphore::new(self.max_workers));
        info!(addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(), "warehouse serving");

        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                },
            };
            debug!(%peer, "trader connected");

            let Ok(permit) = Arc::clone(&workers).acquire_owned().await else {
                break;
            };
            let server = Arc::clone(&self);
            let conn_shutdown = shutdown.clone();
            tokio::spawn(async move {
                server.handle_connection(stream, conn_shutdown).await;
                drop(permit);
            });
        }
        info!("warehouse stopped");
    }

    async fn handle_connection(&self, stream: TcpStream, mut shutdown: watch::Receiver<bool>) {
        let peer = stream.peer_addr().ok();
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        loop {
            let line = tokio::select! {
                _ = shutdown.changed() => break,
                line = lines.next_line() => match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        debug!(peer = ?peer, error = %e, "connection read error");
                        break;
                    }
                },
            };
            if line.is_empty() {
                continue;
            }
            debug!(peer = ?peer, %line, "warehouse received");

            let response = self.handle_command(&line).await;
            if write_half
                .write_all(format!("{}\n", response.encode()).as_bytes())
                .await
                .is_err()
            {
                break;
            }
        }
        debug!(peer = ?peer, "trader disconnected");
    }

    /// Execute one command line against the inventory.
    pub async fn handle_command(&self, line: &str) -> WarehouseResponse {
        let request = match WarehouseRequest::parse(line) {
            Ok(request) => request,
            Err(e) => return WarehouseResponse::error(e.to_string(), "-"),
        };

        match request {
            WarehouseRequest::Buy {
                product,
                quantity,
                request_id,
            } => self.process_buy(&product, quantity, &request_id).await,
            WarehouseRequest::Sell {
                product,
                quantity,
                request_id,
            } => self.process_sell(&product, quantity, &request_id).await,
            WarehouseRequest::FetchInventory { request_id } => self.process_fetch(&request_id),
        }
    }

    async fn process_buy(&self, product: &str, quantity: Qty, request_id: &str) -> WarehouseResponse {
        if !self.state.inventory.read().unwrap().contains_key(product) {
            return WarehouseResponse::error(
                format!("Product {} not available", product),
                request_id,
            );
        }

        let lock = self.state.product_lock(product);
        let _guard = lock.lock().await;

        let sufficient = {
            let mut inventory = self.state.inventory.write().unwrap();
            match inventory.get_mut(product) {
                Some(stock) if *stock >= quantity => {
                    *stock -= quantity;
                    // Shipment counter moves with the stock, under the
                    // same critical section.
                    self.state
                        .shipped_goods
                        .fetch_add(quantity as u64, Ordering::SeqCst);
                    true
                }
                _ => false,
            }
        };

        if !sufficient {
            return WarehouseResponse::error(
                format!("Insufficient inventory for {}", product),
                request_id,
            );
        }

        if let Err(e) = self.state.save() {
            error!(error = %e, "failed to persist inventory after buy");
        }
        info!(product, quantity, "shipped");
        WarehouseResponse::ok(format!("Shipped {} {}(s)", quantity, product), request_id)
    }

    async fn process_sell(&self, product: &str, quantity: Qty, request_id: &str) -> WarehouseResponse {
        let lock = self.state.product_lock(product);
        let _guard = lock.lock().await;

        {
            let mut inventory = self.state.inventory.write().unwrap();
            *inventory.entry(product.to_string()).or_insert(0) += quantity;
        }
        if let Err(e) = self.state.save() {
            error!(error = %e, "failed to persist inventory after sell");
        }
        info!(product, quantity, "stocked");
        WarehouseResponse::ok(format!("Stocked {} {}(s)", quantity, product), request_id)
    }

    fn process_fetch(&self, request_id: &str) -> WarehouseResponse {
        let snapshot = {
            let _guard = self.state.snapshot_lock.lock().unwrap();
            self.state.inventory.read().unwrap().clone()
        };
        match serde_json::to_string(&snapshot) {
            Ok(json) => WarehouseResponse::ok(json, request_id),
            Err(e) => WarehouseResponse::error(e.to_string(), request_id),
        }
    }
}

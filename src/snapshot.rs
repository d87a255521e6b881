//! Trader state snapshot - durable {inventory, earnings}
//!
//! Atomic snapshot with CRC64 checksum verification. The active trader
//! rewrites the snapshot on every inventory mutation; a newly elected
//! leader loads it before announcing, so both the stock records and the
//! commission ledger survive failover.
//!
//! File layout:
//!
//! ```text
//! ┌───────────┬─────────────┬───────────────────────────┐
//! │ magic u32 │ crc64 (LE)  │ bincode(TraderSnapshot)   │
//! └───────────┴─────────────┴───────────────────────────┘
//! ```
//!
//! Protocol: write to `<path>.tmp`, fsync, atomic rename over `<path>`.

use crate::inventory::TraderInventory;
use crc::{CRC_64_ECMA_182, Crc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

const SNAPSHOT_MAGIC: u32 = 0x504d_4b54; // "PMKT"
const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("not a snapshot file (bad magic)")]
    BadMagic,

    #[error("checksum mismatch: stored {stored:#x}, computed {computed:#x}")]
    ChecksumMismatch { stored: u64, computed: u64 },

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Everything a successor leader needs to pick up where its predecessor
/// stopped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraderSnapshot {
    pub inventory: TraderInventory,
    pub earnings: f64,
}

/// Reads and atomically replaces the snapshot at a fixed path.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist a snapshot, replacing any previous one atomically.
    pub fn save(&self, snapshot: &TraderSnapshot) -> Result<(), SnapshotError> {
        let payload = bincode::serialize(snapshot)?;
        let checksum = CRC64.checksum(&payload);

        let tmp = self.path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&SNAPSHOT_MAGIC.to_le_bytes())?;
            file.write_all(&checksum.to_le_bytes())?;
            file.write_all(&payload)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Load and verify the snapshot. A missing file is a fresh start, not
    /// an error.
    pub fn load(&self) -> Result<Option<TraderSnapshot>, SnapshotError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let mut file = File::open(&self.path)?;
        let mut header = [0u8; 12];
        file.read_exact(&mut header)?;

        let magic = u32::from_le_bytes(header[0..4].try_into().unwrap());
        if magic != SNAPSHOT_MAGIC {
            return Err(SnapshotError::BadMagic);
        }
        let stored = u64::from_le_bytes(header[4..12].try_into().unwrap());

        let mut payload = Vec::new();
        file.read_to_end(&mut payload)?;
        let computed = CRC64.checksum(&payload);
        if stored != computed {
            return Err(SnapshotError::ChecksumMismatch { stored, computed });
        }

        let snapshot = bincode::deserialize(&payload)?;
        info!(path = %self.path.display(), "trader snapshot loaded");
        Ok(Some(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VectorClock;
    use std::net::SocketAddr;

    fn temp_store() -> SnapshotStore {
        let path = std::env::temp_dir().join(format!("pmkt-snap-{}.bin", uuid::Uuid::new_v4()));
        SnapshotStore::new(path)
    }

    fn sample_snapshot() -> TraderSnapshot {
        let mut inventory = TraderInventory::new();
        let addr: SocketAddr = "127.0.0.1:6001".parse().unwrap();
        let mut clock = VectorClock::new(3);
        clock.tick(1);
        inventory.merge(1, addr, "fish", 8, clock.clone());
        clock.tick(2);
        inventory.merge(2, addr, "salt", 5, clock);
        TraderSnapshot {
            inventory,
            earnings: 12.5,
        }
    }

    #[test]
    fn test_missing_file_is_fresh_start() {
        let store = temp_store();
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_save_load_round_trip() {
        let store = temp_store();
        let snapshot = sample_snapshot();
        store.save(&snapshot).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded, snapshot);
        let _ = fs::remove_file(store.path());
    }

    #[test]
    fn test_save_replaces_previous() {
        let store = temp_store();
        store.save(&sample_snapshot()).unwrap();

        let mut newer = sample_snapshot();
        newer.earnings = 99.0;
        newer.inventory.fulfill("fish", 8).unwrap();
        store.save(&newer).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded, newer);
        let _ = fs::remove_file(store.path());
    }

    #[test]
    fn test_corruption_detected() {
        let store = temp_store();
        store.save(&sample_snapshot()).unwrap();

        // Flip a payload byte.
        let mut bytes = fs::read(store.path()).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(store.path(), &bytes).unwrap();

        assert!(matches!(
            store.load(),
            Err(SnapshotError::ChecksumMismatch { .. })
        ));
        let _ = fs::remove_file(store.path());
    }
}

//! Durable catalog of zonefile anchors and the peer directory.
//!
//! The catalog is the node's source of truth: one row per zonefile anchor
//! observed in the name ledger, keyed by a dense autoincrement `inv_index`
//! that doubles as the zonefile's bit position (1-based) in the inventory
//! bitmap. The in-memory bitmap is updated in the same critical section as
//! every presence mutation, so the two can never drift.
//!
//! A failed query here means our view of the network is corrupt, which is
//! worse than a crash: runtime query failures abort the process.

use crate::ledger::NameLedger;
use crate::storage::ZonefileStore;
use atlas_core::inventory;
use atlas_core::ZonefileHash;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, error};

const CATALOG_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS zonefiles(
    inv_index INTEGER PRIMARY KEY AUTOINCREMENT,
    zonefile_hash TEXT NOT NULL,
    present INTEGER NOT NULL,
    tried_storage INTEGER NOT NULL,
    block_height INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS zonefile_hash_idx ON zonefiles(zonefile_hash);
CREATE INDEX IF NOT EXISTS zonefile_block_idx ON zonefiles(block_height);

CREATE TABLE IF NOT EXISTS peers(
    peer_index INTEGER PRIMARY KEY AUTOINCREMENT,
    peer_slot INTEGER NOT NULL,
    peer_hostport TEXT UNIQUE NOT NULL,
    discovery_time INTEGER NOT NULL
);
"#;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One zonefile anchor row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZonefileRecord {
    pub inv_index: u64,
    pub hash: ZonefileHash,
    pub present: bool,
    pub tried_storage: bool,
    pub block_height: u64,
}

/// The catalog database plus its in-memory inventory bitmap. Callers share
/// one instance behind the process-wide catalog mutex; methods never block
/// on anything slower than local disk.
pub struct AtlasDb {
    conn: Connection,
    inv: Vec<u8>,
    inv_len_bits: u64,
}

fn db_fatal(context: &str, e: &rusqlite::Error) -> ! {
    error!(error = %e, context, "FATAL: catalog query failed");
    std::process::abort();
}

fn parse_row_hash(raw: &str) -> ZonefileHash {
    match raw.parse() {
        Ok(hash) => hash,
        Err(e) => {
            error!(hash = raw, error = %e, "FATAL: corrupt hash in catalog");
            std::process::abort();
        }
    }
}

impl AtlasDb {
    /// Open (creating if missing) the catalog at `path` and load the
    /// in-memory inventory bitmap.
    pub fn open(path: &Path) -> Result<Self, CatalogError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(CATALOG_SCHEMA)?;

        let mut db = Self {
            conn,
            inv: Vec::new(),
            inv_len_bits: 0,
        };
        db.refresh_inventory_cache();
        debug!(path = %path.display(), bits = db.inv_len_bits, "Opened catalog");
        Ok(db)
    }

    /// In-memory catalog, for tests.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, CatalogError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(CATALOG_SCHEMA)?;
        Ok(Self {
            conn,
            inv: Vec::new(),
            inv_len_bits: 0,
        })
    }

    // ---- zonefile rows -------------------------------------------------

    /// Record a zonefile anchor. The new row gets the next `inv_index`;
    /// the bitmap is updated for every row carrying this hash.
    pub fn add_zonefile(&mut self, hash: &ZonefileHash, present: bool, block_height: u64) {
        self.conn
            .execute(
                "INSERT INTO zonefiles (zonefile_hash, present, tried_storage, block_height) \
                 VALUES (?1, ?2, 0, ?3);",
                params![hash.to_string(), present as i64, block_height as i64],
            )
            .unwrap_or_else(|e| db_fatal("add zonefile", &e));

        let bits = self.get_bits(hash);
        self.inv = if present {
            inventory::set_bits(&self.inv, &bits)
        } else {
            inventory::clear_bits(&self.inv, &bits)
        };
        self.inv_len_bits = self.query_inventory_len();
        // keep padding coherent with the row count
        let need = (self.inv_len_bits as usize + 7) / 8;
        if self.inv.len() < need {
            self.inv.resize(need, 0);
        }
    }

    /// Mark every row with this hash present or absent, update the bitmap,
    /// and return whether the hash was present before.
    pub fn set_present(&mut self, hash: &ZonefileHash, present: bool) -> bool {
        self.conn
            .execute(
                "UPDATE zonefiles SET present = ?1 WHERE zonefile_hash = ?2;",
                params![present as i64, hash.to_string()],
            )
            .unwrap_or_else(|e| db_fatal("set present", &e));

        let bits = self.get_bits(hash);
        let was_present = !bits.is_empty() && inventory::test_bits(&self.inv, &bits);
        self.inv = if present {
            inventory::set_bits(&self.inv, &bits)
        } else {
            inventory::clear_bits(&self.inv, &bits)
        };
        was_present
    }

    /// Note that the storage drivers were consulted for this hash.
    pub fn set_tried_storage(&mut self, hash: &ZonefileHash, tried: bool) {
        self.conn
            .execute(
                "UPDATE zonefiles SET tried_storage = ?1 WHERE zonefile_hash = ?2;",
                params![tried as i64, hash.to_string()],
            )
            .unwrap_or_else(|e| db_fatal("set tried_storage", &e));
    }

    /// Zero-based bitmap positions of every row carrying this hash.
    pub fn get_bits(&self, hash: &ZonefileHash) -> Vec<usize> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT inv_index FROM zonefiles WHERE zonefile_hash = ?1;")
            .unwrap_or_else(|e| db_fatal("get bits", &e));
        let rows = stmt
            .query_map(params![hash.to_string()], |row| row.get::<_, i64>(0))
            .unwrap_or_else(|e| db_fatal("get bits", &e));

        rows.map(|r| match r {
            Ok(idx) => (idx - 1) as usize,
            Err(e) => db_fatal("get bits", &e),
        })
        .collect()
    }

    /// Delete every row anchored at `block_height`. Clears a possibly
    /// partial boundary block before re-syncing from the ledger.
    pub fn zonefile_block_reset(&mut self, block_height: u64) {
        let dropped = self
            .conn
            .execute(
                "DELETE FROM zonefiles WHERE block_height = ?1;",
                params![block_height as i64],
            )
            .unwrap_or_else(|e| db_fatal("block reset", &e));
        debug!(block_height, dropped, "Reset zonefile rows at block");
        self.refresh_inventory_cache();
    }

    /// Synchronize with the ledger: drop the (possibly partial) boundary
    /// block, then re-insert every hash from `start_block` through the tip
    /// in ledger order. Presence is seeded from the blob store.
    pub fn sync_with_ledger(
        &mut self,
        ledger: &dyn NameLedger,
        start_block: u64,
        store: &ZonefileStore,
    ) {
        self.zonefile_block_reset(start_block);

        let tip = ledger.tip_height();
        let mut total = 0usize;
        for height in start_block..=tip {
            for hash in ledger.zonefile_hashes_at(height) {
                let present = store.has(&hash);
                self.conn
                    .execute(
                        "INSERT INTO zonefiles (zonefile_hash, present, tried_storage, block_height) \
                         VALUES (?1, ?2, 0, ?3);",
                        params![hash.to_string(), present as i64, height as i64],
                    )
                    .unwrap_or_else(|e| db_fatal("sync with ledger", &e));
                total += 1;
            }
        }

        self.refresh_inventory_cache();
        debug!(start_block, tip, total, "Synchronized catalog with ledger");
    }

    /// Rows still missing their body, in inventory order.
    pub fn find_missing(&self, offset: u64, limit: u64) -> Vec<ZonefileRecord> {
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT inv_index, zonefile_hash, present, tried_storage, block_height \
                 FROM zonefiles WHERE present = 0 ORDER BY inv_index LIMIT ?1 OFFSET ?2;",
            )
            .unwrap_or_else(|e| db_fatal("find missing", &e));
        let rows = stmt
            .query_map(params![limit as i64, offset as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })
            .unwrap_or_else(|e| db_fatal("find missing", &e));

        rows.map(|r| match r {
            Ok((inv_index, hash, present, tried, height)) => ZonefileRecord {
                inv_index: inv_index as u64,
                hash: parse_row_hash(&hash),
                present: present != 0,
                tried_storage: tried != 0,
                block_height: height as u64,
            },
            Err(e) => db_fatal("find missing", &e),
        })
        .collect()
    }

    /// Rebuild an inventory slice from the table. Bit `i` of the result is
    /// the row with `inv_index == bit_offset + i + 1`; indexes skipped by a
    /// block reset stay zero. Cold path: initialization and verification
    /// only — the hot path serves the in-memory bitmap.
    pub fn make_inventory(&self, bit_offset: u64, bit_length: u64) -> Vec<u8> {
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT inv_index, present FROM zonefiles \
                 WHERE inv_index > ?1 AND inv_index <= ?2 ORDER BY inv_index;",
            )
            .unwrap_or_else(|e| db_fatal("make inventory", &e));
        let rows = stmt
            .query_map(
                params![bit_offset as i64, (bit_offset + bit_length) as i64],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
            )
            .unwrap_or_else(|e| db_fatal("make inventory", &e));

        let mut inv = Vec::new();
        for r in rows {
            let (inv_index, present) = r.unwrap_or_else(|e| db_fatal("make inventory", &e));
            let bit = (inv_index as u64 - 1 - bit_offset) as usize;
            if inv.len() <= bit / 8 {
                inv.resize(bit / 8 + 1, 0);
            }
            if present != 0 {
                inv[bit / 8] |= 1 << (7 - (bit % 8));
            }
        }
        inv
    }

    /// Highest anchored block height, if any rows exist.
    pub fn last_block(&self) -> Option<u64> {
        self.conn
            .query_row("SELECT MAX(block_height) FROM zonefiles;", [], |row| {
                row.get::<_, Option<i64>>(0)
            })
            .unwrap_or_else(|e| db_fatal("last block", &e))
            .map(|h| h as u64)
    }

    /// The local inventory bitmap.
    pub fn inventory(&self) -> &[u8] {
        &self.inv
    }

    /// Inventory length in bits (the highest `inv_index`).
    pub fn inventory_len_bits(&self) -> u64 {
        self.inv_len_bits
    }

    /// Serve a byte range of the in-memory bitmap, clamped to its length.
    pub fn inventory_range(&self, byte_offset: usize, byte_len: usize) -> &[u8] {
        if byte_offset >= self.inv.len() {
            return &[];
        }
        let end = (byte_offset + byte_len).min(self.inv.len());
        &self.inv[byte_offset..end]
    }

    fn query_inventory_len(&self) -> u64 {
        self.conn
            .query_row("SELECT MAX(inv_index) FROM zonefiles;", [], |row| {
                row.get::<_, Option<i64>>(0)
            })
            .unwrap_or_else(|e| db_fatal("inventory length", &e))
            .unwrap_or(0) as u64
    }

    /// Recompute the in-memory bitmap and length from the table.
    pub fn refresh_inventory_cache(&mut self) {
        self.inv_len_bits = self.query_inventory_len();
        self.inv = self.make_inventory(0, self.inv_len_bits);
    }

    // ---- peer directory ------------------------------------------------

    /// Insert (or refresh) a peer row. Slot-eviction decisions happen in
    /// the caller, which must not hold any lock while pinging occupants.
    pub fn insert_peer(&mut self, hostport: &str, slot: u64, discovery_time: u64) {
        debug!(peer = hostport, slot, "Add peer to directory");
        self.conn
            .execute(
                "INSERT OR REPLACE INTO peers (peer_hostport, peer_slot, discovery_time) \
                 VALUES (?1, ?2, ?3);",
                params![hostport, slot as i64, discovery_time as i64],
            )
            .unwrap_or_else(|e| db_fatal("insert peer", &e));
    }

    pub fn remove_peer(&mut self, hostport: &str) {
        debug!(peer = hostport, "Remove peer from directory");
        self.conn
            .execute(
                "DELETE FROM peers WHERE peer_hostport = ?1;",
                params![hostport],
            )
            .unwrap_or_else(|e| db_fatal("remove peer", &e));
    }

    /// Hostports of every row sharing an eviction slot.
    pub fn peers_in_slot(&self, slot: u64) -> Vec<String> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT peer_hostport FROM peers WHERE peer_slot = ?1;")
            .unwrap_or_else(|e| db_fatal("peers in slot", &e));
        let rows = stmt
            .query_map(params![slot as i64], |row| row.get::<_, String>(0))
            .unwrap_or_else(|e| db_fatal("peers in slot", &e));
        rows.map(|r| r.unwrap_or_else(|e| db_fatal("peers in slot", &e)))
            .collect()
    }

    pub fn renew_peer(&mut self, hostport: &str, now: u64) {
        self.conn
            .execute(
                "UPDATE peers SET discovery_time = ?1 WHERE peer_hostport = ?2;",
                params![now as i64, hostport],
            )
            .unwrap_or_else(|e| db_fatal("renew peer", &e));
    }

    /// Peers discovered before `expire_before`, due for revalidation.
    pub fn old_peers(&self, expire_before: u64) -> Vec<String> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT peer_hostport FROM peers WHERE discovery_time < ?1;")
            .unwrap_or_else(|e| db_fatal("old peers", &e));
        let rows = stmt
            .query_map(params![expire_before as i64], |row| row.get::<_, String>(0))
            .unwrap_or_else(|e| db_fatal("old peers", &e));
        rows.map(|r| r.unwrap_or_else(|e| db_fatal("old peers", &e)))
            .collect()
    }

    /// A uniformly random peer from the directory.
    pub fn random_peer(&self) -> Option<String> {
        self.conn
            .query_row(
                "SELECT peer_hostport FROM peers ORDER BY RANDOM() LIMIT 1;",
                [],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .unwrap_or_else(|e| db_fatal("random peer", &e))
    }

    pub fn load_peers(&self) -> Vec<String> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT peer_hostport FROM peers ORDER BY peer_index;")
            .unwrap_or_else(|e| db_fatal("load peers", &e));
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .unwrap_or_else(|e| db_fatal("load peers", &e));
        rows.map(|r| r.unwrap_or_else(|e| db_fatal("load peers", &e)))
            .collect()
    }

    pub fn peer_count(&self) -> u64 {
        self.conn
            .query_row("SELECT COUNT(*) FROM peers;", [], |row| row.get::<_, i64>(0))
            .unwrap_or_else(|e| db_fatal("peer count", &e)) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use atlas_core::hash_zonefile;
    use tempfile::tempdir;

    fn test_store() -> (tempfile::TempDir, ZonefileStore) {
        let dir = tempdir().unwrap();
        let store = ZonefileStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn twelve_present_rows_make_fff0() {
        let mut db = AtlasDb::open_in_memory().unwrap();
        for i in 0..12u32 {
            db.add_zonefile(&hash_zonefile(&i.to_be_bytes()), true, 100);
        }

        assert_eq!(db.inventory_len_bits(), 12);
        assert_eq!(db.make_inventory(0, 12), vec![0xff, 0xf0]);
        assert_eq!(db.inventory(), &[0xff, 0xf0]);
        assert_eq!(
            inventory::to_bit_string(db.inventory()),
            "1111111111110000"
        );
    }

    #[test]
    fn set_present_round_trip_updates_bitmap() {
        let mut db = AtlasDb::open_in_memory().unwrap();
        let h = hash_zonefile(b"zf");
        db.add_zonefile(&h, false, 5);

        let bits = db.get_bits(&h);
        assert_eq!(bits, vec![0]);
        assert!(!inventory::test_bits(db.inventory(), &bits));

        assert!(!db.set_present(&h, true));
        assert!(inventory::test_bits(db.inventory(), &bits));
        assert!(db.set_present(&h, true));

        assert!(db.set_present(&h, false));
        assert!(!inventory::test_bits(db.inventory(), &bits));
    }

    #[test]
    fn duplicate_anchors_share_presence() {
        let mut db = AtlasDb::open_in_memory().unwrap();
        let h = hash_zonefile(b"dup");
        db.add_zonefile(&h, false, 1);
        db.add_zonefile(&hash_zonefile(b"other"), false, 1);
        db.add_zonefile(&h, false, 2);

        assert_eq!(db.get_bits(&h), vec![0, 2]);
        db.set_present(&h, true);
        assert!(inventory::test_bits(db.inventory(), &[0, 2]));
        assert!(!inventory::test_bits(db.inventory(), &[1]));
    }

    #[test]
    fn block_reset_drops_only_that_block_and_indexes_never_reused() {
        let mut db = AtlasDb::open_in_memory().unwrap();
        db.add_zonefile(&hash_zonefile(b"a"), true, 99);
        for body in [b"b" as &[u8], b"c", b"d"] {
            db.add_zonefile(&hash_zonefile(body), true, 100);
        }
        let before = db.inventory_len_bits();
        assert_eq!(before, 4);

        db.zonefile_block_reset(100);
        assert_eq!(db.find_missing(0, 100).len(), 0);
        assert_eq!(db.last_block(), Some(99));

        db.add_zonefile(&hash_zonefile(b"c"), false, 100);
        db.add_zonefile(&hash_zonefile(b"d"), false, 100);

        // new rows take strictly greater indexes than anything seen before
        let c_bits = db.get_bits(&hash_zonefile(b"c"));
        let d_bits = db.get_bits(&hash_zonefile(b"d"));
        assert!(c_bits.iter().all(|&b| b as u64 >= before));
        assert!(d_bits.iter().all(|&b| b as u64 >= before));
        assert_eq!(db.last_block(), Some(100));
    }

    #[test]
    fn sync_with_ledger_seeds_presence_from_store() {
        let (_dir, store) = test_store();
        let mut db = AtlasDb::open_in_memory().unwrap();

        let cached = hash_zonefile(b"cached body");
        store.put(&cached, b"cached body").unwrap();
        let missing = hash_zonefile(b"missing body");

        let mut ledger = MemoryLedger::new("cc");
        ledger.put_block(10, vec![cached, missing]);
        ledger.put_block(11, vec![missing]);

        db.sync_with_ledger(&ledger, 10, &store);

        assert_eq!(db.inventory_len_bits(), 3);
        assert!(inventory::test_bits(db.inventory(), &[0]));
        assert!(!inventory::test_bits(db.inventory(), &[1]));

        let missing_rows = db.find_missing(0, 100);
        assert_eq!(missing_rows.len(), 2);
        assert!(missing_rows.iter().all(|r| r.hash == missing));
    }

    #[test]
    fn resync_resets_boundary_block() {
        let (_dir, store) = test_store();
        let mut db = AtlasDb::open_in_memory().unwrap();

        let mut ledger = MemoryLedger::new("cc");
        ledger.put_block(10, vec![hash_zonefile(b"x"), hash_zonefile(b"y")]);
        db.sync_with_ledger(&ledger, 10, &store);
        assert_eq!(db.inventory_len_bits(), 2);

        // the same boundary block now reports a single hash
        ledger.put_block(10, vec![hash_zonefile(b"x")]);
        db.sync_with_ledger(&ledger, 10, &store);

        assert_eq!(db.find_missing(0, 100).len(), 1);
        assert_eq!(db.get_bits(&hash_zonefile(b"y")), Vec::<usize>::new());
    }

    #[test]
    fn peer_directory_round_trip() {
        let mut db = AtlasDb::open_in_memory().unwrap();
        db.insert_peer("10.0.0.1:20443", 7, 1000);
        db.insert_peer("10.0.0.2:20443", 7, 1001);
        db.insert_peer("10.0.0.3:20443", 8, 2000);

        let mut slot7 = db.peers_in_slot(7);
        slot7.sort();
        assert_eq!(slot7, vec!["10.0.0.1:20443", "10.0.0.2:20443"]);

        assert_eq!(db.old_peers(1001), vec!["10.0.0.1:20443"]);
        db.renew_peer("10.0.0.1:20443", 3000);
        assert!(db.old_peers(1001).is_empty());

        assert_eq!(db.peer_count(), 3);
        assert!(db.random_peer().is_some());

        db.remove_peer("10.0.0.2:20443");
        assert_eq!(db.peer_count(), 2);
        assert_eq!(db.peers_in_slot(7), vec!["10.0.0.1:20443"]);
    }

    #[test]
    fn catalog_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("atlas.db");

        let h = hash_zonefile(b"persisted");
        {
            let mut db = AtlasDb::open(&path).unwrap();
            db.add_zonefile(&h, true, 42);
            db.insert_peer("10.0.0.9:20443", 3, 500);
        }

        let db = AtlasDb::open(&path).unwrap();
        assert_eq!(db.inventory_len_bits(), 1);
        assert!(inventory::test_bits(db.inventory(), &[0]));
        assert_eq!(db.last_block(), Some(42));
        assert_eq!(db.load_peers(), vec!["10.0.0.9:20443"]);
    }
}

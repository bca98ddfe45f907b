//! On-disk zonefile bodies.
//!
//! The blob store is a flat directory of content-addressed files: the body
//! of zonefile `h` lives at `<dir>/<hex(h)>`. Storage drivers are the
//! long-term fallback consulted for zonefiles no peer can serve.

use atlas_core::{hash_zonefile, ZonefileHash};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Zonefile body does not match hash {0}")]
    HashMismatch(ZonefileHash),
}

/// Content-addressed directory of zonefile bodies.
pub struct ZonefileStore {
    dir: PathBuf,
}

impl ZonefileStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, hash: &ZonefileHash) -> PathBuf {
        self.dir.join(hash.to_string())
    }

    pub fn has(&self, hash: &ZonefileHash) -> bool {
        self.path_for(hash).is_file()
    }

    pub fn get(&self, hash: &ZonefileHash) -> Option<Vec<u8>> {
        match std::fs::read(self.path_for(hash)) {
            Ok(body) => Some(body),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(hash = %hash, error = %e, "Failed to read zonefile body");
                None
            }
        }
    }

    /// Store a body under its content address. The body is written to a
    /// temporary file and renamed in place so readers never observe a
    /// partial write.
    pub fn put(&self, hash: &ZonefileHash, body: &[u8]) -> Result<(), StorageError> {
        if !hash.matches(body) {
            return Err(StorageError::HashMismatch(*hash));
        }

        let final_path = self.path_for(hash);
        let tmp_path = self.dir.join(format!(".{}.tmp", hash));

        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(body)?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&tmp_path, &final_path)?;

        debug!(hash = %hash, bytes = body.len(), "Stored zonefile body");
        Ok(())
    }
}

/// Long-term storage fallback for zonefile bodies.
pub trait StorageDriver: Send + Sync {
    fn name(&self) -> &str;

    /// Fetch a zonefile body by hash. `None` when the driver does not hold
    /// it; bodies that fail hash verification are treated as absent.
    fn fetch(&self, hash: &ZonefileHash) -> Option<Vec<u8>>;
}

/// Storage driver backed by a local directory of hash-named files, e.g. an
/// operator-maintained archive or a mounted backup volume.
pub struct DirectoryDriver {
    dir: PathBuf,
}

impl DirectoryDriver {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl StorageDriver for DirectoryDriver {
    fn name(&self) -> &str {
        "directory"
    }

    fn fetch(&self, hash: &ZonefileHash) -> Option<Vec<u8>> {
        let body = std::fs::read(self.dir.join(hash.to_string())).ok()?;
        if hash_zonefile(&body) != *hash {
            warn!(hash = %hash, "Storage driver returned a corrupt zonefile body");
            return None;
        }
        Some(body)
    }
}

/// Fetch `hash` from the first driver that holds it.
pub fn fetch_from_drivers(
    drivers: &[Box<dyn StorageDriver>],
    hash: &ZonefileHash,
) -> Option<Vec<u8>> {
    for driver in drivers {
        if let Some(body) = driver.fetch(hash) {
            debug!(hash = %hash, driver = driver.name(), "Loaded zonefile from storage");
            return Some(body);
        }
    }
    None
}

/// Where the blob store lives under the node data directory.
pub fn zonefile_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("zonefiles")
}

#[cfg(test)]
mod tests {
    use super::*;
    use atlas_core::hash_zonefile;
    use tempfile::tempdir;

    #[test]
    fn put_get_round_trip() {
        let dir = tempdir().unwrap();
        let store = ZonefileStore::open(dir.path()).unwrap();

        let body = b"$ORIGIN example.id\n";
        let hash = hash_zonefile(body);

        assert!(!store.has(&hash));
        assert!(store.get(&hash).is_none());

        store.put(&hash, body).unwrap();
        assert!(store.has(&hash));
        assert_eq!(store.get(&hash).unwrap(), body);
    }

    #[test]
    fn put_rejects_mismatched_body() {
        let dir = tempdir().unwrap();
        let store = ZonefileStore::open(dir.path()).unwrap();

        let hash = hash_zonefile(b"expected");
        assert!(matches!(
            store.put(&hash, b"different"),
            Err(StorageError::HashMismatch(_))
        ));
        assert!(!store.has(&hash));
    }

    #[test]
    fn directory_driver_verifies_bodies() {
        let dir = tempdir().unwrap();
        let body = b"zonefile body";
        let hash = hash_zonefile(body);
        std::fs::write(dir.path().join(hash.to_string()), body).unwrap();

        let good = hash_zonefile(b"other");
        std::fs::write(dir.path().join(good.to_string()), b"corrupted").unwrap();

        let driver = DirectoryDriver::new(dir.path());
        assert_eq!(driver.fetch(&hash).unwrap(), body);
        assert!(driver.fetch(&good).is_none());
        assert!(driver.fetch(&hash_zonefile(b"missing")).is_none());
    }
}

//! Snapshot persistence.
//!
//! Two artifacts live in the cache directory:
//! - `index.fingerprint`: the fingerprint as plain hex text
//! - `index.bin.zst`: the snapshot, postcard-encoded and zstd-compressed
//!
//! Both are written to a temp file in the same directory and renamed into
//! place. Anything that fails to read back is a cache miss.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::{IndexError, Result};
use crate::fingerprint::Fingerprint;
use crate::state::IndexSnapshot;

/// Cache format version - increment when changing the format.
pub const SNAPSHOT_VERSION: u32 = 2;

pub const FINGERPRINT_FILE: &str = "index.fingerprint";
pub const SNAPSHOT_FILE: &str = "index.bin.zst";

/// zstd level used for snapshots.
const COMPRESSION_LEVEL: i32 = 6;

/// On-disk layout. Written through [`StorageRef`] to avoid cloning the
/// snapshot; both must keep the same field order.
#[derive(Deserialize)]
struct PersistentStorage {
    version: u32,
    fingerprint: Fingerprint,
    builder_key: u64,
    snapshot: IndexSnapshot,
}

#[derive(Serialize)]
struct StorageRef<'a> {
    version: u32,
    fingerprint: Fingerprint,
    builder_key: u64,
    snapshot: &'a IndexSnapshot,
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn fingerprint_path(&self) -> PathBuf {
        self.dir.join(FINGERPRINT_FILE)
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_FILE)
    }

    /// Writes the snapshot, then the fingerprint.
    ///
    /// The fingerprint goes last so a crash in between leaves a fingerprint
    /// that no longer matches the snapshot, which reads back as a miss.
    /// `builder_key` identifies the builder settings the snapshot was built
    /// with (see [`EngineConfig::builder_key`](crate::config::EngineConfig::builder_key)).
    pub fn save(
        &self,
        fingerprint: Fingerprint,
        builder_key: u64,
        snapshot: &IndexSnapshot,
    ) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|error| {
            IndexError::Internal(format!(
                "failed to create cache directory {}: {error}",
                self.dir.display()
            ))
        })?;

        let storage = StorageRef {
            version: SNAPSHOT_VERSION,
            fingerprint,
            builder_key,
            snapshot,
        };

        let snapshot_path = self.snapshot_path();
        self.write_atomic(&snapshot_path, |output| {
            let mut encoder = zstd::Encoder::new(output, COMPRESSION_LEVEL).map_err(|error| {
                IndexError::Serialization(format!("failed to create zstd encoder: {error}"))
            })?;
            let threads = std::thread::available_parallelism()
                .map(|count| count.get() as u32)
                .unwrap_or(4);
            encoder.multithread(threads).map_err(|error| {
                IndexError::Serialization(format!("failed to enable multi-threaded zstd: {error}"))
            })?;
            let mut writer = BufWriter::new(encoder);
            postcard::to_io(&storage, &mut writer).map_err(|error| {
                IndexError::Serialization(format!("failed to encode snapshot: {error}"))
            })?;
            let encoder = writer.into_inner().map_err(|error| {
                IndexError::Serialization(format!("failed to flush snapshot: {}", error.error()))
            })?;
            encoder.finish()?;
            Ok(())
        })?;

        self.write_atomic(&self.fingerprint_path(), |output| {
            writeln!(output, "{fingerprint}")?;
            Ok(())
        })?;

        tracing::debug!(
            "wrote index snapshot to {} ({} roots, fingerprint={})",
            snapshot_path.display(),
            snapshot.roots.len(),
            fingerprint
        );
        Ok(())
    }

    fn write_atomic(
        &self,
        target: &Path,
        write: impl FnOnce(&mut File) -> Result<()>,
    ) -> Result<()> {
        let mut temp = NamedTempFile::new_in(&self.dir)?;
        write(temp.as_file_mut())?;
        temp.as_file().sync_all()?;
        temp.persist(target).map_err(|error| {
            IndexError::Internal(format!(
                "failed to finalize {}: {}",
                target.display(),
                error.error
            ))
        })?;
        Ok(())
    }

    /// Reads only the fingerprint artifact.
    pub fn load_fingerprint(&self) -> Option<Fingerprint> {
        let path = self.fingerprint_path();
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == ErrorKind::NotFound => return None,
            Err(error) => {
                tracing::warn!("fingerprint read failed for {}: {}", path.display(), error);
                return None;
            }
        };
        match raw.parse() {
            Ok(fingerprint) => Some(fingerprint),
            Err(error) => {
                tracing::warn!("fingerprint in {} is corrupt: {}", path.display(), error);
                None
            }
        }
    }

    /// Loads the persisted snapshot. Missing or corrupt artifacts, and
    /// snapshots built under another `builder_key`, are `None`.
    pub fn load(&self, builder_key: u64) -> Option<(Fingerprint, IndexSnapshot)> {
        let fingerprint = self.load_fingerprint()?;
        let path = self.snapshot_path();

        let input = match File::open(&path) {
            Ok(file) => file,
            Err(error) if error.kind() == ErrorKind::NotFound => return None,
            Err(error) => {
                tracing::warn!("snapshot read failed for {}: {}", path.display(), error);
                return None;
            }
        };
        let decoder = match zstd::Decoder::new(input) {
            Ok(decoder) => decoder,
            Err(error) => {
                tracing::warn!("snapshot decompress failed for {}: {}", path.display(), error);
                return None;
            }
        };
        let mut input = BufReader::new(decoder);
        let mut scratch = vec![0u8; 4 * 1024];
        let storage: PersistentStorage = match postcard::from_io((&mut input, &mut scratch)) {
            Ok((storage, _)) => storage,
            Err(error) => {
                tracing::warn!("snapshot decode failed for {}: {}", path.display(), error);
                return None;
            }
        };

        if storage.version != SNAPSHOT_VERSION {
            tracing::debug!(
                "snapshot version mismatch: {} != {}",
                storage.version,
                SNAPSHOT_VERSION
            );
            return None;
        }
        if storage.builder_key != builder_key {
            tracing::debug!(
                "snapshot builder settings changed ({:016x} != {:016x})",
                storage.builder_key,
                builder_key
            );
            return None;
        }
        if storage.fingerprint != fingerprint {
            tracing::debug!(
                "snapshot fingerprint {} does not match {}",
                storage.fingerprint,
                fingerprint
            );
            return None;
        }

        let mut snapshot = storage.snapshot;
        snapshot.fingerprint = Some(fingerprint);
        tracing::debug!(
            "loaded index snapshot from {} ({} roots, fingerprint={})",
            path.display(),
            snapshot.roots.len(),
            fingerprint
        );
        Some((fingerprint, snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{IndexState, Leaf, PathNode};
    use tempfile::TempDir;

    const KEY: u64 = 7;

    fn snapshot(fingerprint: Fingerprint) -> IndexSnapshot {
        let mut state = IndexState::new();
        let mut photos = PathNode::directory();
        photos.insert(
            &["trip".to_string(), "a.jpg".to_string()],
            Leaf::new("/media/photos/trip/a.jpg").with_classification(Some("image/jpeg".into())),
        );
        state.insert("photos".into(), photos);
        IndexSnapshot::new(Some(fingerprint), state, 42)
    }

    #[test]
    fn save_then_load_restores_snapshot() {
        let temp = TempDir::new().unwrap();
        let store = SnapshotStore::new(temp.path().join("cache"));
        let fingerprint = Fingerprint(0xabc);
        let original = snapshot(fingerprint);

        store.save(fingerprint, KEY, &original).unwrap();
        assert_eq!(store.load_fingerprint(), Some(fingerprint));
        assert_eq!(
            fs::read_to_string(store.fingerprint_path()).unwrap(),
            "0000000000000abc\n"
        );

        let (loaded_fp, loaded) = store.load(KEY).unwrap();
        assert_eq!(loaded_fp, fingerprint);
        assert_eq!(loaded, original);
    }

    #[test]
    fn missing_cache_is_absent() {
        let temp = TempDir::new().unwrap();
        let store = SnapshotStore::new(temp.path());
        assert!(store.load_fingerprint().is_none());
        assert!(store.load(KEY).is_none());
    }

    #[test]
    fn corrupt_snapshot_is_absent() {
        let temp = TempDir::new().unwrap();
        let store = SnapshotStore::new(temp.path());
        store.save(Fingerprint(1), KEY, &snapshot(Fingerprint(1))).unwrap();
        fs::write(store.snapshot_path(), b"definitely not zstd").unwrap();

        assert_eq!(store.load_fingerprint(), Some(Fingerprint(1)));
        assert!(store.load(KEY).is_none());
    }

    #[test]
    fn corrupt_fingerprint_is_absent() {
        let temp = TempDir::new().unwrap();
        let store = SnapshotStore::new(temp.path());
        store.save(Fingerprint(1), KEY, &snapshot(Fingerprint(1))).unwrap();
        fs::write(store.fingerprint_path(), b"not hex").unwrap();

        assert!(store.load_fingerprint().is_none());
        assert!(store.load(KEY).is_none());
    }

    #[test]
    fn mismatched_fingerprint_file_is_a_miss() {
        let temp = TempDir::new().unwrap();
        let store = SnapshotStore::new(temp.path());
        store.save(Fingerprint(1), KEY, &snapshot(Fingerprint(1))).unwrap();
        fs::write(store.fingerprint_path(), "0000000000000002\n").unwrap();

        assert!(store.load(KEY).is_none());
    }

    #[test]
    fn snapshot_from_other_builder_settings_is_a_miss() {
        let temp = TempDir::new().unwrap();
        let store = SnapshotStore::new(temp.path());
        store.save(Fingerprint(1), KEY, &snapshot(Fingerprint(1))).unwrap();

        assert_eq!(store.load_fingerprint(), Some(Fingerprint(1)));
        assert!(store.load(KEY + 1).is_none());
        assert!(store.load(KEY).is_some());
    }

    #[test]
    fn save_overwrites_previous_snapshot() {
        let temp = TempDir::new().unwrap();
        let store = SnapshotStore::new(temp.path());
        store.save(Fingerprint(1), KEY, &snapshot(Fingerprint(1))).unwrap();
        let empty = IndexSnapshot::new(Some(Fingerprint(2)), IndexState::new(), 7);
        store.save(Fingerprint(2), KEY, &empty).unwrap();

        let (fingerprint, loaded) = store.load(KEY).unwrap();
        assert_eq!(fingerprint, Fingerprint(2));
        assert!(loaded.is_empty());
    }
}

//! File-backed link store
//!
//! Records are plain files whose names encode the link (see `link.rs`),
//! bucketed into date-shard directories. Writes are never destructive:
//! a logical update mints a new version, a logical delete copies the
//! current payload to a new tombstoned version. Object payloads are
//! zstd-compressed on disk; callers always see the raw bytes.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, error, warn};
use sha2::{Digest, Sha256};

use super::collection::LinkCollection;
use super::link::{
    self, RecordId, RecordKind, VersionedLink, TEMP_EXTENSION,
};

/// Storage abstraction the reconciliation engine drives.
///
/// `put` and `remove` report failure as `false` rather than an error so
/// callers can degrade gracefully; the cause is logged at the call site.
pub trait LinkStore: Send + Sync {
    /// Mint a link with a fresh version token and, when a creation time is
    /// given, a date-derived shard directory. Writes nothing.
    fn new_link(
        &self,
        id: RecordId,
        kind: RecordKind,
        created_at: Option<DateTime<Utc>>,
    ) -> VersionedLink;

    /// Read the exact version's payload. Fails if the version is absent.
    fn get(&self, link: &VersionedLink) -> Result<Vec<u8>>;

    /// Write the payload for exactly this link, atomically. A path
    /// collision is a logic error (version tokens make paths unique) and
    /// is reported as failure, never as a silent overwrite.
    fn put(&self, link: &VersionedLink, data: &[u8]) -> bool;

    /// With `as_new_version`, copy the payload to a new tombstoned
    /// version, preserving the original bytes under history. Without it,
    /// hard-delete the underlying file (token/cache cleanup only).
    fn remove(&self, link: &VersionedLink, as_new_version: bool) -> bool;

    /// Walk the whole storage root and parse every file name back into a
    /// link. Unparseable names are skipped; stray temp files from an
    /// interrupted write are deleted on sight.
    fn find(&self) -> LinkCollection;

    /// Atomic rename from one link's path to another's, used to attach a
    /// computed property without rewriting payload bytes. Fails if the
    /// destination already exists.
    fn modify(&self, link: &VersionedLink, to_link: &VersionedLink) -> bool;

    /// Recompute the payload hash and attach it to the link's properties
    /// via `modify`. Returns the renamed link.
    fn content_hash_add(&self, link: &VersionedLink) -> Result<VersionedLink>;

    /// Verify the recorded content hash against the stored payload.
    /// `None` when the link has no recorded hash.
    fn content_hash_check(&self, link: &VersionedLink) -> Result<Option<bool>>;
}

/// Digest of payload bytes: `"s"` + lowercase hex sha256.
pub fn content_hash_of(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    format!("s{digest:x}")
}

/// [`LinkStore`] over a local directory tree.
pub struct FileLinkStore {
    root: PathBuf,
    compression_level: i32,
}

impl FileLinkStore {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).context("Failed to create storage root directory")?;
        Ok(Self {
            root,
            compression_level: 3,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn read_payload(&self, link: &VersionedLink) -> Result<Vec<u8>> {
        let path = link.path();
        let bytes =
            fs::read(&path).with_context(|| format!("Failed to read record {}", path.display()))?;
        match link.kind() {
            RecordKind::Object => {
                let mut decoder = zstd::Decoder::new(bytes.as_slice())?;
                let mut decompressed = Vec::new();
                decoder
                    .read_to_end(&mut decompressed)
                    .with_context(|| format!("Failed to decompress record {}", path.display()))?;
                Ok(decompressed)
            }
            RecordKind::Metadata => Ok(bytes),
        }
    }

    fn write_file(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let parent = path.parent().context("Record path has no parent")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create shard directory {}", parent.display()))?;

        let temp_path = temp_path_for(path);
        let result = (|| -> Result<()> {
            fs::write(&temp_path, bytes)
                .with_context(|| format!("Failed to write temp file {}", temp_path.display()))?;
            fs::rename(&temp_path, path).with_context(|| {
                format!(
                    "Failed to rename {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            })?;
            Ok(())
        })();
        if result.is_err() {
            let _ = fs::remove_file(&temp_path);
        }
        result
    }

    fn walk(&self, dir: &Path, out: &mut Vec<VersionedLink>) {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Directory scan failed {}: {}", dir.display(), e);
                return;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                self.walk(&path, out);
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.ends_with(&format!(".{TEMP_EXTENSION}")) {
                debug!("Temporary file {}, removing it", path.display());
                if let Err(e) = fs::remove_file(&path) {
                    warn!("Temporary file remove failed {}: {}", path.display(), e);
                }
                continue;
            }
            match VersionedLink::from_file_name(dir, name) {
                Some(link) => out.push(link),
                None => debug!("Skipping unparseable file name {}", path.display()),
            }
        }
    }
}

impl LinkStore for FileLinkStore {
    fn new_link(
        &self,
        id: RecordId,
        kind: RecordKind,
        created_at: Option<DateTime<Utc>>,
    ) -> VersionedLink {
        let dir = link::date_shard(&self.root, created_at);
        VersionedLink::new(id, kind, dir).with_version(link::new_version_token())
    }

    fn get(&self, link: &VersionedLink) -> Result<Vec<u8>> {
        self.read_payload(link)
    }

    fn put(&self, link: &VersionedLink, data: &[u8]) -> bool {
        let path = link.path();
        debug!("Put record {}", path.display());
        if path.exists() {
            error!("Record put refused, path already exists: {}", path.display());
            return false;
        }
        let stored = match link.kind() {
            RecordKind::Object => match zstd::encode_all(data, self.compression_level) {
                Ok(compressed) => compressed,
                Err(e) => {
                    error!("Record compress failed {}: {}", path.display(), e);
                    return false;
                }
            },
            RecordKind::Metadata => data.to_vec(),
        };
        match self.write_file(&path, &stored) {
            Ok(()) => {
                debug!("{} put successfully", path.display());
                true
            }
            Err(e) => {
                error!("Record put failed {}: {:#}", path.display(), e);
                false
            }
        }
    }

    fn remove(&self, link: &VersionedLink, as_new_version: bool) -> bool {
        if !as_new_version {
            let path = link.path();
            if path.exists() {
                if let Err(e) = fs::remove_file(&path) {
                    error!("Record delete failed {}: {}", path.display(), e);
                    return false;
                }
            }
            return true;
        }

        let tombstone = link
            .clone()
            .with_deleted()
            .with_version(link::new_version_token());
        match self.get(link) {
            Ok(data) => self.put(&tombstone, &data),
            Err(e) => {
                error!(
                    "Tombstone copy failed {} -> {}: {:#}",
                    link.path().display(),
                    tombstone.path().display(),
                    e
                );
                false
            }
        }
    }

    fn find(&self) -> LinkCollection {
        let mut links = Vec::new();
        self.walk(&self.root, &mut links);
        LinkCollection::new(links)
    }

    fn modify(&self, link: &VersionedLink, to_link: &VersionedLink) -> bool {
        let from = link.path();
        let to = to_link.path();
        if to.exists() {
            error!(
                "Modify refused ({}): destination already exists ({})",
                from.display(),
                to.display()
            );
            return false;
        }
        if let Err(e) = fs::rename(&from, &to) {
            error!(
                "Record rename failed {} -> {}: {}",
                from.display(),
                to.display(),
                e
            );
            return false;
        }
        true
    }

    fn content_hash_add(&self, link: &VersionedLink) -> Result<VersionedLink> {
        let data = self.get(link)?;
        let to_link = link.clone().with_content_hash(content_hash_of(&data));
        if self.modify(link, &to_link) {
            Ok(to_link)
        } else {
            anyhow::bail!("Attaching content hash failed ({})", link.path().display())
        }
    }

    fn content_hash_check(&self, link: &VersionedLink) -> Result<Option<bool>> {
        let Some(recorded) = link.content_hash() else {
            return Ok(None);
        };
        let data = self.get(link)?;
        Ok(Some(content_hash_of(&data) == recorded))
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".{TEMP_EXTENSION}"));
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn store(dir: &Path) -> FileLinkStore {
        FileLinkStore::new(dir.join("backup")).unwrap()
    }

    #[test]
    fn test_put_get_round_trip() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        let link = store.new_link(RecordId::item("m1"), RecordKind::Object, None);
        let data = b"raw message bytes";
        assert!(store.put(&link, data));

        assert_eq!(store.get(&link).unwrap(), data);
    }

    #[test]
    fn test_object_payload_is_compressed_on_disk() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        let data = "A compressible line of text. ".repeat(500);
        let link = store.new_link(RecordId::item("m1"), RecordKind::Object, None);
        assert!(store.put(&link, data.as_bytes()));

        let on_disk = fs::metadata(link.path()).unwrap().len();
        assert!(on_disk < data.len() as u64);
        assert_eq!(store.get(&link).unwrap(), data.as_bytes());
    }

    #[test]
    fn test_put_refuses_existing_path() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        let link = store.new_link(RecordId::item("m1"), RecordKind::Metadata, None);
        assert!(store.put(&link, b"{}"));
        assert!(!store.put(&link, b"{}"));
    }

    #[test]
    fn test_get_missing_version_fails() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        let link = store.new_link(RecordId::item("nope"), RecordKind::Metadata, None);
        assert!(store.get(&link).is_err());
    }

    #[test]
    fn test_date_sharded_path() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        let created = Utc.with_ymd_and_hms(2023, 1, 15, 8, 0, 0).unwrap();
        let link = store.new_link(RecordId::item("m1"), RecordKind::Metadata, Some(created));
        assert!(store.put(&link, b"{}"));
        assert!(link.path().starts_with(store.root().join("2023").join("01-15")));

        let found = store.find();
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn test_tombstone_preserves_history() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        let link = store.new_link(RecordId::item("m1"), RecordKind::Object, None);
        assert!(store.put(&link, b"payload"));

        // version tokens are millisecond epoch; make sure the tombstone
        // gets a strictly newer one
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(store.remove(&link, true));

        let found = store.find();
        assert_eq!(found.len(), 2);

        let latest = found.find(|l| l.id() == &RecordId::item("m1")).unwrap();
        assert!(latest.is_deleted());

        // original bytes still retrievable by the exact old link
        assert_eq!(store.get(&link).unwrap(), b"payload");
        // tombstone carries the copied payload too
        assert_eq!(store.get(latest).unwrap(), b"payload");
    }

    #[test]
    fn test_hard_delete_removes_file() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        let link = store.new_link(RecordId::item("m1"), RecordKind::Metadata, None);
        assert!(store.put(&link, b"{}"));
        assert!(store.remove(&link, false));
        assert!(store.find().is_empty());
        // removing again is not an error
        assert!(store.remove(&link, false));
    }

    #[test]
    fn test_find_purges_temp_files() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        let stray = store.root().join("m1.metadata=.mutation=1.json.tmp");
        fs::write(&stray, b"partial").unwrap();
        fs::write(store.root().join("garbage"), b"x").unwrap();

        let found = store.find();
        assert!(found.is_empty());
        assert!(!stray.exists());
    }

    #[test]
    fn test_modify_refuses_existing_destination() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        let a = store.new_link(RecordId::item("m1"), RecordKind::Metadata, None);
        assert!(store.put(&a, b"{}"));
        let b = a.clone().with_content_hash("sabc");
        assert!(store.put(&b, b"{}"));

        assert!(!store.modify(&a, &b));
    }

    #[test]
    fn test_content_hash_add_and_check() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        let link = store.new_link(RecordId::item("m1"), RecordKind::Object, None);
        assert!(store.put(&link, b"payload"));
        assert_eq!(store.content_hash_check(&link).unwrap(), None);

        let hashed = store.content_hash_add(&link).unwrap();
        assert_eq!(hashed.content_hash(), Some(content_hash_of(b"payload").as_str()));
        assert_eq!(store.content_hash_check(&hashed).unwrap(), Some(true));

        // the old name is gone, the payload moved under the hashed name
        assert!(store.get(&link).is_err());
        assert_eq!(store.get(&hashed).unwrap(), b"payload");
    }

    #[test]
    fn test_content_hash_detects_corruption() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        let link = store.new_link(RecordId::item("m1"), RecordKind::Object, None);
        assert!(store.put(&link, b"payload"));
        let hashed = store.content_hash_add(&link).unwrap();

        // corrupt the stored bytes behind the store's back
        let corrupted = zstd::encode_all(&b"tampered"[..], 3).unwrap();
        fs::write(hashed.path(), corrupted).unwrap();

        assert_eq!(store.content_hash_check(&hashed).unwrap(), Some(false));
    }
}

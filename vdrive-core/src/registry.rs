//! Persisted registry of virtual drives.
//!
//! The registry is one JSON document mapping drive names to [`DriveRecord`]s. Writers replace
//! the document atomically (temp file + rename) and all access is serialized through an
//! advisory `flock` on a sidecar `<registry>.lock` file. The lock is host-local and has no
//! effect across network filesystems.

use crate::record::DriveRecord;
use nix::fcntl::{flock, FlockArg};
use serde::{Deserialize, Serialize};
use std::collections::btree_map::{self, BTreeMap};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::ops::{Deref, DerefMut};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use vdrive_error::{DriveError, DriveResult};

/// In-memory view of the registry document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Registry {
    drives: BTreeMap<String, DriveRecord>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&DriveRecord> {
        self.drives.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut DriveRecord> {
        self.drives.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.drives.contains_key(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, record: DriveRecord) -> Option<DriveRecord> {
        self.drives.insert(name.into(), record)
    }

    pub fn remove(&mut self, name: &str) -> Option<DriveRecord> {
        self.drives.remove(name)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, DriveRecord> {
        self.drives.iter()
    }

    pub fn len(&self) -> usize {
        self.drives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drives.is_empty()
    }

    /// Name of the drive currently mounted at `mount_point`, if any.
    pub fn mount_point_owner(&self, mount_point: &Path) -> Option<&str> {
        self.drives
            .iter()
            .find(|(_, record)| {
                record
                    .attachment()
                    .is_some_and(|a| a.mount_point == mount_point)
            })
            .map(|(name, _)| name.as_str())
    }
}

impl<'a> IntoIterator for &'a Registry {
    type Item = (&'a String, &'a DriveRecord);
    type IntoIter = btree_map::Iter<'a, String, DriveRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.drives.iter()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockMode {
    Shared,
    Exclusive,
}

/// Held `flock` on the registry's lock file; released on drop.
#[derive(Debug)]
struct RegistryLock {
    file: File,
    path: PathBuf,
}

impl RegistryLock {
    fn acquire(path: &Path, mode: LockMode) -> io::Result<Self> {
        // A shared lock needs only read access, so readers work on a registry they cannot write.
        let file = match mode {
            LockMode::Shared => match File::open(path) {
                Ok(file) => file,
                Err(err) if err.kind() == io::ErrorKind::NotFound => Self::create(path)?,
                Err(err) => return Err(err),
            },
            LockMode::Exclusive => Self::create(path)?,
        };

        let arg = match mode {
            LockMode::Shared => FlockArg::LockShared,
            LockMode::Exclusive => FlockArg::LockExclusive,
        };
        flock(file.as_raw_fd(), arg).map_err(io::Error::from)?;
        log::debug!("acquired {:?} registry lock {}", mode, path.display());

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl RegistryLock {
    fn create(path: &Path) -> io::Result<File> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)
    }
}

impl Drop for RegistryLock {
    fn drop(&mut self) {
        // Closing the descriptor releases the lock as well; unlock explicitly for clarity.
        let _ = flock(self.file.as_raw_fd(), FlockArg::Unlock);
        log::debug!("released registry lock {}", self.path.display());
    }
}

/// Durable, lock-protected storage for a [`Registry`].
#[derive(Debug, Clone)]
pub struct RegistryStore {
    path: PathBuf,
}

impl RegistryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the registry under a shared lock. A missing file is an empty registry.
    pub fn load(&self) -> DriveResult<Registry> {
        let _lock = self.lock(LockMode::Shared)?;
        self.read_unlocked()
    }

    /// Replace the registry under an exclusive lock.
    pub fn save(&self, registry: &Registry) -> DriveResult<()> {
        let _lock = self.lock(LockMode::Exclusive)?;
        self.write_unlocked(registry)
    }

    /// Start a read-modify-write transaction.
    ///
    /// The exclusive lock is held until the returned value is dropped, so preconditions checked
    /// against it cannot go stale before [`RegistryTxn::commit`].
    pub fn begin(&self) -> DriveResult<RegistryTxn<'_>> {
        let lock = self.lock(LockMode::Exclusive)?;
        let registry = self.read_unlocked()?;
        Ok(RegistryTxn {
            store: self,
            registry,
            _lock: lock,
        })
    }

    fn lock_path(&self) -> PathBuf {
        sibling_path(&self.path, "lock")
    }

    fn lock(&self, mode: LockMode) -> DriveResult<RegistryLock> {
        let lock_path = self.lock_path();
        RegistryLock::acquire(&lock_path, mode).map_err(|source| DriveError::RegistryIo {
            path: lock_path,
            source,
        })
    }

    fn io_err(&self, source: io::Error) -> DriveError {
        DriveError::RegistryIo {
            path: self.path.clone(),
            source,
        }
    }

    fn read_unlocked(&self) -> DriveResult<Registry> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Registry::new()),
            Err(err) => return Err(self.io_err(err)),
        };
        serde_json::from_str(&content).map_err(|source| DriveError::CorruptRegistry {
            path: self.path.clone(),
            source,
        })
    }

    fn write_unlocked(&self, registry: &Registry) -> DriveResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;
        }

        let mut payload = serde_json::to_string_pretty(registry).map_err(|source| {
            DriveError::CorruptRegistry {
                path: self.path.clone(),
                source,
            }
        })?;
        payload.push('\n');

        let tmp_path = sibling_path(&self.path, "tmp");
        let tmp_err = |source: io::Error| DriveError::RegistryIo {
            path: tmp_path.clone(),
            source,
        };
        let mut file = File::create(&tmp_path).map_err(tmp_err)?;
        let written = file
            .write_all(payload.as_bytes())
            .and_then(|()| file.sync_all())
            .map_err(tmp_err)
            .and_then(|()| fs::rename(&tmp_path, &self.path).map_err(|e| self.io_err(e)));
        if let Err(err) = written {
            if let Err(cleanup) = fs::remove_file(&tmp_path) {
                log::warn!("could not remove {}: {}", tmp_path.display(), cleanup);
            }
            return Err(err);
        }

        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = File::open(parent) {
                dir.sync_all().ok();
            }
        }

        log::debug!(
            "saved registry {} ({} drives)",
            self.path.display(),
            registry.len()
        );
        Ok(())
    }
}

/// A registry loaded under the exclusive lock.
///
/// Dereferences to [`Registry`]. Changes are persisted by [`RegistryTxn::commit`], which may be
/// called more than once; uncommitted changes are discarded on drop.
pub struct RegistryTxn<'a> {
    store: &'a RegistryStore,
    registry: Registry,
    _lock: RegistryLock,
}

impl RegistryTxn<'_> {
    pub fn commit(&self) -> DriveResult<()> {
        self.store.write_unlocked(&self.registry)
    }
}

impl Deref for RegistryTxn<'_> {
    type Target = Registry;

    fn deref(&self) -> &Registry {
        &self.registry
    }
}

impl DerefMut for RegistryTxn<'_> {
    fn deref_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }
}

fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("registry.json");
    path.with_file_name(format!("{}.{}", file_name, suffix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Attachment;
    use tempfile::tempdir;

    fn sample() -> Registry {
        let mut registry = Registry::new();
        registry.insert("vol1", DriveRecord::new("/root/vol1.img"));
        let mut mounted = DriveRecord::new("/root/vol2.img");
        mounted.attach(Attachment {
            loop_device: "/dev/loop4".to_string(),
            mount_point: PathBuf::from("/mnt/v2"),
        });
        registry.insert("vol2", mounted);
        registry
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempdir().unwrap();
        let store = RegistryStore::new(dir.path().join("vdrive.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let store = RegistryStore::new(dir.path().join("vdrive.json"));
        let registry = sample();

        store.save(&registry).unwrap();
        assert_eq!(store.load().unwrap(), registry);
    }

    #[test]
    fn save_leaves_no_temp_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vdrive.json");
        let store = RegistryStore::new(&path);

        store.save(&sample()).unwrap();
        assert!(path.exists());
        assert!(!dir.path().join("vdrive.json.tmp").exists());
    }

    #[test]
    fn reads_legacy_document() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vdrive.json");
        fs::write(
            &path,
            r#"{
  "vol1": {"path": "/root/vol1.img"},
  "vol2": {"path": "/root/vol2.img", "loop": "/dev/loop4", "mount_point": "/mnt/v2"}
}"#,
        )
        .unwrap();

        let registry = RegistryStore::new(&path).load().unwrap();
        assert_eq!(registry, sample());
        assert_eq!(registry.mount_point_owner(Path::new("/mnt/v2")), Some("vol2"));
        assert_eq!(registry.mount_point_owner(Path::new("/mnt/v1")), None);
    }

    #[test]
    fn unparsable_file_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vdrive.json");
        fs::write(&path, "{ not json").unwrap();

        let err = RegistryStore::new(&path).load().unwrap_err();
        assert!(matches!(err, DriveError::CorruptRegistry { .. }));
    }

    #[test]
    fn uncommitted_transaction_is_discarded() {
        let dir = tempdir().unwrap();
        let store = RegistryStore::new(dir.path().join("vdrive.json"));
        store.save(&sample()).unwrap();

        {
            let mut txn = store.begin().unwrap();
            txn.remove("vol1");
        }
        assert!(store.load().unwrap().contains("vol1"));

        {
            let mut txn = store.begin().unwrap();
            txn.remove("vol1");
            txn.commit().unwrap();
        }
        assert!(!store.load().unwrap().contains("vol1"));
    }

    #[test]
    fn load_only_needs_read_access_to_lock_file() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let path = dir.path().join("vdrive.json");
        let store = RegistryStore::new(&path);
        store.save(&sample()).unwrap();

        let lock_path = dir.path().join("vdrive.json.lock");
        fs::set_permissions(&lock_path, fs::Permissions::from_mode(0o444)).unwrap();
        assert_eq!(store.load().unwrap(), sample());
    }

    #[test]
    fn failed_write_names_temp_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vdrive.json");
        let tmp = dir.path().join("vdrive.json.tmp");
        fs::create_dir(&tmp).unwrap();

        let err = RegistryStore::new(&path).save(&sample()).unwrap_err();
        assert!(matches!(err, DriveError::RegistryIo { path: ref p, .. } if *p == tmp));
        assert!(!path.exists());
    }

    #[test]
    fn failed_rename_removes_temp_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vdrive.json");
        // A non-empty directory cannot be replaced by a file.
        fs::create_dir(&path).unwrap();
        fs::write(path.join("keep"), b"").unwrap();

        let err = RegistryStore::new(&path).save(&sample()).unwrap_err();
        assert!(matches!(err, DriveError::RegistryIo { path: ref p, .. } if *p == path));
        assert!(!dir.path().join("vdrive.json.tmp").exists());
        assert!(path.join("keep").exists());
    }
}

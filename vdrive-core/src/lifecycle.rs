//! Drive lifecycle transactions.
//!
//! Every mutating operation runs under the registry's exclusive lock for its whole
//! read-modify-write span. External steps are registered on a [`Rollback`] as they succeed and
//! undone in reverse order if a later step (including the registry commit) fails, so the
//! registry only ever describes what actually happened on the host.

use crate::config::{absolute, Settings};
use crate::record::{validate_name, Attachment, DriveRecord};
use crate::registry::{RegistryStore, RegistryTxn};
use serde::Serialize;
use std::path::{Path, PathBuf};
use vdrive_error::{DriveError, DriveResult, HalError, HalResult};
use vdrive_hal::{DriveHal, Rollback, DEFAULT_FSTYPE};

const MIB: u64 = 1024 * 1024;

/// One line of `list` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriveSummary {
    pub name: String,
    pub image_path: PathBuf,
    pub attachment: Option<Attachment>,
    pub image_present: bool,
}

impl DriveSummary {
    pub fn status(&self) -> &'static str {
        if self.attachment.is_some() {
            "mounted"
        } else {
            "unmounted"
        }
    }
}

/// Runs `body`, keeping its completed steps on success and compensating them on failure.
fn with_rollback<'h, T>(
    body: impl FnOnce(&mut Rollback<'h>) -> DriveResult<T>,
) -> DriveResult<T> {
    let mut rollback = Rollback::new();
    match body(&mut rollback) {
        Ok(value) => {
            rollback.commit();
            Ok(value)
        }
        Err(err) => {
            let failures = rollback.run();
            if failures.is_empty() {
                Err(err)
            } else {
                Err(DriveError::RollbackIncomplete {
                    source: Box::new(err),
                    failures,
                })
            }
        }
    }
}

/// Lifecycle controller for virtual drives.
pub struct DriveManager<'a, H: DriveHal + ?Sized> {
    hal: &'a H,
    store: RegistryStore,
    settings: Settings,
}

impl<'a, H: DriveHal + ?Sized> DriveManager<'a, H> {
    pub fn new(hal: &'a H, settings: Settings) -> Self {
        Self {
            hal,
            store: RegistryStore::new(settings.registry_path.clone()),
            settings,
        }
    }

    pub fn store(&self) -> &RegistryStore {
        &self.store
    }

    fn check_privilege(&self) -> DriveResult<()> {
        self.hal
            .check_privilege()
            .map_err(DriveError::PermissionDenied)
    }

    /// Create and format a sparse image of `size_mb` MiB and register it unattached.
    pub fn create(&self, name: &str, size_mb: u64) -> DriveResult<PathBuf> {
        validate_name(name)?;
        let size_bytes = size_mb
            .checked_mul(MIB)
            .filter(|bytes| *bytes > 0)
            .ok_or(DriveError::InvalidSize(size_mb))?;

        let mut txn = self.store.begin()?;
        if txn.contains(name) {
            return Err(DriveError::DuplicateName(name.to_string()));
        }
        self.check_privilege()?;

        let hal = self.hal;
        let image = self.settings.image_path(name);
        log::info!("creating {} at {} ({} MB)", name, image.display(), size_mb);

        with_rollback(|rollback| {
            hal.allocate_image(&image, size_bytes)
                .map_err(|source| DriveError::Io {
                    path: image.clone(),
                    source,
                })?;
            let created = image.clone();
            rollback.push(format!("remove {}", created.display()), move || {
                hal.remove_image(&created)
            });

            hal.format_image(&image)
                .map_err(|source| DriveError::Format {
                    path: image.clone(),
                    source,
                })?;

            txn.insert(name, DriveRecord::new(&image));
            txn.commit()
        })?;

        log::info!("created {}", name);
        Ok(image)
    }

    /// Report every registered drive. Never mutates the registry.
    pub fn list(&self) -> DriveResult<Vec<DriveSummary>> {
        let registry = self.store.load()?;
        Ok(registry
            .iter()
            .map(|(name, record)| DriveSummary {
                name: name.clone(),
                image_path: record.image_path().to_path_buf(),
                attachment: record.attachment().cloned(),
                image_present: self.hal.image_exists(record.image_path()),
            })
            .collect())
    }

    /// Attach the drive's image to a free loop device and mount it at `mount_point`.
    pub fn mount(&self, name: &str, mount_point: &Path) -> DriveResult<Attachment> {
        let mut txn = self.store.begin()?;
        let record = txn
            .get(name)
            .ok_or_else(|| DriveError::NotFound(name.to_string()))?;
        if let Some(attachment) = record.attachment() {
            return Err(DriveError::AlreadyMounted {
                name: name.to_string(),
                mount_point: attachment.mount_point.clone(),
            });
        }
        let image = record.image_path().to_path_buf();

        let requested = absolute(mount_point).map_err(|source| DriveError::Io {
            path: mount_point.to_path_buf(),
            source: HalError::Io(source),
        })?;
        // Stored resolved, so aliases of one directory compare equal.
        let mount_point = self
            .hal
            .resolve_path(&requested)
            .map_err(|source| DriveError::Io {
                path: requested.clone(),
                source,
            })?;
        if let Some(owner) = txn.mount_point_owner(&mount_point) {
            return Err(DriveError::MountPointInUse {
                mount_point,
                owner: owner.to_string(),
            });
        }

        self.check_privilege()?;
        if !self.hal.image_exists(&image) {
            return Err(DriveError::ImageMissing {
                name: name.to_string(),
                path: image,
            });
        }

        let hal = self.hal;
        let attachment = with_rollback(|rollback| {
            let created = hal
                .prepare_mount_point(&mount_point)
                .map_err(|source| DriveError::Io {
                    path: mount_point.clone(),
                    source,
                })?;
            if created {
                let dir = mount_point.clone();
                rollback.push(format!("remove mount point {}", dir.display()), move || {
                    hal.remove_mount_point(&dir)
                });
            }

            let device = hal.find_free_loop().map_err(DriveError::NoDeviceAvailable)?;
            hal.attach_loop(&device, &image)
                .map_err(|source| DriveError::Attach {
                    device: device.clone(),
                    image: image.clone(),
                    source,
                })?;
            let attached = device.clone();
            rollback.push(format!("detach {}", attached), move || {
                hal.detach_loop(&attached)
            });

            hal.mount_device(Path::new(&device), &mount_point, DEFAULT_FSTYPE)
                .map_err(|source| DriveError::Mount {
                    device: device.clone(),
                    mount_point: mount_point.clone(),
                    source,
                })?;
            let mounted = mount_point.clone();
            rollback.push(format!("unmount {}", mounted.display()), move || {
                hal.unmount(&mounted)
            });

            let attachment = Attachment {
                loop_device: device,
                mount_point: mount_point.clone(),
            };
            txn.get_mut(name)
                .ok_or_else(|| DriveError::NotFound(name.to_string()))?
                .attach(attachment.clone());
            txn.commit()?;
            Ok(attachment)
        })?;

        log::info!(
            "mounted {} at {} ({})",
            name,
            attachment.mount_point.display(),
            attachment.loop_device
        );
        Ok(attachment)
    }

    /// Unmount the drive and release its loop device.
    pub fn unmount(&self, name: &str) -> DriveResult<Attachment> {
        let mut txn = self.store.begin()?;
        let record = txn
            .get(name)
            .ok_or_else(|| DriveError::NotFound(name.to_string()))?;
        if !record.is_attached() {
            return Err(DriveError::NotMounted(name.to_string()));
        }
        self.check_privilege()?;
        self.unmount_in(&mut txn, name)
    }

    /// Whether `device` is still bound to `image`. After a restart the recorded device may be
    /// free or back some other file.
    fn holds_image(&self, device: &str, image: &Path) -> HalResult<bool> {
        match self.hal.loop_backing_file(device)? {
            Some(backing) => Ok(backing == image || backing == self.hal.resolve_path(image)?),
            None => Ok(false),
        }
    }

    /// Unmount step shared by `unmount` and `delete`; the caller holds the transaction.
    fn unmount_in(&self, txn: &mut RegistryTxn<'_>, name: &str) -> DriveResult<Attachment> {
        let record = txn
            .get(name)
            .ok_or_else(|| DriveError::NotFound(name.to_string()))?;
        let attachment = record
            .attachment()
            .cloned()
            .ok_or_else(|| DriveError::NotMounted(name.to_string()))?;
        let image = record.image_path().to_path_buf();
        let hal = self.hal;
        let mount_point = attachment.mount_point.clone();
        let device = attachment.loop_device.clone();

        let held = self
            .holds_image(&device, &image)
            .map_err(|source| DriveError::Io {
                path: PathBuf::from(&device),
                source,
            })?;

        let mut mounted = false;
        if held {
            mounted = hal
                .is_mounted(&mount_point)
                .map_err(|source| DriveError::Unmount {
                    mount_point: mount_point.clone(),
                    source,
                })?;
            if mounted {
                hal.unmount(&mount_point)
                    .map_err(|source| DriveError::Unmount {
                        mount_point: mount_point.clone(),
                        source,
                    })?;
            } else {
                // Left over from an earlier DetachFailed; only the loop device remains.
                log::warn!(
                    "{} is not mounted, detaching {} only",
                    mount_point.display(),
                    device
                );
            }

            // No compensation for a failed detach: the filesystem stays unmounted and the
            // record keeps the attachment so the detach can be retried.
            hal.detach_loop(&device)
                .map_err(|source| DriveError::DetachFailed {
                    device: device.clone(),
                    source,
                })?;
        } else {
            log::warn!(
                "{} no longer backs {}, clearing stale attachment of {}",
                device,
                image.display(),
                name
            );
        }

        with_rollback(|rollback| {
            if held {
                // Pushed in reverse of the order they must run: re-attach, then remount.
                if mounted {
                    let (dev, dir) = (device.clone(), mount_point.clone());
                    rollback.push(format!("remount {}", dir.display()), move || {
                        hal.mount_device(Path::new(&dev), &dir, DEFAULT_FSTYPE)
                    });
                }
                let (dev, img) = (device.clone(), image.clone());
                rollback.push(format!("re-attach {}", dev), move || {
                    hal.attach_loop(&dev, &img)
                });
            }

            if let Some(record) = txn.get_mut(name) {
                record.detach();
            }
            txn.commit()
        })?;

        log::info!("unmounted {} from {}", name, mount_point.display());
        Ok(attachment)
    }

    /// Remove the drive's image and registry entry, unmounting it first when attached.
    pub fn delete(&self, name: &str) -> DriveResult<()> {
        let mut txn = self.store.begin()?;
        let attached = txn
            .get(name)
            .ok_or_else(|| DriveError::NotFound(name.to_string()))?
            .is_attached();
        self.check_privilege()?;

        if attached {
            log::info!("{} is mounted, unmounting before delete", name);
            self.unmount_in(&mut txn, name)?;
        }

        // Drop the record first: a failed commit then leaves the image untouched.
        let record = txn
            .remove(name)
            .ok_or_else(|| DriveError::NotFound(name.to_string()))?;
        txn.commit()?;

        let image = record.image_path().to_path_buf();
        if !self.hal.image_exists(&image) {
            log::warn!(
                "backing image {} was already removed",
                image.display()
            );
        } else if let Err(source) = self.hal.remove_image(&image) {
            let err = DriveError::RemoveImage {
                path: image.clone(),
                source,
            };
            txn.insert(name, record);
            if let Err(restore) = txn.commit() {
                return Err(DriveError::RollbackIncomplete {
                    source: Box::new(err),
                    failures: vec![format!("restore registry entry '{}': {}", name, restore)],
                });
            }
            return Err(err);
        }

        log::info!("deleted {}", name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, TempDir};
    use vdrive_hal::{FailPoint, FakeHal, ImageOps, Operation};

    fn setup() -> (TempDir, FakeHal, Settings) {
        let dir = tempdir().unwrap();
        let settings = Settings {
            registry_path: dir.path().join("vdrive.json"),
            image_dir: dir.path().join("images"),
        };
        (dir, FakeHal::new(), settings)
    }

    #[test]
    fn create_rejects_zero_size_without_touching_host() {
        let (_dir, hal, settings) = setup();
        let manager = DriveManager::new(&hal, settings);

        let err = manager.create("vol1", 0).unwrap_err();
        assert!(matches!(err, DriveError::InvalidSize(0)));
        assert_eq!(hal.operation_count(), 0);
    }

    #[test]
    fn create_duplicate_performs_no_host_calls() {
        let (_dir, hal, settings) = setup();
        let manager = DriveManager::new(&hal, settings);
        manager.create("vol1", 10).unwrap();
        hal.clear_operations();

        let err = manager.create("vol1", 10).unwrap_err();
        assert!(matches!(err, DriveError::DuplicateName(ref n) if n == "vol1"));
        assert_eq!(hal.operation_count(), 0);
    }

    #[test]
    fn create_allocates_requested_size() {
        let (_dir, hal, settings) = setup();
        let manager = DriveManager::new(&hal, settings);

        let image = manager.create("vol1", 100).unwrap();
        assert_eq!(hal.image_size(&image), Some(100 * MIB));
        assert!(hal.has_operation(|op| matches!(op, Operation::FormatImage { .. })));
    }

    #[test]
    fn create_requires_privilege() {
        let (_dir, hal, settings) = setup();
        hal.fail_on(FailPoint::Privilege);
        let manager = DriveManager::new(&hal, settings);

        let err = manager.create("vol1", 10).unwrap_err();
        assert!(matches!(err, DriveError::PermissionDenied(_)));
        assert!(manager.list().unwrap().is_empty());
    }

    #[test]
    fn mount_point_claimed_by_other_drive_is_refused() {
        let (_dir, hal, settings) = setup();
        let manager = DriveManager::new(&hal, settings);
        manager.create("vol1", 10).unwrap();
        manager.create("vol2", 10).unwrap();
        manager.mount("vol1", Path::new("/mnt/shared")).unwrap();

        let err = manager.mount("vol2", Path::new("/mnt/shared")).unwrap_err();
        assert!(matches!(err, DriveError::MountPointInUse { ref owner, .. } if owner == "vol1"));
    }

    #[test]
    fn mount_without_free_loop_device_leaves_nothing_behind() {
        let (_dir, hal, settings) = setup();
        let manager = DriveManager::new(&hal, settings);
        manager.create("vol1", 10).unwrap();
        hal.fail_on(FailPoint::FindFreeLoop);

        let err = manager.mount("vol1", Path::new("/mnt/v1")).unwrap_err();
        assert!(matches!(err, DriveError::NoDeviceAvailable(_)));
        assert!(hal.has_operation(|op| matches!(op, Operation::RemoveMountPoint { .. })));
        assert!(manager.list().unwrap()[0].attachment.is_none());
    }

    #[test]
    fn mount_reports_missing_image() {
        let (_dir, hal, settings) = setup();
        let manager = DriveManager::new(&hal, settings);
        let image = manager.create("vol1", 10).unwrap();
        hal.forget_image(&image);

        let err = manager.mount("vol1", Path::new("/mnt/v1")).unwrap_err();
        assert!(matches!(err, DriveError::ImageMissing { .. }));
        assert!(!manager.list().unwrap()[0].image_present);
    }

    #[test]
    fn failed_rollback_is_reported() {
        let (_dir, hal, settings) = setup();
        let manager = DriveManager::new(&hal, settings);
        manager.create("vol1", 10).unwrap();
        hal.fail_on(FailPoint::Mount);
        hal.fail_on(FailPoint::DetachLoop);

        let err = manager.mount("vol1", Path::new("/mnt/v1")).unwrap_err();
        match err {
            DriveError::RollbackIncomplete { source, failures } => {
                assert!(matches!(*source, DriveError::Mount { .. }));
                assert_eq!(failures.len(), 1);
                assert!(failures[0].starts_with("detach /dev/loop0"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unmount_failure_keeps_attachment() {
        let (_dir, hal, settings) = setup();
        let manager = DriveManager::new(&hal, settings);
        manager.create("vol1", 10).unwrap();
        manager.mount("vol1", Path::new("/mnt/v1")).unwrap();
        hal.fail_on(FailPoint::Unmount);

        let err = manager.unmount("vol1").unwrap_err();
        assert!(matches!(err, DriveError::Unmount { .. }));
        assert!(manager.list().unwrap()[0].attachment.is_some());
        assert_eq!(hal.attached_loops().len(), 1);
    }

    #[test]
    fn delete_tolerates_missing_image() {
        let (_dir, hal, settings) = setup();
        let manager = DriveManager::new(&hal, settings);
        let image = manager.create("vol1", 10).unwrap();
        hal.forget_image(&image);

        manager.delete("vol1").unwrap();
        assert!(manager.list().unwrap().is_empty());
    }

    #[test]
    fn delete_restores_record_when_image_removal_fails() {
        let (_dir, hal, settings) = setup();
        let manager = DriveManager::new(&hal, settings);
        let image = manager.create("vol1", 10).unwrap();
        hal.fail_on(FailPoint::RemoveImage);

        let err = manager.delete("vol1").unwrap_err();
        assert!(matches!(err, DriveError::RemoveImage { .. }));
        assert!(hal.image_exists(&image));
        assert_eq!(manager.list().unwrap().len(), 1);
    }

    #[test]
    fn relative_mount_point_is_stored_absolute() {
        let (_dir, hal, settings) = setup();
        let manager = DriveManager::new(&hal, settings);
        manager.create("vol1", 10).unwrap();

        let attachment = manager.mount("vol1", Path::new("mnt/v1")).unwrap();
        assert!(attachment.mount_point.is_absolute());
        assert!(attachment.mount_point.ends_with("mnt/v1"));
    }

    #[test]
    fn aliased_mount_point_is_stored_resolved() {
        let (_dir, hal, settings) = setup();
        hal.add_symlink("/srv/link", "/mnt/v1");
        let manager = DriveManager::new(&hal, settings);
        manager.create("vol1", 10).unwrap();

        let attachment = manager.mount("vol1", Path::new("/srv/link")).unwrap();
        assert_eq!(attachment.mount_point, PathBuf::from("/mnt/v1"));

        hal.clear_operations();
        manager.unmount("vol1").unwrap();
        assert!(hal.has_operation(|op| matches!(
            op,
            Operation::Unmount { target } if target == Path::new("/mnt/v1")
        )));
        assert!(hal.attached_loops().is_empty());
    }

    #[test]
    fn mount_point_alias_of_claimed_directory_is_refused() {
        let (_dir, hal, settings) = setup();
        hal.add_symlink("/srv/link", "/mnt/v1");
        let manager = DriveManager::new(&hal, settings);
        manager.create("vol1", 10).unwrap();
        manager.create("vol2", 10).unwrap();
        manager.mount("vol1", Path::new("/mnt/v1")).unwrap();

        for alias in ["/mnt/x/../v1", "/mnt/./v1/", "/srv/link"] {
            let err = manager.mount("vol2", Path::new(alias)).unwrap_err();
            assert!(
                matches!(err, DriveError::MountPointInUse { ref owner, .. } if owner == "vol1"),
                "{alias}: {err}"
            );
        }
        assert!(manager.list().unwrap()[1].attachment.is_none());
    }
}

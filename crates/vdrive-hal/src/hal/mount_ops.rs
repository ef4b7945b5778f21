//! Mount operations trait.

use crate::HalResult;
use std::path::{Path, PathBuf};

/// Filesystem created by `format_image` and passed to `mount_device`.
pub const DEFAULT_FSTYPE: &str = "ext4";

/// Trait for mounting and unmounting filesystems.
pub trait MountOps {
    /// Make sure `target` exists as a directory, creating parents as needed.
    ///
    /// Returns `true` when the directory was created by this call.
    fn prepare_mount_point(&self, target: &Path) -> HalResult<bool>;

    /// Remove an empty mount point directory.
    fn remove_mount_point(&self, target: &Path) -> HalResult<()>;

    /// Mount a device to a target path.
    ///
    /// # Arguments
    /// * `device` - Device path (e.g., `/dev/loop0`)
    /// * `target` - Mount point path
    /// * `fstype` - Filesystem type (e.g., `"ext4"`)
    fn mount_device(&self, device: &Path, target: &Path, fstype: &str) -> HalResult<()>;

    /// Unmount a filesystem.
    fn unmount(&self, target: &Path) -> HalResult<()>;

    /// Check if a path is currently mounted. Symlinks and `..` in `path` are resolved first.
    fn is_mounted(&self, path: &Path) -> HalResult<bool>;

    /// Resolve symlinks and `.`/`..` in an absolute `path`.
    ///
    /// The path does not have to exist: trailing components that are missing are applied
    /// lexically onto the deepest existing ancestor.
    fn resolve_path(&self, path: &Path) -> HalResult<PathBuf>;
}

use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type HalResult<T> = Result<T, HalError>;
pub type DriveResult<T> = Result<T, DriveError>;

/// Failures reported by the block/mount gateway.
#[derive(Error, Debug)]
pub enum HalError {
    #[error("Device or mount point is busy")]
    Busy,

    #[error("Permission denied")]
    PermissionDenied,

    #[error("No free loop device available")]
    NoDeviceAvailable,

    #[error("Command not found: {0}")]
    CommandNotFound(String),

    #[error("Command failed: {program} (exit={code:?}): {stderr}")]
    CommandFailed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Command timed out: {program} after {timeout_secs}s")]
    CommandTimeout { program: String, timeout_secs: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("nix errno: {0}")]
    Nix(#[from] nix::errno::Errno),
}

/// Failures reported by the drive lifecycle operations.
#[derive(Error, Debug)]
pub enum DriveError {
    #[error("Virtual drive '{0}' already exists")]
    DuplicateName(String),

    #[error("Virtual drive '{0}' not found")]
    NotFound(String),

    #[error("Virtual drive '{name}' is already mounted at {}", mount_point.display())]
    AlreadyMounted { name: String, mount_point: PathBuf },

    #[error("Virtual drive '{0}' is not mounted")]
    NotMounted(String),

    #[error("Permission denied: this command requires root privileges")]
    PermissionDenied(#[source] HalError),

    #[error("Invalid drive name '{0}': use letters, digits, '.', '_' or '-'")]
    InvalidName(String),

    #[error("Invalid size {0} MB: size must be greater than zero")]
    InvalidSize(u64),

    #[error("Backing image for '{name}' is missing: {}", path.display())]
    ImageMissing { name: String, path: PathBuf },

    #[error("Mount point {} is already used by drive '{owner}'", mount_point.display())]
    MountPointInUse { mount_point: PathBuf, owner: String },

    #[error("Registry {} is corrupt: {source}", path.display())]
    CorruptRegistry {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Registry I/O error on {}: {source}", path.display())]
    RegistryIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: HalError,
    },

    #[error("Failed to format image {}: {source}", path.display())]
    Format {
        path: PathBuf,
        #[source]
        source: HalError,
    },

    #[error("Cannot allocate a loop device: {0}")]
    NoDeviceAvailable(#[source] HalError),

    #[error("Failed to attach {} to {device}: {source}", image.display())]
    Attach {
        device: String,
        image: PathBuf,
        #[source]
        source: HalError,
    },

    #[error("Filesystem unmounted but failed to detach {device}: {source} (retry unmount)")]
    DetachFailed {
        device: String,
        #[source]
        source: HalError,
    },

    #[error("Failed to mount {device} at {}: {source}", mount_point.display())]
    Mount {
        device: String,
        mount_point: PathBuf,
        #[source]
        source: HalError,
    },

    #[error("Failed to unmount {}: {source}", mount_point.display())]
    Unmount {
        mount_point: PathBuf,
        #[source]
        source: HalError,
    },

    #[error("Failed to remove image {}: {source}", path.display())]
    RemoveImage {
        path: PathBuf,
        #[source]
        source: HalError,
    },

    #[error("{source}; rollback incomplete: {}", failures.join("; "))]
    RollbackIncomplete {
        #[source]
        source: Box<DriveError>,
        failures: Vec<String>,
    },
}

impl DriveError {
    /// True when the host is left in a state the administrator can finish by retrying.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DriveError::DetachFailed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detach_failed_is_recoverable() {
        let err = DriveError::DetachFailed {
            device: "/dev/loop3".to_string(),
            source: HalError::Busy,
        };
        assert!(err.is_recoverable());
        assert!(err.to_string().contains("/dev/loop3"));
        assert!(!DriveError::NotMounted("vol1".to_string()).is_recoverable());
    }

    #[test]
    fn rollback_incomplete_lists_failures() {
        let err = DriveError::RollbackIncomplete {
            source: Box::new(DriveError::Mount {
                device: "/dev/loop0".to_string(),
                mount_point: PathBuf::from("/mnt/v1"),
                source: HalError::Nix(nix::errno::Errno::EINVAL),
            }),
            failures: vec!["detach /dev/loop0: Device or mount point is busy".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("Failed to mount /dev/loop0"));
        assert!(msg.contains("detach /dev/loop0"));
    }
}

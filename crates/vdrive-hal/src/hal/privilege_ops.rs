use crate::HalResult;

/// Privilege checks for operations that need root.
pub trait PrivilegeOps {
    /// Returns `HalError::PermissionDenied` unless the caller may format, attach and mount.
    fn check_privilege(&self) -> HalResult<()>;
}

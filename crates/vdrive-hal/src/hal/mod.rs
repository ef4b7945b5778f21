//! HAL trait definitions and implementations.
//!
//! This module defines the gateway traits for host operations and provides
//! both real (LinuxHal) and fake (FakeHal) implementations.

pub mod fake_hal;
pub mod guards;
pub mod image_ops;
pub mod linux_hal;
pub mod loop_ops;
pub mod mount_ops;
pub mod privilege_ops;

pub use fake_hal::{FailPoint, FakeHal, Operation};
pub use guards::Rollback;
pub use image_ops::ImageOps;
pub use linux_hal::LinuxHal;
pub use loop_ops::LoopOps;
pub use mount_ops::{MountOps, DEFAULT_FSTYPE};
pub use privilege_ops::PrivilegeOps;

/// Complete gateway combining all host operation traits.
pub trait DriveHal: ImageOps + LoopOps + MountOps + PrivilegeOps + Send + Sync {}

/// Automatically implement DriveHal for any type implementing all required traits.
impl<T> DriveHal for T where T: ImageOps + LoopOps + MountOps + PrivilegeOps + Send + Sync {}

//! vdrive hardware abstraction layer.
//!
//! Every operation that touches the host (image files, loop devices, mounts, privileges) goes
//! through the traits in [`hal`] so the lifecycle logic can be exercised against [`FakeHal`].

pub mod hal;
pub mod procfs;

pub use hal::*;
pub use vdrive_error::{HalError, HalResult};

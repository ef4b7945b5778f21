//! Loop device operations (losetup).

use crate::HalResult;
use std::path::{Path, PathBuf};

pub trait LoopOps {
    /// Ask the kernel for an unused loop device, returning its path (e.g. `/dev/loop7`).
    ///
    /// Nothing is reserved: another process may claim the device before [`LoopOps::attach_loop`].
    fn find_free_loop(&self) -> HalResult<String>;

    /// Bind `image` to `loop_device`.
    fn attach_loop(&self, loop_device: &str, image: &Path) -> HalResult<()>;

    /// Detach a loop device.
    fn detach_loop(&self, loop_device: &str) -> HalResult<()>;

    /// Image currently bound to `loop_device`, or `None` when the device is free.
    fn loop_backing_file(&self, loop_device: &str) -> HalResult<Option<PathBuf>>;
}

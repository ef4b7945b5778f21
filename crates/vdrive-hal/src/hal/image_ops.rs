//! Backing image operations (sparse allocation, mkfs).

use crate::HalResult;
use std::path::Path;

pub trait ImageOps {
    /// Create a new sparse file of `size_bytes` at `path`.
    ///
    /// Fails if something already exists at `path`; an existing file is never truncated.
    fn allocate_image(&self, path: &Path, size_bytes: u64) -> HalResult<()>;

    /// Create the default filesystem inside the image file.
    fn format_image(&self, path: &Path) -> HalResult<()>;

    fn remove_image(&self, path: &Path) -> HalResult<()>;

    fn image_exists(&self, path: &Path) -> bool;
}

//! Fake HAL implementation for testing.
//!
//! Images, loop devices and mounts are modelled in memory and every call is recorded, so
//! lifecycle logic can be tested without root privileges or kernel state. Individual calls can
//! be made to fail with [`FakeHal::fail_on`].

use super::{ImageOps, LoopOps, MountOps, PrivilegeOps};
use crate::{HalError, HalResult};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Operation records for testing and verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    AllocateImage { path: PathBuf, size_bytes: u64 },
    FormatImage { path: PathBuf },
    RemoveImage { path: PathBuf },
    FindFreeLoop { loop_device: String },
    AttachLoop { loop_device: String, image: PathBuf },
    DetachLoop { loop_device: String },
    PrepareMountPoint { target: PathBuf, created: bool },
    RemoveMountPoint { target: PathBuf },
    Mount { device: PathBuf, target: PathBuf, fstype: String },
    Unmount { target: PathBuf },
    CheckPrivilege,
}

/// Gateway calls that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    AllocateImage,
    FormatImage,
    RemoveImage,
    FindFreeLoop,
    AttachLoop,
    DetachLoop,
    Mount,
    Unmount,
    Privilege,
}

const LOOP_DEVICE_COUNT: usize = 8;

/// Shared state for FakeHal operations.
#[derive(Debug, Clone, Default)]
struct FakeHalState {
    operations: Vec<Operation>,
    images: HashMap<PathBuf, u64>,
    directories: HashSet<PathBuf>,
    /// loop device -> bound image
    loops: BTreeMap<String, PathBuf>,
    /// mount point -> device
    mounts: HashMap<PathBuf, PathBuf>,
    /// link -> absolute target
    symlinks: HashMap<PathBuf, PathBuf>,
    failures: HashSet<FailPoint>,
    loop_device_limit: Option<usize>,
}

/// Fake HAL implementation that simulates host state without executing anything.
///
/// Clones share state, so a test can keep a handle while the controller owns another.
#[derive(Debug, Clone, Default)]
pub struct FakeHal {
    state: Arc<Mutex<FakeHalState>>,
}

impl FakeHal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call of the given kind fail.
    pub fn fail_on(&self, point: FailPoint) {
        self.state.lock().unwrap().failures.insert(point);
    }

    /// Let calls of the given kind succeed again.
    pub fn clear_failure(&self, point: FailPoint) {
        self.state.lock().unwrap().failures.remove(&point);
    }

    /// Restrict the number of loop devices the fake kernel exposes.
    pub fn set_loop_device_limit(&self, limit: usize) {
        self.state.lock().unwrap().loop_device_limit = Some(limit);
    }

    /// Get all recorded operations.
    pub fn operations(&self) -> Vec<Operation> {
        self.state.lock().unwrap().operations.clone()
    }

    /// Get the number of operations recorded.
    pub fn operation_count(&self) -> usize {
        self.state.lock().unwrap().operations.len()
    }

    /// Check if a specific operation was recorded.
    pub fn has_operation(&self, check: impl Fn(&Operation) -> bool) -> bool {
        self.state.lock().unwrap().operations.iter().any(check)
    }

    /// Clear recorded operations, keeping the simulated host state.
    pub fn clear_operations(&self) {
        self.state.lock().unwrap().operations.clear();
    }

    /// Loop devices currently bound, with their images.
    pub fn attached_loops(&self) -> Vec<(String, PathBuf)> {
        self.state
            .lock()
            .unwrap()
            .loops
            .iter()
            .map(|(dev, image)| (dev.clone(), image.clone()))
            .collect()
    }

    /// Size of a simulated image, if it exists.
    pub fn image_size(&self, path: &Path) -> Option<u64> {
        self.state.lock().unwrap().images.get(path).copied()
    }

    /// Pretend an image file was deleted behind the registry's back.
    pub fn forget_image(&self, path: &Path) {
        self.state.lock().unwrap().images.remove(path);
    }

    /// Make `link` resolve to the absolute path `target`.
    pub fn add_symlink(&self, link: impl Into<PathBuf>, target: impl Into<PathBuf>) {
        self.state
            .lock()
            .unwrap()
            .symlinks
            .insert(link.into(), target.into());
    }

    /// Drop every loop binding and mount, as a host restart would. Images survive.
    pub fn simulate_reboot(&self) {
        let mut state = self.state.lock().unwrap();
        state.loops.clear();
        state.mounts.clear();
    }

    fn record_operation(&self, op: Operation) {
        self.state.lock().unwrap().operations.push(op);
    }

    fn check(&self, point: FailPoint, err: impl FnOnce() -> HalError) -> HalResult<()> {
        if self.state.lock().unwrap().failures.contains(&point) {
            log::info!("FAKE HAL: injected failure at {:?}", point);
            return Err(err());
        }
        Ok(())
    }
}

fn resolve_in(symlinks: &HashMap<PathBuf, PathBuf>, path: &Path) -> PathBuf {
    let mut resolved = PathBuf::from("/");
    for component in path.components() {
        match component {
            Component::ParentDir => {
                resolved.pop();
            }
            Component::Normal(part) => {
                resolved.push(part);
                if let Some(target) = symlinks.get(&resolved) {
                    resolved = target.clone();
                }
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    resolved
}

fn injected(program: &str) -> HalError {
    HalError::CommandFailed {
        program: program.to_string(),
        code: Some(1),
        stderr: "injected failure".to_string(),
    }
}

impl ImageOps for FakeHal {
    fn allocate_image(&self, path: &Path, size_bytes: u64) -> HalResult<()> {
        self.check(FailPoint::AllocateImage, || {
            HalError::Io(std::io::Error::other("injected failure"))
        })?;
        log::info!("FAKE HAL: allocate {} ({} bytes)", path.display(), size_bytes);

        let mut state = self.state.lock().unwrap();
        if state.images.contains_key(path) {
            return Err(HalError::Io(std::io::Error::from(
                std::io::ErrorKind::AlreadyExists,
            )));
        }
        state.images.insert(path.to_path_buf(), size_bytes);
        state.operations.push(Operation::AllocateImage {
            path: path.to_path_buf(),
            size_bytes,
        });
        Ok(())
    }

    fn format_image(&self, path: &Path) -> HalResult<()> {
        self.check(FailPoint::FormatImage, || injected("mkfs.ext4"))?;
        log::info!("FAKE HAL: mkfs.ext4 {}", path.display());
        if !self.image_exists(path) {
            return Err(injected("mkfs.ext4"));
        }
        self.record_operation(Operation::FormatImage {
            path: path.to_path_buf(),
        });
        Ok(())
    }

    fn remove_image(&self, path: &Path) -> HalResult<()> {
        self.check(FailPoint::RemoveImage, || {
            HalError::Io(std::io::Error::other("injected failure"))
        })?;
        log::info!("FAKE HAL: remove {}", path.display());

        let mut state = self.state.lock().unwrap();
        if state.images.remove(path).is_none() {
            return Err(HalError::Io(std::io::Error::from(
                std::io::ErrorKind::NotFound,
            )));
        }
        state.operations.push(Operation::RemoveImage {
            path: path.to_path_buf(),
        });
        Ok(())
    }

    fn image_exists(&self, path: &Path) -> bool {
        self.state.lock().unwrap().images.contains_key(path)
    }
}

impl LoopOps for FakeHal {
    fn find_free_loop(&self) -> HalResult<String> {
        self.check(FailPoint::FindFreeLoop, || HalError::NoDeviceAvailable)?;

        let mut state = self.state.lock().unwrap();
        let limit = state.loop_device_limit.unwrap_or(LOOP_DEVICE_COUNT);
        let loop_device = (0..limit)
            .map(|n| format!("/dev/loop{}", n))
            .find(|dev| !state.loops.contains_key(dev))
            .ok_or(HalError::NoDeviceAvailable)?;

        log::info!("FAKE HAL: losetup -f = {}", loop_device);
        state.operations.push(Operation::FindFreeLoop {
            loop_device: loop_device.clone(),
        });
        Ok(loop_device)
    }

    fn attach_loop(&self, loop_device: &str, image: &Path) -> HalResult<()> {
        self.check(FailPoint::AttachLoop, || injected("losetup"))?;
        log::info!("FAKE HAL: losetup {} {}", loop_device, image.display());

        let mut state = self.state.lock().unwrap();
        if state.loops.contains_key(loop_device) {
            return Err(HalError::Busy);
        }
        if !state.images.contains_key(image) {
            return Err(injected("losetup"));
        }
        state
            .loops
            .insert(loop_device.to_string(), image.to_path_buf());
        state.operations.push(Operation::AttachLoop {
            loop_device: loop_device.to_string(),
            image: image.to_path_buf(),
        });
        Ok(())
    }

    fn detach_loop(&self, loop_device: &str) -> HalResult<()> {
        self.check(FailPoint::DetachLoop, || injected("losetup"))?;
        log::info!("FAKE HAL: losetup -d {}", loop_device);

        let mut state = self.state.lock().unwrap();
        if state
            .mounts
            .values()
            .any(|dev| dev == Path::new(loop_device))
        {
            return Err(HalError::Busy);
        }
        if state.loops.remove(loop_device).is_none() {
            return Err(injected("losetup"));
        }
        state.operations.push(Operation::DetachLoop {
            loop_device: loop_device.to_string(),
        });
        Ok(())
    }

    fn loop_backing_file(&self, loop_device: &str) -> HalResult<Option<PathBuf>> {
        Ok(self.state.lock().unwrap().loops.get(loop_device).cloned())
    }
}

impl MountOps for FakeHal {
    fn prepare_mount_point(&self, target: &Path) -> HalResult<bool> {
        let mut state = self.state.lock().unwrap();
        let created = state.directories.insert(target.to_path_buf());
        state.operations.push(Operation::PrepareMountPoint {
            target: target.to_path_buf(),
            created,
        });
        Ok(created)
    }

    fn remove_mount_point(&self, target: &Path) -> HalResult<()> {
        let mut state = self.state.lock().unwrap();
        state.directories.remove(target);
        state.operations.push(Operation::RemoveMountPoint {
            target: target.to_path_buf(),
        });
        Ok(())
    }

    fn mount_device(&self, device: &Path, target: &Path, fstype: &str) -> HalResult<()> {
        self.check(FailPoint::Mount, || injected("mount"))?;
        log::info!(
            "FAKE HAL: mount {} -> {} (type: {})",
            device.display(),
            target.display(),
            fstype
        );

        let mut state = self.state.lock().unwrap();
        if state.mounts.contains_key(target) {
            return Err(HalError::Busy);
        }
        state
            .mounts
            .insert(target.to_path_buf(), device.to_path_buf());
        state.operations.push(Operation::Mount {
            device: device.to_path_buf(),
            target: target.to_path_buf(),
            fstype: fstype.to_string(),
        });
        Ok(())
    }

    fn unmount(&self, target: &Path) -> HalResult<()> {
        self.check(FailPoint::Unmount, || HalError::Busy)?;
        log::info!("FAKE HAL: unmount {}", target.display());

        let mut state = self.state.lock().unwrap();
        if state.mounts.remove(target).is_none() {
            return Err(HalError::Nix(nix::errno::Errno::EINVAL));
        }
        state.operations.push(Operation::Unmount {
            target: target.to_path_buf(),
        });
        Ok(())
    }

    fn is_mounted(&self, path: &Path) -> HalResult<bool> {
        let state = self.state.lock().unwrap();
        let path = resolve_in(&state.symlinks, path);
        Ok(state.mounts.contains_key(&path))
    }

    fn resolve_path(&self, path: &Path) -> HalResult<PathBuf> {
        Ok(resolve_in(&self.state.lock().unwrap().symlinks, path))
    }
}

impl PrivilegeOps for FakeHal {
    fn check_privilege(&self) -> HalResult<()> {
        self.check(FailPoint::Privilege, || HalError::PermissionDenied)?;
        self.record_operation(Operation::CheckPrivilege);
        Ok(())
    }
}

//! Linux HAL implementation using real system calls and tools.

use super::{ImageOps, LoopOps, MountOps, PrivilegeOps, DEFAULT_FSTYPE};
use crate::{HalError, HalResult};
use std::fs;
use std::io::{self, ErrorKind, Read};
use std::path::{Component, Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::time::Duration;
use wait_timeout::ChildExt;

/// Real HAL implementation for Linux systems.
#[derive(Debug, Clone, Default)]
pub struct LinuxHal;

impl LinuxHal {
    pub fn new() -> Self {
        Self
    }
}

const FORMAT_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const LOSETUP_TIMEOUT: Duration = Duration::from_secs(30);

fn map_command_err(program: &str, err: std::io::Error) -> HalError {
    if err.kind() == ErrorKind::NotFound {
        return HalError::CommandNotFound(program.to_string());
    }
    HalError::Io(err)
}

fn output_failed(program: &str, output: &Output) -> HalError {
    HalError::CommandFailed {
        program: program.to_string(),
        code: output.status.code(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    }
}

fn output_with_timeout(program: &str, cmd: &mut Command, timeout: Duration) -> HalResult<Output> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd.spawn().map_err(|e| map_command_err(program, e))?;

    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();

    // Drain pipes concurrently to avoid deadlocks on large output.
    let stdout_handle = std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut out) = stdout.take() {
            let _ = out.read_to_end(&mut buf);
        }
        buf
    });
    let stderr_handle = std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut err) = stderr.take() {
            let _ = err.read_to_end(&mut buf);
        }
        buf
    });

    let status = match child.wait_timeout(timeout).map_err(HalError::Io)? {
        Some(status) => status,
        None => {
            let _ = child.kill();
            let _ = child.wait();
            let _ = stdout_handle.join();
            let _ = stderr_handle.join();
            return Err(HalError::CommandTimeout {
                program: program.to_string(),
                timeout_secs: timeout.as_secs(),
            });
        }
    };

    let stdout = stdout_handle.join().unwrap_or_default();
    let stderr = stderr_handle.join().unwrap_or_default();
    Ok(Output {
        status,
        stdout,
        stderr,
    })
}

fn run_checked(program: &str, cmd: &mut Command, timeout: Duration) -> HalResult<Output> {
    log::info!("running {:?}", cmd);
    let output = output_with_timeout(program, cmd, timeout)?;
    if !output.status.success() {
        return Err(output_failed(program, &output));
    }
    Ok(output)
}

/// Apply `components` onto `base` without touching the filesystem.
fn push_lexical<'a>(mut base: PathBuf, components: impl Iterator<Item = Component<'a>>) -> PathBuf {
    for component in components {
        match component {
            Component::ParentDir => {
                base.pop();
            }
            Component::Normal(part) => base.push(part),
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    base
}

fn map_nix_err(err: nix::errno::Errno) -> HalError {
    use nix::errno::Errno;
    match err {
        Errno::EBUSY => HalError::Busy,
        Errno::EACCES | Errno::EPERM => HalError::PermissionDenied,
        other => HalError::Nix(other),
    }
}

impl ImageOps for LinuxHal {
    fn allocate_image(&self, path: &Path, size_bytes: u64) -> HalResult<()> {
        log::info!("allocating {} ({} bytes)", path.display(), size_bytes);
        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        // set_len on a fresh file leaves a hole, so no blocks are written.
        file.set_len(size_bytes)?;
        file.sync_all()?;
        Ok(())
    }

    fn format_image(&self, path: &Path) -> HalResult<()> {
        let program = format!("mkfs.{}", DEFAULT_FSTYPE);
        let mut cmd = Command::new(&program);
        cmd.args(["-F", "-q"]).arg(path);
        run_checked(&program, &mut cmd, FORMAT_TIMEOUT)?;
        Ok(())
    }

    fn remove_image(&self, path: &Path) -> HalResult<()> {
        log::info!("removing {}", path.display());
        fs::remove_file(path)?;
        Ok(())
    }

    fn image_exists(&self, path: &Path) -> bool {
        path.is_file()
    }
}

impl LoopOps for LinuxHal {
    fn find_free_loop(&self) -> HalResult<String> {
        let mut cmd = Command::new("losetup");
        cmd.arg("-f");
        let output = match run_checked("losetup", &mut cmd, LOSETUP_TIMEOUT) {
            Ok(output) => output,
            Err(HalError::CommandFailed { stderr, .. }) => {
                log::warn!("losetup -f failed: {}", stderr);
                return Err(HalError::NoDeviceAvailable);
            }
            Err(err) => return Err(err),
        };

        let device = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if device.is_empty() {
            return Err(HalError::NoDeviceAvailable);
        }
        Ok(device)
    }

    fn attach_loop(&self, loop_device: &str, image: &Path) -> HalResult<()> {
        let mut cmd = Command::new("losetup");
        cmd.arg(loop_device).arg(image);
        run_checked("losetup", &mut cmd, LOSETUP_TIMEOUT)?;
        Ok(())
    }

    fn detach_loop(&self, loop_device: &str) -> HalResult<()> {
        let mut cmd = Command::new("losetup");
        cmd.args(["-d", loop_device]);
        run_checked("losetup", &mut cmd, LOSETUP_TIMEOUT)?;
        Ok(())
    }

    fn loop_backing_file(&self, loop_device: &str) -> HalResult<Option<PathBuf>> {
        let name = Path::new(loop_device).file_name().ok_or_else(|| {
            HalError::Io(io::Error::new(
                ErrorKind::InvalidInput,
                format!("not a loop device: {}", loop_device),
            ))
        })?;
        // The `loop` directory only exists while the device is bound.
        let sysfs = Path::new("/sys/block")
            .join(name)
            .join("loop")
            .join("backing_file");
        match fs::read_to_string(&sysfs) {
            Ok(content) => {
                let backing = content.trim_end_matches('\n');
                let backing = backing.strip_suffix(" (deleted)").unwrap_or(backing);
                Ok(Some(PathBuf::from(backing)))
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

impl MountOps for LinuxHal {
    fn prepare_mount_point(&self, target: &Path) -> HalResult<bool> {
        if target.is_dir() {
            return Ok(false);
        }
        log::info!("creating mount point {}", target.display());
        fs::create_dir_all(target)?;
        Ok(true)
    }

    fn remove_mount_point(&self, target: &Path) -> HalResult<()> {
        log::info!("removing mount point {}", target.display());
        fs::remove_dir(target)?;
        Ok(())
    }

    fn mount_device(&self, device: &Path, target: &Path, fstype: &str) -> HalResult<()> {
        log::info!(
            "mount {} -> {} (type: {})",
            device.display(),
            target.display(),
            fstype
        );

        let flags = nix::mount::MsFlags::empty();
        nix::mount::mount(Some(device), target, Some(fstype), flags, None::<&str>)
            .map_err(map_nix_err)?;

        Ok(())
    }

    fn unmount(&self, target: &Path) -> HalResult<()> {
        log::info!("unmount {}", target.display());
        nix::mount::umount2(target, nix::mount::MntFlags::empty()).map_err(map_nix_err)?;
        Ok(())
    }

    fn is_mounted(&self, path: &Path) -> HalResult<bool> {
        // mountinfo lists resolved paths.
        let path = self.resolve_path(path)?;
        let content = fs::read_to_string("/proc/self/mountinfo")?;
        let entries = crate::procfs::mountinfo::parse_mountinfo(&content);
        Ok(crate::procfs::mountinfo::is_mounted_from_info(
            &path, &entries,
        ))
    }

    fn resolve_path(&self, path: &Path) -> HalResult<PathBuf> {
        let components: Vec<Component<'_>> = path.components().collect();
        for existing in (0..=components.len()).rev() {
            let prefix: PathBuf = components[..existing].iter().collect();
            if prefix.as_os_str().is_empty() {
                continue;
            }
            match fs::canonicalize(&prefix) {
                Ok(resolved) => {
                    return Ok(push_lexical(
                        resolved,
                        components[existing..].iter().copied(),
                    ))
                }
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(push_lexical(PathBuf::from("/"), components.into_iter()))
    }
}

impl PrivilegeOps for LinuxHal {
    fn check_privilege(&self) -> HalResult<()> {
        if nix::unistd::geteuid().is_root() {
            Ok(())
        } else {
            Err(HalError::PermissionDenied)
        }
    }
}

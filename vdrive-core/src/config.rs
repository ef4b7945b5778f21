//! Where the registry and the backing images live.

use std::io;
use std::path::{Path, PathBuf};

pub const REGISTRY_FILE_NAME: &str = ".vdrive.json";
pub const IMAGE_EXTENSION: &str = "img";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub registry_path: PathBuf,
    pub image_dir: PathBuf,
}

impl Settings {
    /// Resolve settings from explicit overrides, falling back to the caller's home directory.
    ///
    /// Relative paths are anchored at the current directory so records always hold absolute
    /// image paths.
    pub fn resolve(registry_path: Option<PathBuf>, image_dir: Option<PathBuf>) -> io::Result<Self> {
        let home = || {
            dirs::home_dir().ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, "cannot determine home directory")
            })
        };

        let registry_path = match registry_path {
            Some(path) => path,
            None => home()?.join(REGISTRY_FILE_NAME),
        };
        let image_dir = match image_dir {
            Some(dir) => dir,
            None => home()?,
        };

        Ok(Self {
            registry_path: absolute(&registry_path)?,
            image_dir: absolute(&image_dir)?,
        })
    }

    /// Backing image path for a drive name.
    pub fn image_path(&self, name: &str) -> PathBuf {
        self.image_dir
            .join(format!("{}.{}", name, IMAGE_EXTENSION))
    }
}

/// `path` joined onto the current directory when relative.
pub fn absolute(path: &Path) -> io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_paths_are_kept() {
        let settings = Settings::resolve(
            Some(PathBuf::from("/var/lib/vdrive/registry.json")),
            Some(PathBuf::from("/var/lib/vdrive/images")),
        )
        .unwrap();
        assert_eq!(
            settings.registry_path,
            PathBuf::from("/var/lib/vdrive/registry.json")
        );
        assert_eq!(
            settings.image_path("vol1"),
            PathBuf::from("/var/lib/vdrive/images/vol1.img")
        );
    }

    #[test]
    fn relative_paths_become_absolute() {
        let settings = Settings::resolve(
            Some(PathBuf::from("state/registry.json")),
            Some(PathBuf::from("images")),
        )
        .unwrap();
        let cwd = std::env::current_dir().unwrap();
        assert_eq!(settings.registry_path, cwd.join("state/registry.json"));
        assert_eq!(settings.image_dir, cwd.join("images"));
    }

    #[test]
    fn defaults_live_in_home() {
        let Some(home) = dirs::home_dir() else {
            return;
        };
        let settings = Settings::resolve(None, None).unwrap();
        assert_eq!(settings.registry_path, absolute(&home.join(".vdrive.json")).unwrap());
        assert_eq!(settings.image_path("vol1"), absolute(&home).unwrap().join("vol1.img"));
    }
}

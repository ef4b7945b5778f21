//! Parsing helpers for `/proc/self/mountinfo`.

use std::path::{Path, PathBuf};

/// Index of the mount point among the whitespace-separated mountinfo fields.
const MOUNT_POINT_FIELD: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfo {
    pub mount_point: PathBuf,
}

/// Mount points listed in a mountinfo table. Malformed lines are skipped.
pub fn parse_mountinfo(content: &str) -> Vec<MountInfo> {
    content
        .lines()
        .filter_map(|line| line.split_whitespace().nth(MOUNT_POINT_FIELD))
        .map(|field| MountInfo {
            mount_point: PathBuf::from(unescape_mount_path(field)),
        })
        .collect()
}

pub fn is_mounted_from_info(path: &Path, entries: &[MountInfo]) -> bool {
    let target = trim_trailing_slash(path);
    entries
        .iter()
        .any(|entry| trim_trailing_slash(&entry.mount_point) == target)
}

/// Decode the kernel's `\ooo` octal escapes (space, tab, newline, backslash).
pub fn unescape_mount_path(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let value = digits
                    .iter()
                    .fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                if let Ok(byte) = u8::try_from(value) {
                    out.push(byte);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn trim_trailing_slash(path: &Path) -> &str {
    let s = path.to_str().unwrap_or_default();
    match s.trim_end_matches('/') {
        "" if !s.is_empty() => "/",
        trimmed => trimmed,
    }
}

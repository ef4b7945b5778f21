//! Drive records as stored in the registry.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use vdrive_error::{DriveError, DriveResult};

/// Loop device and mount point held by a mounted drive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attachment {
    pub loop_device: String,
    pub mount_point: PathBuf,
}

/// One virtual drive: its backing image and, while mounted, its attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawRecord", into = "RawRecord")]
pub struct DriveRecord {
    image_path: PathBuf,
    attachment: Option<Attachment>,
}

impl DriveRecord {
    pub fn new(image_path: impl Into<PathBuf>) -> Self {
        Self {
            image_path: image_path.into(),
            attachment: None,
        }
    }

    pub fn image_path(&self) -> &Path {
        &self.image_path
    }

    pub fn attachment(&self) -> Option<&Attachment> {
        self.attachment.as_ref()
    }

    pub fn is_attached(&self) -> bool {
        self.attachment.is_some()
    }

    pub fn attach(&mut self, attachment: Attachment) {
        self.attachment = Some(attachment);
    }

    pub fn detach(&mut self) -> Option<Attachment> {
        self.attachment.take()
    }
}

/// On-disk shape, `{"path": ..., "loop": ..., "mount_point": ...}`.
#[derive(Debug, Serialize, Deserialize)]
struct RawRecord {
    path: PathBuf,
    #[serde(rename = "loop", default, skip_serializing_if = "Option::is_none")]
    loop_device: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mount_point: Option<PathBuf>,
}

impl TryFrom<RawRecord> for DriveRecord {
    type Error = String;

    fn try_from(raw: RawRecord) -> Result<Self, Self::Error> {
        let attachment = match (raw.loop_device, raw.mount_point) {
            (Some(loop_device), Some(mount_point)) => Some(Attachment {
                loop_device,
                mount_point,
            }),
            (None, None) => None,
            (Some(_), None) => {
                return Err(format!(
                    "drive {} has a loop device but no mount point",
                    raw.path.display()
                ))
            }
            (None, Some(_)) => {
                return Err(format!(
                    "drive {} has a mount point but no loop device",
                    raw.path.display()
                ))
            }
        };
        Ok(Self {
            image_path: raw.path,
            attachment,
        })
    }
}

impl From<DriveRecord> for RawRecord {
    fn from(record: DriveRecord) -> Self {
        let (loop_device, mount_point) = match record.attachment {
            Some(a) => (Some(a.loop_device), Some(a.mount_point)),
            None => (None, None),
        };
        Self {
            path: record.image_path,
            loop_device,
            mount_point,
        }
    }
}

/// Names become file names, so only a conservative character set is accepted.
pub fn validate_name(name: &str) -> DriveResult<()> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(DriveError::InvalidName(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unattached_record_omits_attachment_fields() {
        let record = DriveRecord::new("/root/vol1.img");
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json, serde_json::json!({ "path": "/root/vol1.img" }));
    }

    #[test]
    fn attached_record_uses_flat_fields() {
        let mut record = DriveRecord::new("/root/vol1.img");
        record.attach(Attachment {
            loop_device: "/dev/loop0".to_string(),
            mount_point: PathBuf::from("/mnt/v1"),
        });
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "path": "/root/vol1.img",
                "loop": "/dev/loop0",
                "mount_point": "/mnt/v1"
            })
        );
    }

    #[test]
    fn partial_attachment_is_rejected() {
        let err = serde_json::from_str::<DriveRecord>(
            r#"{"path": "/root/vol1.img", "loop": "/dev/loop0"}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("no mount point"));
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let record: DriveRecord = serde_json::from_str(
            r#"{"path": "/root/vol1.img", "label": "scratch", "created": 1700000000}"#,
        )
        .unwrap();
        assert_eq!(record, DriveRecord::new("/root/vol1.img"));
    }

    #[test]
    fn detach_clears_attachment() {
        let mut record = DriveRecord::new("/root/vol1.img");
        record.attach(Attachment {
            loop_device: "/dev/loop2".to_string(),
            mount_point: PathBuf::from("/mnt/v1"),
        });
        assert!(record.is_attached());

        let attachment = record.detach().unwrap();
        assert_eq!(attachment.loop_device, "/dev/loop2");
        assert!(!record.is_attached());
    }

    #[test]
    fn validate_name_accepts_simple_names() {
        for name in ["vol1", "scratch-disk", "data_2.v", "A"] {
            validate_name(name).unwrap();
        }
    }

    #[test]
    fn validate_name_rejects_path_like_names() {
        for name in ["", ".", "..", "../etc", "a/b", "-rf", "with space"] {
            assert!(
                matches!(validate_name(name), Err(DriveError::InvalidName(_))),
                "{name:?} should be rejected"
            );
        }
    }
}

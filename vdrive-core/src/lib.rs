//! vdrive core library: drive records, the persisted registry and the lifecycle controller.

pub mod config;
pub mod lifecycle;
pub mod record;
pub mod registry;

pub use config::Settings;
pub use lifecycle::{DriveManager, DriveSummary};
pub use record::{Attachment, DriveRecord};
pub use registry::{Registry, RegistryStore, RegistryTxn};
pub use vdrive_error::{DriveError, DriveResult};

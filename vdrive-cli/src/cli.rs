//! CLI argument parsing for vdrive.

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "vdrive")]
#[command(version, about = "Manage loopback-backed virtual drives")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Registry file (default: ~/.vdrive.json)
    #[arg(long, env = "VDRIVE_REGISTRY", global = true)]
    pub registry: Option<PathBuf>,

    /// Directory holding the backing images (default: home directory)
    #[arg(long, env = "VDRIVE_IMAGE_DIR", global = true)]
    pub image_dir: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Create and format a new virtual drive
    Create {
        /// Drive name
        name: String,
        /// Size in megabytes
        size_mb: u64,
    },

    /// List virtual drives and their state
    List {
        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },

    /// Attach a drive to a loop device and mount it
    Mount {
        name: String,
        /// Directory to mount at (created if missing)
        mount_point: PathBuf,
    },

    /// Unmount a drive and release its loop device
    Unmount { name: String },

    /// Delete a drive and its backing image (unmounting it first)
    Delete { name: String },
}

use anyhow::Context;
use clap::Parser;
use std::io::{self, Write};
use vdrive_core::{DriveError, DriveManager, DriveSummary, Settings};
use vdrive_hal::{DriveHal, LinuxHal};

pub mod cli;
pub mod logging;

pub fn run() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();
    logging::init(cli.verbose);

    let settings = Settings::resolve(cli.registry.clone(), cli.image_dir.clone())
        .context("Failed to resolve registry and image locations")?;
    log::debug!(
        "registry: {}, images: {}",
        settings.registry_path.display(),
        settings.image_dir.display()
    );

    let hal = LinuxHal::new();
    let stdout = io::stdout();
    let result = execute(&cli.command, &hal, settings, &mut stdout.lock());

    if let Err(err) = &result {
        if let Some(drive_err) = err.downcast_ref::<DriveError>() {
            if drive_err.is_recoverable() {
                eprintln!("[!] The drive is still registered as mounted; run the command again to retry.");
            }
        }
    }
    result
}

/// Run one command against `hal`, writing status lines to `out`.
pub fn execute<H, W>(
    command: &cli::Command,
    hal: &H,
    settings: Settings,
    out: &mut W,
) -> anyhow::Result<()>
where
    H: DriveHal + ?Sized,
    W: Write,
{
    let manager = DriveManager::new(hal, settings);

    match command {
        cli::Command::Create { name, size_mb } => {
            let image = manager
                .create(name, *size_mb)
                .with_context(|| format!("Error creating drive {}", name))?;
            writeln!(
                out,
                "[+] Created virtual drive {} at {} ({} MB, ext4)",
                name,
                image.display(),
                size_mb
            )?;
        }
        cli::Command::List { json } => {
            let drives = manager.list().context("Error reading drive registry")?;
            if *json {
                serde_json::to_writer_pretty(&mut *out, &drives)?;
                writeln!(out)?;
            } else if drives.is_empty() {
                writeln!(out, "[!] No virtual drives found")?;
            } else {
                for drive in &drives {
                    writeln!(out, "{}", format_summary(drive))?;
                }
            }
        }
        cli::Command::Mount { name, mount_point } => {
            let attachment = manager
                .mount(name, mount_point)
                .with_context(|| format!("Error mounting drive {}", name))?;
            writeln!(
                out,
                "[+] Mounted {} at {} ({})",
                name,
                attachment.mount_point.display(),
                attachment.loop_device
            )?;
        }
        cli::Command::Unmount { name } => {
            let attachment = manager
                .unmount(name)
                .with_context(|| format!("Error unmounting drive {}", name))?;
            writeln!(
                out,
                "[+] Unmounted {} from {}",
                name,
                attachment.mount_point.display()
            )?;
        }
        cli::Command::Delete { name } => {
            manager
                .delete(name)
                .with_context(|| format!("Error deleting drive {}", name))?;
            writeln!(out, "[+] Deleted virtual drive {}", name)?;
        }
    }

    Ok(())
}

fn format_summary(drive: &DriveSummary) -> String {
    let mut line = format!(
        "{}: {} [{}]",
        drive.name,
        drive.image_path.display(),
        drive.status()
    );
    if let Some(attachment) = &drive.attachment {
        line.push_str(&format!(
            " {} on {}",
            attachment.loop_device,
            attachment.mount_point.display()
        ));
    }
    if !drive.image_present {
        line.push_str(" (image missing)");
    }
    line
}

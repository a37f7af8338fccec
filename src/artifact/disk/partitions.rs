//! Partition planning and table creation with `parted`.
//!
//! A [`PartitionLayout`] is turned into concrete sector ranges by [`plan`],
//! which performs every validation before anything touches the disk. The
//! resulting [`PartitionPlan`] renders to a `parted` command script fed on
//! standard input.

use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::layout::{
    bytes_to_sectors, mib_to_sectors, Filesystem, LabelType, PartitionLayout, PartitionSize,
    Role, FIRST_PARTITION_OFFSET_SECTORS, SECTOR_SIZE,
};
use crate::build::context::BuildContext;
use crate::error::{ImageError, Result};
use crate::process::Cmd;

/// A partition with its final placement on the disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub label: String,
    pub mount_dir: PathBuf,
    pub filesystem: Filesystem,
    pub role: Role,
    /// First sector, inclusive.
    pub begin_sector: u64,
    /// Last sector, inclusive.
    pub end_sector: u64,
    /// Device-mapper name assigned by kpartx once the image is mapped.
    pub loop_device: Option<String>,
}

impl Partition {
    pub fn sectors(&self) -> u64 {
        self.end_sector - self.begin_sector + 1
    }
}

/// A validated layout resolved to sector ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionPlan {
    pub label_type: LabelType,
    pub partitions: Vec<Partition>,
    pub boot_flag: Option<usize>,
    pub bios_grub_flag: Option<usize>,
}

/// Resolve `layout` against a device of `size_bytes`.
///
/// Partitions are contiguous: the first begins at
/// [`FIRST_PARTITION_OFFSET_SECTORS`], every other one right after its
/// predecessor. A `Remaining` partition extends to the last usable sector.
pub fn plan(layout: &PartitionLayout, size_bytes: u64) -> Result<PartitionPlan> {
    layout.validate()?;

    let total_sectors = bytes_to_sectors(size_bytes)?;
    let last_usable = layout.label_type.last_usable_sector(total_sectors);

    let mut partitions = Vec::with_capacity(layout.len());
    let mut begin = FIRST_PARTITION_OFFSET_SECTORS;

    for spec in &layout.partitions {
        let end = match spec.size {
            PartitionSize::MiB(mib) => begin
                .checked_add(mib_to_sectors(mib)?)
                .map_or(u64::MAX, |next| next - 1),
            PartitionSize::Remaining => last_usable,
        };

        if end > last_usable || end < begin {
            let needed = match spec.size {
                PartitionSize::MiB(_) => end.saturating_add(1).saturating_mul(SECTOR_SIZE),
                PartitionSize::Remaining => (begin + 1).saturating_mul(SECTOR_SIZE),
            };
            return Err(ImageError::ImageTooSmall {
                needed,
                available: size_bytes,
            });
        }

        partitions.push(Partition {
            label: spec.label.clone(),
            mount_dir: spec.mount_dir.clone(),
            filesystem: spec.filesystem,
            role: spec.role,
            begin_sector: begin,
            end_sector: end,
            loop_device: None,
        });
        begin = end + 1;
    }

    Ok(PartitionPlan {
        label_type: layout.label_type,
        partitions,
        boot_flag: layout.boot_flag,
        bios_grub_flag: layout.bios_grub_flag,
    })
}

impl PartitionPlan {
    /// The `parted` script creating this table.
    ///
    /// GPT partitions are named by their label; msdos partitions are all
    /// primary. The script ends by printing the table in sectors.
    pub fn script(&self) -> String {
        let mut script = String::new();
        let _ = writeln!(script, "mklabel {}", self.label_type);

        for part in &self.partitions {
            let name = match self.label_type {
                LabelType::Gpt => part.label.as_str(),
                LabelType::Msdos => "primary",
            };
            let _ = match part.filesystem.parted_name() {
                Some(fs) => writeln!(
                    script,
                    "mkpart {} {} {}s {}s",
                    name, fs, part.begin_sector, part.end_sector
                ),
                None => writeln!(
                    script,
                    "mkpart {} {}s {}s",
                    name, part.begin_sector, part.end_sector
                ),
            };
        }

        if let Some(index) = self.boot_flag {
            let _ = writeln!(script, "set {} boot on", index);
        }
        if let Some(index) = self.bios_grub_flag {
            let _ = writeln!(script, "set {} bios_grub on", index);
        }

        script.push_str("unit s print\nquit\n");
        script
    }
}

/// Create (or truncate) a sparse file of `size_bytes`.
pub fn create_backing_file(path: &Path, size_bytes: u64) -> Result<()> {
    let ctx = || format!("creating backing file '{}'", path.display());
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .map_err(|e| ImageError::io(ctx(), e))?;
    file.set_len(size_bytes).map_err(|e| ImageError::io(ctx(), e))
}

/// Write the partition table of `plan` onto `backing_file`.
pub fn apply(ctx: &BuildContext, plan: &PartitionPlan, backing_file: &Path) -> Result<()> {
    let script = plan.script();
    debug!("parted script for {}:\n{}", backing_file.display(), script);

    let output = Cmd::new(&ctx.tools.parted)
        .arg_path(backing_file)
        .stdin(script)
        .allow_fail()
        .run(ctx.runner())?;

    if !output.success {
        return Err(ImageError::PartitioningFailed {
            output: output.combined(),
        });
    }

    info!(
        "Partitioned {} ({} table, {} partitions)",
        backing_file.display(),
        plan.label_type,
        plan.partitions.len()
    );
    Ok(())
}

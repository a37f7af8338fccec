//! Declarative partition layouts and sector arithmetic.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{ImageError, Result};

/// Sector size in bytes.
pub const SECTOR_SIZE: u64 = 512;

/// First partition starts at this offset (4 MiB, leaves room for GPT and U-Boot stages).
pub const FIRST_PARTITION_OFFSET_SECTORS: u64 = 8192;

/// Partition sizes must be a whole number of these sectors.
pub const SECTOR_ALIGNMENT: u64 = 4;

/// Sectors reserved at the end of a GPT disk for the backup header and entries.
pub const GPT_BACKUP_SECTORS: u64 = 34;

/// Size of the GRUB BIOS boot partition.
pub const BIOS_GRUB_SIZE_MIB: u64 = 4;

pub const GRUB_LABEL: &str = "grub";
pub const BOOT_LABEL: &str = "system-boot";
pub const SYSTEM_A_LABEL: &str = "system-a";
pub const SYSTEM_B_LABEL: &str = "system-b";
pub const WRITABLE_LABEL: &str = "writable";

const MIB: u64 = 1024 * 1024;

/// Partition table type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelType {
    Gpt,
    Msdos,
}

impl LabelType {
    /// Name understood by `parted mklabel`.
    pub fn as_str(&self) -> &'static str {
        match self {
            LabelType::Gpt => "gpt",
            LabelType::Msdos => "msdos",
        }
    }

    /// Primary partition limit, if the table type has one.
    pub fn max_partitions(&self) -> Option<usize> {
        match self {
            LabelType::Gpt => None,
            LabelType::Msdos => Some(4),
        }
    }

    /// Last sector a partition may occupy on a device of `total_sectors`.
    pub fn last_usable_sector(&self, total_sectors: u64) -> u64 {
        match self {
            LabelType::Gpt => total_sectors.saturating_sub(GPT_BACKUP_SECTORS),
            LabelType::Msdos => total_sectors.saturating_sub(1),
        }
    }
}

impl FromStr for LabelType {
    type Err = ImageError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "gpt" => Ok(LabelType::Gpt),
            "msdos" => Ok(LabelType::Msdos),
            other => Err(ImageError::UnsupportedLabel(other.to_string())),
        }
    }
}

impl fmt::Display for LabelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Filesystem created on a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filesystem {
    /// Raw partition, never formatted or mounted (GRUB BIOS boot area).
    None,
    Vfat,
    Ext4,
}

impl Filesystem {
    /// Filesystem token for `parted mkpart`.
    pub fn parted_name(&self) -> Option<&'static str> {
        match self {
            Filesystem::None => None,
            Filesystem::Vfat => Some("fat32"),
            Filesystem::Ext4 => Some("ext4"),
        }
    }

    pub fn is_mountable(&self) -> bool {
        !matches!(self, Filesystem::None)
    }
}

/// What a partition is used for once the image is assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    BiosBoot,
    Boot,
    SystemA,
    SystemB,
    Writable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionSize {
    MiB(u64),
    /// Everything up to the end of the device. Only valid for the last partition.
    Remaining,
}

/// One entry of a [`PartitionLayout`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSpec {
    pub label: String,
    /// Mountpoint relative to the image's mount root.
    pub mount_dir: PathBuf,
    pub filesystem: Filesystem,
    pub size: PartitionSize,
    pub role: Role,
}

impl PartitionSpec {
    pub fn new(
        label: impl Into<String>,
        mount_dir: impl Into<PathBuf>,
        filesystem: Filesystem,
        size: PartitionSize,
        role: Role,
    ) -> Self {
        Self {
            label: label.into(),
            mount_dir: mount_dir.into(),
            filesystem,
            size,
            role,
        }
    }
}

/// Ordered partitions plus the flags to set on them.
///
/// Flag indices are 1-based, as `parted` counts partitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionLayout {
    pub label_type: LabelType,
    pub partitions: Vec<PartitionSpec>,
    pub boot_flag: Option<usize>,
    pub bios_grub_flag: Option<usize>,
}

impl PartitionLayout {
    pub fn new(label_type: LabelType) -> Self {
        Self {
            label_type,
            partitions: Vec::new(),
            boot_flag: None,
            bios_grub_flag: None,
        }
    }

    pub fn push(mut self, spec: PartitionSpec) -> Self {
        self.partitions.push(spec);
        self
    }

    pub fn boot_flag(mut self, index: usize) -> Self {
        self.boot_flag = Some(index);
        self
    }

    pub fn bios_grub_flag(mut self, index: usize) -> Self {
        self.bios_grub_flag = Some(index);
        self
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    /// Check every structural rule of the layout.
    pub fn validate(&self) -> Result<()> {
        if self.partitions.is_empty() {
            return Err(ImageError::EmptyLayout);
        }

        if let Some(max) = self.label_type.max_partitions() {
            if self.partitions.len() > max {
                return Err(ImageError::TooManyPartitions {
                    label: self.label_type.as_str(),
                    max,
                    found: self.partitions.len(),
                });
            }
        }

        let last = self.partitions.len() - 1;
        for (i, spec) in self.partitions.iter().enumerate() {
            if spec.size == PartitionSize::Remaining && i != last {
                return Err(ImageError::RemainingNotLast {
                    label: spec.label.clone(),
                });
            }
        }

        for (flag, index) in [("boot", self.boot_flag), ("bios_grub", self.bios_grub_flag)] {
            if let Some(index) = index {
                if index == 0 || index > self.partitions.len() {
                    return Err(ImageError::FlagIndexOutOfRange {
                        flag,
                        index,
                        count: self.partitions.len(),
                    });
                }
            }
        }

        Ok(())
    }
}

/// Convert a byte count to 512-byte sectors.
///
/// The result must be a multiple of [`SECTOR_ALIGNMENT`]; anything else is a
/// planning bug and is rejected.
pub fn bytes_to_sectors(bytes: u64) -> Result<u64> {
    let granularity = SECTOR_SIZE * SECTOR_ALIGNMENT;
    if bytes % granularity != 0 {
        return Err(ImageError::MisalignedSize {
            bytes,
            alignment: SECTOR_ALIGNMENT,
        });
    }
    Ok(bytes / SECTOR_SIZE)
}

pub fn mib_to_sectors(mib: u64) -> Result<u64> {
    let bytes = mib.checked_mul(MIB).ok_or(ImageError::SizeTooLarge { mib })?;
    bytes_to_sectors(bytes)
}

//! Choosing the image variant for a device.
//!
//! The gadget description overrides the hardware description for the
//! bootloader, partition layout and platform.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use tracing::info;

use super::grub::CoreGrubImage;
use super::layout::{
    Filesystem, PartitionSize, PartitionSpec, Role, BOOT_LABEL, SYSTEM_A_LABEL, SYSTEM_B_LABEL,
    WRITABLE_LABEL,
};
use super::uboot::CoreUBootImage;
use super::Image;
use crate::config::BuildConfig;
use crate::description::{GadgetDescription, HardwareDescription};
use crate::error::{ImageError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bootloader {
    Grub,
    UBoot,
}

impl FromStr for Bootloader {
    type Err = ImageError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "grub" => Ok(Bootloader::Grub),
            "u-boot" => Ok(Bootloader::UBoot),
            other => Err(ImageError::UnsupportedBootloader(other.to_string())),
        }
    }
}

impl fmt::Display for Bootloader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Bootloader::Grub => "grub",
            Bootloader::UBoot => "u-boot",
        })
    }
}

/// Named partition layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LayoutName {
    /// Boot, two system slots and writable.
    #[default]
    SystemAB,
    /// Boot and writable only.
    Minimal,
}

impl FromStr for LayoutName {
    type Err = ImageError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "system-AB" => Ok(LayoutName::SystemAB),
            "minimal" => Ok(LayoutName::Minimal),
            other => Err(ImageError::UnknownPartitionLayout(other.to_string())),
        }
    }
}

impl fmt::Display for LayoutName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LayoutName::SystemAB => "system-AB",
            LayoutName::Minimal => "minimal",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionSizes {
    pub boot_mib: u64,
    pub system_mib: u64,
}

impl From<&BuildConfig> for PartitionSizes {
    fn from(config: &BuildConfig) -> Self {
        Self {
            boot_mib: config.boot_size_mib,
            system_mib: config.system_size_mib,
        }
    }
}

/// Boot, system and writable partitions shared by every bootloader.
pub fn standard_partitions(layout: LayoutName, sizes: PartitionSizes) -> Vec<PartitionSpec> {
    let mut specs = vec![PartitionSpec::new(
        BOOT_LABEL,
        "boot",
        Filesystem::Vfat,
        PartitionSize::MiB(sizes.boot_mib),
        Role::Boot,
    )];
    if layout == LayoutName::SystemAB {
        specs.push(PartitionSpec::new(
            SYSTEM_A_LABEL,
            SYSTEM_A_LABEL,
            Filesystem::Ext4,
            PartitionSize::MiB(sizes.system_mib),
            Role::SystemA,
        ));
        specs.push(PartitionSpec::new(
            SYSTEM_B_LABEL,
            SYSTEM_B_LABEL,
            Filesystem::Ext4,
            PartitionSize::MiB(sizes.system_mib),
            Role::SystemB,
        ));
    }
    specs.push(PartitionSpec::new(
        WRITABLE_LABEL,
        WRITABLE_LABEL,
        Filesystem::Ext4,
        PartitionSize::Remaining,
        Role::Writable,
    ));
    specs
}

pub fn resolve_bootloader(hardware: &HardwareDescription, gadget: &GadgetDescription) -> Result<Bootloader> {
    gadget
        .hardware()
        .bootloader
        .as_deref()
        .or(hardware.bootloader.as_deref())
        .ok_or_else(|| ImageError::UnsupportedBootloader(String::new()))?
        .parse()
}

/// Layout named by the gadget or hardware, `system-AB` when neither names one.
pub fn resolve_layout(hardware: &HardwareDescription, gadget: &GadgetDescription) -> Result<LayoutName> {
    match gadget
        .hardware()
        .partition_layout
        .as_deref()
        .or(hardware.partition_layout.as_deref())
    {
        Some(name) => name.parse(),
        None => Ok(LayoutName::default()),
    }
}

pub fn resolve_platform(hardware: &HardwareDescription, gadget: &GadgetDescription) -> Option<String> {
    gadget
        .hardware()
        .platform
        .clone()
        .or_else(|| hardware.platform.clone())
}

/// Build the image variant matching the descriptions.
pub fn select_image(
    hardware: &HardwareDescription,
    gadget: &GadgetDescription,
    backing_file: &Path,
    size_bytes: u64,
    config: &BuildConfig,
) -> Result<Box<dyn Image>> {
    let bootloader = resolve_bootloader(hardware, gadget)?;
    let layout = resolve_layout(hardware, gadget)?;
    let sizes = PartitionSizes::from(config);
    info!(
        "Selected {} image with {} layout for {}",
        bootloader, layout, hardware.architecture
    );

    let image: Box<dyn Image> = match bootloader {
        Bootloader::Grub => Box::new(
            CoreGrubImage::new(backing_file, size_bytes, layout, sizes, &hardware.architecture)
                .with_assets(gadget.boot_assets())
                .update_grub(config.update_grub),
        ),
        Bootloader::UBoot => Box::new(
            CoreUBootImage::new(backing_file, size_bytes, layout, sizes, hardware)
                .with_gadget_dtb(gadget.dtb_path())
                .with_platform(resolve_platform(hardware, gadget))
                .with_assets(gadget.boot_assets()),
        ),
    };
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::disk::layout::LabelType;

    fn hardware(bootloader: &str, layout: Option<&str>) -> HardwareDescription {
        HardwareDescription {
            kernel: "vmlinuz".into(),
            initrd: "initrd.img".into(),
            bootloader: Some(bootloader.to_string()),
            partition_layout: layout.map(str::to_string),
            architecture: "amd64".into(),
            ..Default::default()
        }
    }

    fn select(hw: &HardwareDescription, gadget: &GadgetDescription) -> Result<Box<dyn Image>> {
        select_image(hw, gadget, Path::new("/tmp/x.img"), 1 << 32, &BuildConfig::default())
    }

    #[test]
    fn test_names_parse() {
        assert_eq!("u-boot".parse::<Bootloader>().unwrap(), Bootloader::UBoot);
        assert!(matches!(
            "lilo".parse::<Bootloader>(),
            Err(ImageError::UnsupportedBootloader(_))
        ));
        assert_eq!("minimal".parse::<LayoutName>().unwrap(), LayoutName::Minimal);
        assert!(matches!(
            "system-abc".parse::<LayoutName>(),
            Err(ImageError::UnknownPartitionLayout(_))
        ));
    }

    #[test]
    fn test_grub_system_ab_has_five_partitions() {
        let image = select(&hardware("grub", None), &GadgetDescription::default()).unwrap();
        assert_eq!(image.bootloader(), Bootloader::Grub);
        let layout = image.disk().layout();
        assert_eq!(layout.label_type, LabelType::Gpt);
        assert_eq!(layout.len(), 5);
    }

    #[test]
    fn test_uboot_minimal_has_two_partitions() {
        let image = select(&hardware("u-boot", Some("minimal")), &GadgetDescription::default())
            .unwrap();
        assert_eq!(image.bootloader(), Bootloader::UBoot);
        assert_eq!(image.disk().layout().len(), 2);
        assert_eq!(image.disk().label_type(), LabelType::Msdos);
    }

    #[test]
    fn test_gadget_overrides_hardware() {
        let mut gadget = GadgetDescription::default();
        gadget.gadget.hardware.bootloader = Some("u-boot".into());
        gadget.gadget.hardware.partition_layout = Some("minimal".into());
        let image = select(&hardware("grub", Some("system-AB")), &gadget).unwrap();
        assert_eq!(image.bootloader(), Bootloader::UBoot);
        assert_eq!(image.disk().layout().len(), 2);
    }

    #[test]
    fn test_unknown_layout_is_an_error() {
        assert!(matches!(
            select(&hardware("grub", Some("triple")), &GadgetDescription::default()),
            Err(ImageError::UnknownPartitionLayout(name)) if name == "triple"
        ));
    }

    #[test]
    fn test_missing_bootloader_is_an_error() {
        let mut hw = hardware("grub", None);
        hw.bootloader = None;
        assert!(matches!(
            select(&hw, &GadgetDescription::default()),
            Err(ImageError::UnsupportedBootloader(_))
        ));
    }
}

//! U-Boot images: msdos label, boot environment file and kernel/initrd/dtb
//! copies for both A/B slots on the boot partition.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info};
use walkdir::WalkDir;

use super::assets::{provision_assets, BootAsset};
use super::layout::{LabelType, PartitionLayout};
use super::variant::{standard_partitions, Bootloader, LayoutName, PartitionSizes};
use super::{DiskImage, Image};
use crate::build::context::BuildContext;
use crate::description::HardwareDescription;
use crate::error::{ImageError, Result};

/// Boot environment read by U-Boot from the boot partition.
pub const BOOT_ENV_FILE: &str = "snappy-system.txt";

const SLOTS: [&str; 2] = ["a", "b"];
const DTBS_DIR: &str = "dtbs";

const BOOT_ENV_TEMPLATE: &str = r#"# On first boot, we need to tell u-boot which kernel to use
snappy_mode=regular
snappy_ab=a
snappy_stamp=snappy-stamp.txt
kernel_file=@KERNEL@
initrd_file=@INITRD@
@FDT@loadfiles=run loadkernel; run loadinitrd; run loadfdt
loadkernel=load mmc ${mmcdev}:${mmcpart} ${loadaddr} ${snappy_ab}/${kernel_file}
loadinitrd=load mmc ${mmcdev}:${mmcpart} ${initrd_addr} ${snappy_ab}/${initrd_file}; setenv initrd_size ${filesize}
loadfdt=load mmc ${mmcdev}:${mmcpart} ${fdtaddr} ${snappy_ab}/dtbs/${fdtfile}
snappy_boot=if test "${snappy_mode}" = "try"; then if test -e mmc ${bootpart} ${snappy_stamp}; then if test "${snappy_ab}" = "a"; then setenv snappy_ab "b"; else setenv snappy_ab "a"; fi; else fatwrite mmc ${mmcdev}:${mmcpart} 0x0 ${snappy_stamp} 0; fi; fi; run loadfiles; setenv mmcroot /dev/disk/by-label/system-${snappy_ab} ${snappy_cmdline}; run mmcargs; bootz ${loadaddr} ${initrd_addr}:${initrd_size} ${fdtaddr}
"#;

/// Render the boot environment for the given kernel, initrd and device tree names.
pub fn boot_environment(kernel_file: &str, initrd_file: &str, fdt_file: Option<&str>) -> String {
    let fdt = fdt_file
        .map(|name| format!("fdtfile={}\n", name))
        .unwrap_or_default();
    BOOT_ENV_TEMPLATE
        .replace("@KERNEL@", kernel_file)
        .replace("@INITRD@", initrd_file)
        .replace("@FDT@", &fdt)
}

/// msdos layout with the boot flag on the first partition.
pub fn uboot_layout(layout: LayoutName, sizes: PartitionSizes) -> PartitionLayout {
    standard_partitions(layout, sizes)
        .into_iter()
        .fold(PartitionLayout::new(LabelType::Msdos), PartitionLayout::push)
        .boot_flag(1)
}

pub struct CoreUBootImage {
    disk: DiskImage,
    kernel: PathBuf,
    initrd: PathBuf,
    dtbs: Option<PathBuf>,
    gadget_dtb: Option<PathBuf>,
    platform: Option<String>,
    assets: Vec<BootAsset>,
}

impl CoreUBootImage {
    pub fn new(
        backing_file: &Path,
        size_bytes: u64,
        layout: LayoutName,
        sizes: PartitionSizes,
        hardware: &HardwareDescription,
    ) -> Self {
        Self {
            disk: DiskImage::new(backing_file, size_bytes, uboot_layout(layout, sizes)),
            kernel: hardware.kernel_path(),
            initrd: hardware.initrd_path(),
            dtbs: hardware.dtbs_path(),
            gadget_dtb: None,
            platform: hardware.platform.clone(),
            assets: Vec::new(),
        }
    }

    /// Device tree shipped by the gadget; wins over the kernel's dtbs.
    pub fn with_gadget_dtb(mut self, dtb: Option<PathBuf>) -> Self {
        self.gadget_dtb = dtb;
        self
    }

    pub fn with_platform(mut self, platform: Option<String>) -> Self {
        self.platform = platform;
        self
    }

    pub fn with_assets(mut self, assets: Vec<BootAsset>) -> Self {
        self.assets = assets;
        self
    }

    /// Device tree file name U-Boot should load, if any.
    pub fn fdt_file(&self) -> Option<String> {
        match (&self.gadget_dtb, &self.platform) {
            (Some(dtb), _) => dtb.file_name().map(|n| n.to_string_lossy().into_owned()),
            (None, Some(platform)) => Some(format!("{}.dtb", platform)),
            (None, None) => None,
        }
    }

    /// Copy device trees into `dest`.
    ///
    /// The gadget dtb is used when present, then `<platform>.dtb` from the
    /// hardware dtbs directory, then the whole directory.
    fn install_dtbs(&self, dest: &Path) -> Result<()> {
        if let Some(dtb) = &self.gadget_dtb {
            return copy_into(dtb, dest);
        }
        let Some(dir) = &self.dtbs else {
            return Ok(());
        };
        if let Some(platform) = &self.platform {
            let candidate = dir.join(format!("{}.dtb", platform));
            if candidate.is_file() {
                return copy_into(&candidate, dest);
            }
        }

        for entry in WalkDir::new(dir) {
            let entry = entry.map_err(|e| ImageError::io(format!("walking {}", dir.display()), e.into()))?;
            let rel = entry.path().strip_prefix(dir).unwrap_or(entry.path());
            let target = dest.join(rel);
            if entry.file_type().is_dir() {
                create_dir(&target)?;
            } else {
                copy_file(entry.path(), &target)?;
            }
        }
        Ok(())
    }
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| ImageError::io(format!("creating {}", path.display()), e))
}

fn copy_file(source: &Path, dest: &Path) -> Result<()> {
    debug!("copying {} to {}", source.display(), dest.display());
    fs::copy(source, dest)
        .map(|_| ())
        .map_err(|e| ImageError::io(format!("copying {} to {}", source.display(), dest.display()), e))
}

/// Copy `source` into directory `dir`, keeping its file name.
fn copy_into(source: &Path, dir: &Path) -> Result<()> {
    let name = file_name(source)?;
    create_dir(dir)?;
    copy_file(source, &dir.join(name))
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| {
            ImageError::io(
                format!("resolving file name of '{}'", path.display()),
                io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"),
            )
        })
}

impl Image for CoreUBootImage {
    fn disk(&self) -> &DiskImage {
        &self.disk
    }

    fn disk_mut(&mut self) -> &mut DiskImage {
        &mut self.disk
    }

    fn bootloader(&self) -> Bootloader {
        Bootloader::UBoot
    }

    fn setup_boot(&mut self, _ctx: &BuildContext) -> Result<()> {
        let boot = self.disk.boot()?;
        let kernel_file = file_name(&self.kernel)?;
        let initrd_file = file_name(&self.initrd)?;

        provision_assets(
            &self.assets,
            &boot,
            self.disk.backing_file(),
            self.disk.first_partition_offset(),
        )?;

        let env = boot.join(BOOT_ENV_FILE);
        let fdt_file = self.fdt_file();
        fs::write(&env, boot_environment(&kernel_file, &initrd_file, fdt_file.as_deref()))
            .map_err(|e| ImageError::io(format!("writing {}", env.display()), e))?;

        for slot in SLOTS {
            let dir = boot.join(slot);
            create_dir(&dir)?;
            copy_file(&self.kernel, &dir.join(&kernel_file))?;
            copy_file(&self.initrd, &dir.join(&initrd_file))?;
            self.install_dtbs(&dir.join(DTBS_DIR))?;
        }

        info!("Installed u-boot boot files into {}", boot.display());
        Ok(())
    }
}

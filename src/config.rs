//! Build configuration.
//!
//! External program names are configuration, not constants: a
//! [`ToolPaths`] record is injected into the build context so hosts with
//! non-standard installs (or tests) can point at different binaries.
//!
//! ```toml
//! system_size_mib = 2048
//! verbose = true
//!
//! [tools]
//! parted = "/usr/sbin/parted"
//! qemu_img = "/opt/qemu/bin/qemu-img"
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{ImageError, Result};

/// Config file name under the user config directory.
pub const CONFIG_DIR_NAME: &str = "device-image";
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Paths (or bare names resolved through PATH) of every external program.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolPaths {
    pub parted: String,
    pub kpartx: String,
    pub dmsetup: String,
    pub mkfs_ext4: String,
    pub mkfs_vfat: String,
    pub blockdev: String,
    pub mount: String,
    pub umount: String,
    pub sync: String,
    pub chroot: String,
    pub tar: String,
    pub qemu_img: String,
    /// Directory holding device-mapper nodes created by kpartx.
    pub device_mapper_dir: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            parted: "parted".into(),
            kpartx: "kpartx".into(),
            dmsetup: "dmsetup".into(),
            mkfs_ext4: "mkfs.ext4".into(),
            mkfs_vfat: "mkfs.vfat".into(),
            blockdev: "blockdev".into(),
            mount: "mount".into(),
            umount: "umount".into(),
            sync: "sync".into(),
            chroot: "chroot".into(),
            tar: "tar".into(),
            qemu_img: "qemu-img".into(),
            device_mapper_dir: PathBuf::from("/dev/mapper"),
        }
    }
}

impl ToolPaths {
    /// Every configured program paired with the package that provides it.
    ///
    /// `qemu-img` is only needed for snapshot conversion and is listed
    /// separately by [`ToolPaths::snapshot_tools`].
    pub fn required(&self) -> Vec<(&str, &str)> {
        vec![
            (self.parted.as_str(), "parted"),
            (self.kpartx.as_str(), "kpartx"),
            (self.dmsetup.as_str(), "dmsetup"),
            (self.mkfs_ext4.as_str(), "e2fsprogs"),
            (self.mkfs_vfat.as_str(), "dosfstools"),
            (self.blockdev.as_str(), "util-linux"),
            (self.mount.as_str(), "util-linux"),
            (self.umount.as_str(), "util-linux"),
            (self.sync.as_str(), "coreutils"),
            (self.chroot.as_str(), "coreutils"),
            (self.tar.as_str(), "tar"),
        ]
    }

    pub fn snapshot_tools(&self) -> Vec<(&str, &str)> {
        vec![(self.qemu_img.as_str(), "qemu-utils")]
    }
}

/// Tunables for an image build.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildConfig {
    pub tools: ToolPaths,
    /// Size of each system partition.
    pub system_size_mib: u64,
    /// Size of the boot partition.
    pub boot_size_mib: u64,
    /// Tee external command output to the debug log.
    pub verbose: bool,
    /// Name of the snapshot taken after conversion to qcow2.
    pub snapshot_name: String,
    /// Run `update-grub` in the chroot after installing GRUB.
    pub update_grub: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            tools: ToolPaths::default(),
            system_size_mib: 1024,
            boot_size_mib: 128,
            verbose: false,
            snapshot_name: "pristine".into(),
            update_grub: false,
        }
    }
}

impl BuildConfig {
    /// Parse a config file. The file must exist.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| ImageError::io(format!("reading config '{}'", path.display()), e))?;
        Self::parse(&raw, path)
    }

    /// Load the per-user config if there is one, defaults otherwise.
    pub fn load_default() -> Result<Self> {
        match default_config_path() {
            Some(path) if path.is_file() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    fn parse(raw: &str, path: &Path) -> Result<Self> {
        toml::from_str(raw).map_err(|e| ImageError::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }
}

/// `<config dir>/device-image/config.toml`, when the platform has a config dir.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
}

//! Hardware and gadget descriptions.
//!
//! Both are YAML documents. Relative paths inside them are resolved against
//! the directory of the file they came from.
//!
//! ```yaml
//! # hardware.yaml
//! kernel: assets/vmlinuz
//! initrd: assets/initrd.img
//! dtbs: assets/dtbs
//! partition-layout: system-AB
//! bootloader: u-boot
//! architecture: armhf
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::artifact::disk::assets::BootAsset;
use crate::error::{ImageError, Result};

fn read(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| ImageError::io(format!("reading {}", path.display()), e))
}

fn parse<T: for<'de> Deserialize<'de>>(raw: &str, path: &Path) -> Result<T> {
    serde_yaml::from_str(raw).map_err(|e| ImageError::Description {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn base_dir_of(path: &Path) -> PathBuf {
    path.parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Kernel, initrd and boot hints for a device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HardwareDescription {
    pub kernel: PathBuf,
    pub initrd: PathBuf,
    /// Directory of device tree blobs.
    #[serde(default)]
    pub dtbs: Option<PathBuf>,
    #[serde(default)]
    pub partition_layout: Option<String>,
    #[serde(default)]
    pub bootloader: Option<String>,
    pub architecture: String,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl HardwareDescription {
    pub fn load(path: &Path) -> Result<Self> {
        let mut desc: Self = parse(&read(path)?, path)?;
        desc.base_dir = base_dir_of(path);
        Ok(desc)
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        self.base_dir.join(path)
    }

    pub fn kernel_path(&self) -> PathBuf {
        self.resolve(&self.kernel)
    }

    pub fn initrd_path(&self) -> PathBuf {
        self.resolve(&self.initrd)
    }

    pub fn dtbs_path(&self) -> Option<PathBuf> {
        self.dtbs.as_deref().map(|p| self.resolve(p))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GadgetDescription {
    pub name: String,
    #[serde(default)]
    pub architecture: Option<String>,
    #[serde(default)]
    pub gadget: GadgetSection,
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GadgetSection {
    #[serde(default)]
    pub hardware: GadgetHardware,
}

/// Gadget overrides of the hardware description, plus its boot assets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GadgetHardware {
    #[serde(default)]
    pub bootloader: Option<String>,
    #[serde(default)]
    pub partition_layout: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    /// Device tree shipped by the gadget, preferred over the kernel's.
    #[serde(default)]
    pub dtb: Option<PathBuf>,
    #[serde(default)]
    pub boot_assets: BootAssetsSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BootAssetsSpec {
    #[serde(default)]
    pub files: Vec<FileAssetSpec>,
    #[serde(default)]
    pub raw_files: Vec<RawAssetSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FileAssetSpec {
    pub path: PathBuf,
    #[serde(default)]
    pub target: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RawAssetSpec {
    pub path: PathBuf,
    pub offset: u64,
}

impl GadgetDescription {
    pub fn load(path: &Path) -> Result<Self> {
        let mut desc: Self = parse(&read(path)?, path)?;
        desc.base_dir = base_dir_of(path);
        Ok(desc)
    }

    pub fn hardware(&self) -> &GadgetHardware {
        &self.gadget.hardware
    }

    pub fn dtb_path(&self) -> Option<PathBuf> {
        self.hardware().dtb.as_deref().map(|p| self.base_dir.join(p))
    }

    /// Boot assets with sources resolved against the gadget directory.
    ///
    /// File assets come first, in declaration order, then raw assets.
    pub fn boot_assets(&self) -> Vec<BootAsset> {
        let spec = &self.hardware().boot_assets;
        let files = spec.files.iter().map(|f| BootAsset::File {
            source: self.base_dir.join(&f.path),
            target: f.target.clone(),
        });
        let raw = spec.raw_files.iter().map(|r| BootAsset::Raw {
            source: self.base_dir.join(&r.path),
            offset: r.offset,
        });
        files.chain(raw).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const HARDWARE: &str = "\
kernel: assets/vmlinuz
initrd: assets/initrd.img
dtbs: assets/dtbs
partition-layout: system-AB
bootloader: u-boot
architecture: armhf
";

    const GADGET: &str = "\
name: beagleblack
architecture: armhf
gadget:
  hardware:
    bootloader: u-boot
    partition-layout: minimal
    platform: am335x-boneblack
    dtb: dtbs/am335x-boneblack.dtb
    boot-assets:
      files:
        - path: uEnv.txt
        - path: MLO.cfg
          target: sub/MLO.cfg
      raw-files:
        - path: MLO
          offset: 131072
";

    #[test]
    fn test_hardware_paths_resolve_against_file_dir() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("hardware.yaml");
        fs::write(&path, HARDWARE).unwrap();

        let hw = HardwareDescription::load(&path).unwrap();
        assert_eq!(hw.architecture, "armhf");
        assert_eq!(hw.partition_layout.as_deref(), Some("system-AB"));
        assert_eq!(hw.kernel_path(), temp.path().join("assets/vmlinuz"));
        assert_eq!(hw.dtbs_path(), Some(temp.path().join("assets/dtbs")));
        assert_eq!(hw.platform, None);
    }

    #[test]
    fn test_gadget_boot_assets() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("meta/package.yaml");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, GADGET).unwrap();

        let gadget = GadgetDescription::load(&path).unwrap();
        let meta = temp.path().join("meta");
        assert_eq!(gadget.hardware().platform.as_deref(), Some("am335x-boneblack"));
        assert_eq!(gadget.dtb_path(), Some(meta.join("dtbs/am335x-boneblack.dtb")));
        assert_eq!(
            gadget.boot_assets(),
            vec![
                BootAsset::File { source: meta.join("uEnv.txt"), target: None },
                BootAsset::File {
                    source: meta.join("MLO.cfg"),
                    target: Some(PathBuf::from("sub/MLO.cfg")),
                },
                BootAsset::Raw { source: meta.join("MLO"), offset: 131072 },
            ]
        );
    }

    #[test]
    fn test_minimal_gadget() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("package.yaml");
        fs::write(&path, "name: pc\n").unwrap();
        let gadget = GadgetDescription::load(&path).unwrap();
        assert!(gadget.boot_assets().is_empty());
        assert_eq!(gadget.hardware().bootloader, None);
    }

    #[test]
    fn test_malformed_description() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("hardware.yaml");
        fs::write(&path, "kernel: [unterminated\n").unwrap();
        assert!(matches!(
            HardwareDescription::load(&path),
            Err(ImageError::Description { .. })
        ));
    }
}

//! GRUB images: GPT with a BIOS boot partition, EFI GRUB installed from
//! inside the image's own system root.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use super::assets::{provision_assets, BootAsset};
use super::layout::{
    Filesystem, LabelType, PartitionLayout, PartitionSize, PartitionSpec, Role, BIOS_GRUB_SIZE_MIB,
    GRUB_LABEL,
};
use super::resources::{Resource, ResourceStack};
use super::variant::{standard_partitions, Bootloader, LayoutName, PartitionSizes};
use super::{DiskImage, Image};
use crate::build::context::BuildContext;
use crate::error::{merge_cleanup, ImageError, Result};
use crate::process::Cmd;

/// Architecture to `grub-install --target` for EFI.
const GRUB_EFI_TARGETS: &[(&str, &str)] = &[
    ("armhf", "arm-efi"),
    ("arm64", "arm64-efi"),
    ("amd64", "x86_64-efi"),
    ("i386", "i386-efi"),
];

/// Loader config placed next to the removable EFI binary. It hands over to
/// the real config under `EFI/ubuntu/grub`.
pub const GRUB_STUB_CONFIG: &str =
    "set prefix=($root)'/EFI/ubuntu/grub'\nconfigfile $prefix/grub.cfg\n";

/// `--boot-directory` as seen from inside the chroot.
const GRUB_BOOT_DIRECTORY: &str = "/boot/efi/EFI/ubuntu";
const EFI_DIRECTORY: &str = "/boot/efi";
/// Where the backing file is bind-mounted inside the chroot.
const DEVICE_PLACEHOLDER: &str = "/tmp/device";
const HOST_BIND_DIRS: [&str; 3] = ["dev", "proc", "sys"];

pub fn grub_efi_target(architecture: &str) -> Result<&'static str> {
    GRUB_EFI_TARGETS
        .iter()
        .find(|(arch, _)| *arch == architecture)
        .map(|(_, target)| *target)
        .ok_or_else(|| ImageError::UnsupportedArchitecture(architecture.to_string()))
}

/// PC architectures also get GRUB in the BIOS boot partition.
pub fn needs_bios_grub(architecture: &str) -> bool {
    matches!(architecture, "amd64" | "i386")
}

/// GPT layout with the BIOS boot partition first and the boot partition second.
pub fn grub_layout(layout: LayoutName, sizes: PartitionSizes) -> PartitionLayout {
    let bios = PartitionSpec::new(
        GRUB_LABEL,
        "",
        Filesystem::None,
        PartitionSize::MiB(BIOS_GRUB_SIZE_MIB),
        Role::BiosBoot,
    );
    standard_partitions(layout, sizes)
        .into_iter()
        .fold(PartitionLayout::new(LabelType::Gpt).push(bios), PartitionLayout::push)
        .bios_grub_flag(1)
        .boot_flag(2)
}

pub struct CoreGrubImage {
    disk: DiskImage,
    architecture: String,
    assets: Vec<BootAsset>,
    update_grub: bool,
}

impl CoreGrubImage {
    pub fn new(
        backing_file: &Path,
        size_bytes: u64,
        layout: LayoutName,
        sizes: PartitionSizes,
        architecture: &str,
    ) -> Self {
        Self {
            disk: DiskImage::new(backing_file, size_bytes, grub_layout(layout, sizes)),
            architecture: architecture.to_string(),
            assets: Vec::new(),
            update_grub: false,
        }
    }

    pub fn with_assets(mut self, assets: Vec<BootAsset>) -> Self {
        self.assets = assets;
        self
    }

    /// Regenerate the GRUB menu with `update-grub` after installing.
    pub fn update_grub(mut self, enabled: bool) -> Self {
        self.update_grub = enabled;
        self
    }

    fn chroot(&self, ctx: &BuildContext, system: &Path, args: &[&str], what: &str) -> Result<()> {
        Cmd::new(&ctx.tools.chroot)
            .arg_path(system)
            .args(args.iter().copied())
            .error_msg(what)
            .run(ctx.runner())
            .map(|_| ())
    }

    /// Bind the host and the image into the system root, then run grub-install.
    fn install(
        &self,
        ctx: &BuildContext,
        system: &Path,
        boot: &Path,
        efi_target: &str,
        resources: &mut ResourceStack,
    ) -> Result<()> {
        for dir in HOST_BIND_DIRS {
            let mountpoint = system.join(dir);
            create_dir(&mountpoint)?;
            resources.bind_mount(ctx, &Path::new("/").join(dir), &mountpoint)?;
        }

        // Empty firmware dir so grub-install cannot see host EFI variables.
        let firmware = tempfile::Builder::new()
            .prefix("grub-firmware")
            .tempdir()
            .map_err(|e| ImageError::io("creating firmware placeholder", e))?
            .keep();
        resources.push(Resource::Dir(firmware.clone()));
        resources.bind_mount(ctx, &firmware, &system.join("sys/firmware"))?;

        let efi = chroot_path(system, EFI_DIRECTORY);
        create_dir(&efi)?;
        resources.bind_mount(ctx, boot, &efi)?;

        let device = chroot_path(system, DEVICE_PLACEHOLDER);
        if let Some(tmp) = device.parent() {
            create_dir(tmp)?;
        }
        resources.placeholder_file(&device)?;
        resources.bind_mount(ctx, self.disk.backing_file(), &device)?;

        create_dir(&boot.join("EFI/ubuntu/grub"))?;
        let boot_dir = format!("--boot-directory={}", GRUB_BOOT_DIRECTORY);

        if needs_bios_grub(&self.architecture) {
            self.chroot(
                ctx,
                system,
                &["grub-install", "--target=i386-pc", &boot_dir, DEVICE_PLACEHOLDER],
                "installing BIOS grub",
            )?;
        }

        let target = format!("--target={}", efi_target);
        let efi_dir = format!("--efi-directory={}", EFI_DIRECTORY);
        self.chroot(
            ctx,
            system,
            &["grub-install", &target, &efi_dir, &boot_dir, "--removable", "--no-nvram"],
            "installing EFI grub",
        )?;

        if self.update_grub {
            self.chroot(ctx, system, &["update-grub"], "updating grub configuration")?;
        }
        Ok(())
    }
}

fn chroot_path(system: &Path, absolute: &str) -> PathBuf {
    system.join(absolute.trim_start_matches('/'))
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| ImageError::io(format!("creating {}", path.display()), e))
}

impl Image for CoreGrubImage {
    fn disk(&self) -> &DiskImage {
        &self.disk
    }

    fn disk_mut(&mut self) -> &mut DiskImage {
        &mut self.disk
    }

    fn bootloader(&self) -> Bootloader {
        Bootloader::Grub
    }

    fn setup_boot(&mut self, ctx: &BuildContext) -> Result<()> {
        let efi_target = grub_efi_target(&self.architecture)?;
        let system = self.disk.system()?;
        let boot = self.disk.boot()?;

        provision_assets(
            &self.assets,
            &boot,
            self.disk.backing_file(),
            self.disk.first_partition_offset(),
        )?;

        let mut resources = ResourceStack::new();
        let installed = self.install(ctx, &system, &boot, efi_target, &mut resources);
        merge_cleanup(installed, resources.unwind(ctx))?;

        let stub_dir = boot.join("EFI/BOOT");
        create_dir(&stub_dir)?;
        let stub = stub_dir.join("grub.cfg");
        fs::write(&stub, GRUB_STUB_CONFIG)
            .map_err(|e| ImageError::io(format!("writing {}", stub.display()), e))?;

        info!("Installed grub ({}) into {}", efi_target, self.disk.backing_file().display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::disk::testing::*;
    use crate::build::context::fake;
    use crate::process::fake::FakeRunner;
    use tempfile::TempDir;

    const SIZES: PartitionSizes = PartitionSizes {
        boot_mib: 64,
        system_mib: 512,
    };

    fn mounted(temp: &TempDir, arch: &str) -> (CoreGrubImage, BuildContext, FakeRunner) {
        let (ctx, runner, _) = fake::context();
        let mut image =
            CoreGrubImage::new(&temp.path().join("disk.img"), 4 * GIB, LayoutName::SystemAB, SIZES, arch);
        image.partition(&ctx).unwrap();
        script_kpartx(&runner, 5);
        image.map(&ctx).unwrap();
        image.mount(&ctx).unwrap();
        (image, ctx, runner)
    }

    #[test]
    fn test_efi_targets() {
        assert_eq!(grub_efi_target("amd64").unwrap(), "x86_64-efi");
        assert_eq!(grub_efi_target("i386").unwrap(), "i386-efi");
        assert_eq!(grub_efi_target("arm64").unwrap(), "arm64-efi");
        assert_eq!(grub_efi_target("armhf").unwrap(), "arm-efi");
        assert!(matches!(
            grub_efi_target("mips"),
            Err(ImageError::UnsupportedArchitecture(a)) if a == "mips"
        ));
    }

    #[test]
    fn test_grub_layouts() {
        let ab = grub_layout(LayoutName::SystemAB, SIZES);
        assert_eq!(ab.len(), 5);
        assert_eq!(ab.partitions[0].label, "grub");
        assert_eq!(ab.partitions[0].filesystem, Filesystem::None);
        assert_eq!(ab.bios_grub_flag, Some(1));
        assert_eq!(ab.boot_flag, Some(2));
        assert!(ab.validate().is_ok());

        let minimal = grub_layout(LayoutName::Minimal, SIZES);
        assert_eq!(minimal.len(), 3);
        assert_eq!(minimal.partitions[2].role, Role::Writable);
    }

    #[test]
    fn test_amd64_installs_bios_and_efi() {
        let temp = TempDir::new().unwrap();
        let (mut image, ctx, runner) = mounted(&temp, "amd64");
        let system = image.system().unwrap();
        let boot = image.boot().unwrap();

        image.setup_boot(&ctx).unwrap();

        let chroot = format!("chroot {}", system.display());
        assert_eq!(runner.count(&format!("{} grub-install --target=i386-pc", chroot)), 1);
        assert_eq!(runner.count(&format!("{} grub-install --target=x86_64-efi", chroot)), 1);
        assert_eq!(runner.count(&format!("{} update-grub", chroot)), 0);

        assert_eq!(
            fs::read_to_string(boot.join("EFI/BOOT/grub.cfg")).unwrap(),
            GRUB_STUB_CONFIG
        );
        assert!(!system.join("tmp/device").exists());
        assert_eq!(runner.count("mount --bind"), runner.count("umount"));
    }

    #[test]
    fn test_arm64_skips_bios_install() {
        let temp = TempDir::new().unwrap();
        let (mut image, ctx, runner) = mounted(&temp, "arm64");
        image.setup_boot(&ctx).unwrap();
        assert_eq!(runner.count("chroot"), 1);
        assert!(runner.calls().iter().any(|c| c.contains("--target=arm64-efi")
            && c.contains("--removable")
            && c.contains("--no-nvram")));
    }

    #[test]
    fn test_bind_mounts_are_released_in_reverse() {
        let temp = TempDir::new().unwrap();
        let (mut image, ctx, runner) = mounted(&temp, "amd64");
        let system = image.system().unwrap();
        image.setup_boot(&ctx).unwrap();

        let calls = runner.calls();
        let targets: Vec<String> = calls
            .iter()
            .filter(|c| c.starts_with("mount --bind"))
            .map(|c| c.rsplit(' ').next().unwrap().to_string())
            .collect();
        let released: Vec<String> = calls
            .iter()
            .filter(|c| c.starts_with("umount"))
            .map(|c| c.trim_start_matches("umount ").to_string())
            .collect();

        assert_eq!(targets[0], system.join("dev").display().to_string());
        let mut reversed = targets.clone();
        reversed.reverse();
        assert_eq!(released, reversed);
    }

    #[test]
    fn test_failed_install_still_unwinds() {
        let temp = TempDir::new().unwrap();
        let (mut image, ctx, runner) = mounted(&temp, "arm64");
        let system = image.system().unwrap();
        runner.fail(
            &format!("chroot {} grub-install", system.display()),
            "grub-install: error: cannot find EFI directory",
        );

        let err = image.setup_boot(&ctx).unwrap_err();
        assert!(err.to_string().contains("installing EFI grub failed"));
        assert!(err.to_string().contains("cannot find EFI directory"));
        assert_eq!(runner.count("mount --bind"), runner.count("umount"));
        assert!(!system.join("tmp/device").exists());
    }

    #[test]
    fn test_unsupported_architecture_fails_before_mounting() {
        let temp = TempDir::new().unwrap();
        let (mut image, ctx, runner) = mounted(&temp, "mips");
        let before = runner.calls().len();
        assert!(matches!(
            image.setup_boot(&ctx),
            Err(ImageError::UnsupportedArchitecture(_))
        ));
        assert_eq!(runner.calls().len(), before);
    }

    #[test]
    fn test_file_assets_land_in_boot() {
        let temp = TempDir::new().unwrap();
        let asset = temp.path().join("grub.cfg");
        fs::write(&asset, "menuentry").unwrap();
        let (image, ctx, _) = mounted(&temp, "arm64");
        let mut image = image.with_assets(vec![BootAsset::File { source: asset, target: None }]);
        image.setup_boot(&ctx).unwrap();
        assert_eq!(
            fs::read_to_string(image.boot().unwrap().join("grub.cfg")).unwrap(),
            "menuentry"
        );
    }
}

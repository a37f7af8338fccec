//! Raw disk image provisioning.
//!
//! A [`DiskImage`] is a sparse backing file that moves through a fixed
//! sequence of states: partitioned, mapped to device-mapper nodes, formatted,
//! mounted under a private root, and back. Bootloader variants wrap a
//! `DiskImage` and implement [`Image`], adding their own layout and boot
//! setup on top of the shared operations.
//!
//! ```text
//! created ─partition─▶ partitioned ─map─▶ mapped ─format─▶ formatted
//!                                                            │
//!           unmap ◀─ unmounted ◀─unmount─ mounted ◀─mount────┘
//! ```

pub mod assets;
pub mod format;
pub mod grub;
pub mod layout;
pub mod mapper;
pub mod mount;
pub mod partitions;
pub mod resources;
pub mod snapshot;
pub mod uboot;
pub mod variant;

pub use layout::{Filesystem, LabelType, PartitionLayout, PartitionSize, PartitionSpec, Role};
pub use partitions::Partition;
pub use variant::{select_image, Bootloader, LayoutName};

use std::path::{Path, PathBuf};

use tracing::info;

use crate::build::context::BuildContext;
use crate::error::{ImageError, Result};
use layout::{FIRST_PARTITION_OFFSET_SECTORS, SECTOR_SIZE};
use mount::MountSession;

/// Disk image state shared by every bootloader variant.
#[derive(Debug)]
pub struct DiskImage {
    backing_file: PathBuf,
    size_bytes: u64,
    layout: PartitionLayout,
    partitions: Vec<Partition>,
    mount: Option<MountSession>,
}

impl DiskImage {
    pub fn new(backing_file: impl Into<PathBuf>, size_bytes: u64, layout: PartitionLayout) -> Self {
        Self {
            backing_file: backing_file.into(),
            size_bytes,
            layout,
            partitions: Vec::new(),
            mount: None,
        }
    }

    pub fn backing_file(&self) -> &Path {
        &self.backing_file
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn label_type(&self) -> LabelType {
        self.layout.label_type
    }

    pub fn layout(&self) -> &PartitionLayout {
        &self.layout
    }

    /// Realized partitions; empty until [`DiskImage::partition`] succeeds.
    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    pub fn is_partitioned(&self) -> bool {
        !self.partitions.is_empty()
    }

    pub fn is_mapped(&self) -> bool {
        self.is_partitioned() && self.partitions.iter().all(|p| p.loop_device.is_some())
    }

    pub fn is_mounted(&self) -> bool {
        self.mount.is_some()
    }

    /// Byte offset of the first partition. Raw boot assets must end before it.
    pub fn first_partition_offset(&self) -> u64 {
        self.partitions
            .first()
            .map(|p| p.begin_sector)
            .unwrap_or(FIRST_PARTITION_OFFSET_SECTORS)
            * SECTOR_SIZE
    }

    /// Create the backing file and write the partition table.
    ///
    /// The layout is fully validated before any file or command is touched.
    /// Partitioning an already partitioned image does nothing.
    pub fn partition(&mut self, ctx: &BuildContext) -> Result<()> {
        if self.is_partitioned() {
            return Ok(());
        }
        let plan = partitions::plan(&self.layout, self.size_bytes)?;
        partitions::create_backing_file(&self.backing_file, self.size_bytes)?;
        partitions::apply(ctx, &plan, &self.backing_file)?;
        self.partitions = plan.partitions;
        Ok(())
    }

    /// Root directory under which every partition is mounted.
    pub fn base_mount(&self) -> Result<&Path> {
        self.require_mounted().map(MountSession::root)
    }

    /// Root of the installed system: `system-a` when the layout has one,
    /// `writable` otherwise.
    pub fn system(&self) -> Result<PathBuf> {
        let session = self.require_mounted()?;
        self.role_path(session, Role::SystemA)
            .or_else(|| self.role_path(session, Role::Writable))
            .ok_or(ImageError::NotSetUp("partitioned with a system partition"))
    }

    pub fn boot(&self) -> Result<PathBuf> {
        let session = self.require_mounted()?;
        self.role_path(session, Role::Boot)
            .ok_or(ImageError::NotSetUp("partitioned with a boot partition"))
    }

    pub fn writable(&self) -> Result<PathBuf> {
        let session = self.require_mounted()?;
        self.role_path(session, Role::Writable)
            .ok_or(ImageError::NotSetUp("partitioned with a writable partition"))
    }

    fn require_mounted(&self) -> Result<&MountSession> {
        if !self.is_partitioned() {
            return Err(ImageError::NotSetUp("partitioned"));
        }
        self.mount.as_ref().ok_or(ImageError::NotMounted)
    }

    fn role_path(&self, session: &MountSession, role: Role) -> Option<PathBuf> {
        self.partitions
            .iter()
            .find(|p| p.role == role && p.filesystem.is_mountable())
            .map(|p| session.root().join(&p.mount_dir))
    }

    fn log_state(&self, state: &str) {
        info!("{}: {}", self.backing_file.display(), state);
    }
}

/// A bootable image variant.
///
/// The lifecycle operations default to the shared [`DiskImage`]
/// implementation; variants supply their layout at construction and the
/// bootloader installation in [`Image::setup_boot`].
pub trait Image {
    fn disk(&self) -> &DiskImage;
    fn disk_mut(&mut self) -> &mut DiskImage;
    fn bootloader(&self) -> Bootloader;

    /// Install the bootloader and boot assets into the mounted image.
    fn setup_boot(&mut self, ctx: &BuildContext) -> Result<()>;

    fn partition(&mut self, ctx: &BuildContext) -> Result<()> {
        self.disk_mut().partition(ctx)
    }

    fn map(&mut self, ctx: &BuildContext) -> Result<()> {
        self.disk_mut().map(ctx)
    }

    fn unmap(&mut self, ctx: &BuildContext) -> Result<()> {
        self.disk_mut().unmap(ctx)
    }

    fn format(&mut self, ctx: &BuildContext) -> Result<()> {
        self.disk().format(ctx)
    }

    fn mount(&mut self, ctx: &BuildContext) -> Result<()> {
        self.disk_mut().mount(ctx)
    }

    fn unmount(&mut self, ctx: &BuildContext) -> Result<()> {
        self.disk_mut().unmount(ctx)
    }

    fn base_mount(&self) -> Result<PathBuf> {
        self.disk().base_mount().map(Path::to_path_buf)
    }

    fn system(&self) -> Result<PathBuf> {
        self.disk().system()
    }

    fn boot(&self) -> Result<PathBuf> {
        self.disk().boot()
    }

    fn writable(&self) -> Result<PathBuf> {
        self.disk().writable()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::process::fake::FakeRunner;
    use crate::process::CommandOutput;

    pub const GIB: u64 = 1024 * 1024 * 1024;

    pub fn minimal_layout() -> PartitionLayout {
        PartitionLayout::new(LabelType::Msdos)
            .push(PartitionSpec::new(
                "system-boot",
                "boot",
                Filesystem::Vfat,
                PartitionSize::MiB(128),
                Role::Boot,
            ))
            .push(PartitionSpec::new(
                "writable",
                "writable",
                Filesystem::Ext4,
                PartitionSize::Remaining,
                Role::Writable,
            ))
            .boot_flag(1)
    }

    /// Script a `kpartx -avs` answer naming `count` partitions on loop0.
    pub fn script_kpartx(runner: &FakeRunner, count: usize) {
        let lines: String = (1..=count)
            .map(|i| format!("add map loop0p{} (252:{}): 0 262144 linear 7:0 8192\n", i, i - 1))
            .collect();
        runner.respond("kpartx -avs", CommandOutput::ok(lines));
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::build::context::fake;
    use tempfile::TempDir;

    #[test]
    fn test_paths_before_partitioning_are_not_set_up() {
        let image = DiskImage::new("/tmp/never.img", 4 * GIB, minimal_layout());
        assert!(matches!(image.system(), Err(ImageError::NotSetUp("partitioned"))));
        assert!(matches!(image.base_mount(), Err(ImageError::NotSetUp(_))));
    }

    #[test]
    fn test_paths_before_mounting_are_not_mounted() {
        let temp = TempDir::new().unwrap();
        let (ctx, _, _) = fake::context();
        let mut image = DiskImage::new(temp.path().join("disk.img"), 4 * GIB, minimal_layout());
        image.partition(&ctx).unwrap();
        assert!(matches!(image.boot(), Err(ImageError::NotMounted)));
        assert!(matches!(image.writable(), Err(ImageError::NotMounted)));
    }

    #[test]
    fn test_partition_creates_sparse_backing_file() {
        let temp = TempDir::new().unwrap();
        let (ctx, runner, _) = fake::context();
        let path = temp.path().join("disk.img");
        let mut image = DiskImage::new(&path, 4 * GIB, minimal_layout());

        image.partition(&ctx).unwrap();
        image.partition(&ctx).unwrap();

        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4 * GIB);
        assert_eq!(runner.count("parted"), 1);
        assert_eq!(image.partitions()[0].end_sector, 270335);
        assert_eq!(image.first_partition_offset(), 8192 * 512);
    }

    #[test]
    fn test_invalid_layout_creates_nothing() {
        let temp = TempDir::new().unwrap();
        let (ctx, runner, _) = fake::context();
        let path = temp.path().join("disk.img");
        let mut image = DiskImage::new(&path, 4 * GIB, minimal_layout().boot_flag(5));

        assert!(image.partition(&ctx).is_err());
        assert!(!path.exists());
        assert!(runner.calls().is_empty());
        assert!(!image.is_partitioned());
    }
}

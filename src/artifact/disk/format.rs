//! Filesystem creation on mapped partitions.

use tracing::info;

use super::layout::Filesystem;
use super::DiskImage;
use crate::build::context::BuildContext;
use crate::error::{ImageError, Result};
use crate::process::Cmd;

/// Logical sector size of a block device, as reported by `blockdev --getss`.
pub fn logical_sector_size(ctx: &BuildContext, device: &str) -> Result<u64> {
    let output = Cmd::new(&ctx.tools.blockdev)
        .args(["--getss", device])
        .run(ctx.runner())?;
    let raw = output.stdout.trim();
    raw.parse().map_err(|_| ImageError::CommandFailed {
        command: format!("{} --getss {}", ctx.tools.blockdev, device),
        output: format!("unexpected sector size '{}'", raw),
    })
}

/// `mkfs.vfat` arguments for a FAT32 filesystem.
///
/// One sector per cluster is forced for 512-byte sectors, which keeps small
/// boot partitions within the FAT32 cluster-count minimum.
pub fn vfat_args(label: &str, sector_size: u64, device: &str) -> Vec<String> {
    let mut args = vec!["-F".to_string(), "32".to_string(), "-n".to_string(), label.to_string()];
    if sector_size == 512 {
        args.extend(["-s".to_string(), "1".to_string()]);
    }
    args.extend(["-S".to_string(), sector_size.to_string(), device.to_string()]);
    args
}

impl DiskImage {
    /// Create the filesystem of every partition that has one.
    pub fn format(&self, ctx: &BuildContext) -> Result<()> {
        if !self.is_mapped() {
            return Err(ImageError::NotSetUp("mapped"));
        }

        for part in &self.partitions {
            let Some(name) = part.loop_device.as_deref() else {
                continue;
            };
            let device = ctx.mapper_device(name);
            let device = device.to_string_lossy();

            let cmd = match part.filesystem {
                Filesystem::None => continue,
                Filesystem::Vfat => {
                    let sector_size = logical_sector_size(ctx, &device)?;
                    Cmd::new(&ctx.tools.mkfs_vfat).args(vfat_args(&part.label, sector_size, &device))
                }
                Filesystem::Ext4 => Cmd::new(&ctx.tools.mkfs_ext4)
                    .args(["-F", "-L", part.label.as_str()])
                    .arg(&*device),
            };
            cmd.error_msg(format!("formatting {} ({})", part.label, name))
                .run(ctx.runner())?;
            info!("Formatted {} as {:?}", part.label, part.filesystem);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::disk::testing::*;
    use crate::build::context::fake;
    use crate::process::CommandOutput;
    use tempfile::TempDir;

    #[test]
    fn test_vfat_args_for_512_byte_sectors() {
        assert_eq!(
            vfat_args("system-boot", 512, "/dev/mapper/loop0p1").join(" "),
            "-F 32 -n system-boot -s 1 -S 512 /dev/mapper/loop0p1"
        );
        assert_eq!(
            vfat_args("system-boot", 4096, "/dev/mapper/loop0p1").join(" "),
            "-F 32 -n system-boot -S 4096 /dev/mapper/loop0p1"
        );
    }

    #[test]
    fn test_format_runs_mkfs_per_partition() {
        let temp = TempDir::new().unwrap();
        let (ctx, runner, _) = fake::context();
        let mut image = DiskImage::new(temp.path().join("disk.img"), 4 * GIB, minimal_layout());
        image.partition(&ctx).unwrap();
        script_kpartx(&runner, 2);
        image.map(&ctx).unwrap();
        runner.respond("blockdev --getss", CommandOutput::ok("512\n"));

        image.format(&ctx).unwrap();
        let calls = runner.calls();
        assert!(calls.contains(
            &"mkfs.vfat -F 32 -n system-boot -s 1 -S 512 /dev/mapper/loop0p1".to_string()
        ));
        assert!(calls.contains(&"mkfs.ext4 -F -L writable /dev/mapper/loop0p2".to_string()));
    }

    #[test]
    fn test_bad_sector_size_output() {
        let (ctx, runner, _) = fake::context();
        runner.respond("blockdev", CommandOutput::ok("n/a"));
        assert!(logical_sector_size(&ctx, "/dev/mapper/loop0p1").is_err());
    }

    #[test]
    fn test_format_requires_mapping() {
        let (ctx, _, _) = fake::context();
        let image = DiskImage::new("/tmp/x.img", 4 * GIB, minimal_layout());
        assert!(matches!(image.format(&ctx), Err(ImageError::NotSetUp("mapped"))));
    }
}

//! Mounting mapped partitions under a private temporary root.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::DiskImage;
use crate::build::context::BuildContext;
use crate::error::{ImageError, Result};
use crate::process::Cmd;

const MOUNT_ROOT_PREFIX: &str = "diskimage";

/// Active mounts of one image.
#[derive(Debug)]
pub struct MountSession {
    root: PathBuf,
    /// Mountpoints in the order they were mounted.
    mounted: Vec<PathBuf>,
}

impl MountSession {
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Unmount in reverse order, continuing past failures.
    ///
    /// Mountpoints that could not be unmounted stay in the session.
    fn unmount_all(&mut self, ctx: &BuildContext) -> Vec<ImageError> {
        let mut errors = Vec::new();
        let mut still_mounted = Vec::new();

        while let Some(mountpoint) = self.mounted.pop() {
            let result = Cmd::new(&ctx.tools.umount)
                .arg_path(&mountpoint)
                .run(ctx.runner());
            match result {
                Ok(_) => {
                    if let Err(e) = remove_empty_dirs(&mountpoint, &self.root) {
                        errors.push(e);
                    }
                }
                Err(e) => {
                    warn!("failed to unmount {}: {}", mountpoint.display(), e);
                    errors.push(e);
                    still_mounted.push(mountpoint);
                }
            }
        }

        still_mounted.reverse();
        self.mounted = still_mounted;
        errors
    }

    fn remove_root(&self) -> Result<()> {
        fs::remove_dir(&self.root)
            .map_err(|e| ImageError::io(format!("removing {}", self.root.display()), e))
    }
}

/// Remove `dir` and its now-empty parents up to and excluding `root`.
fn remove_empty_dirs(dir: &Path, root: &Path) -> Result<()> {
    let mut current = Some(dir);
    while let Some(path) = current {
        if path == root || !path.starts_with(root) {
            break;
        }
        if let Err(e) = fs::remove_dir(path) {
            if path == dir {
                return Err(ImageError::io(format!("removing {}", path.display()), e));
            }
            // A parent still holds another mountpoint.
            break;
        }
        current = path.parent();
    }
    Ok(())
}

fn create_mount_root() -> Result<PathBuf> {
    let root = tempfile::Builder::new()
        .prefix(MOUNT_ROOT_PREFIX)
        .tempdir()
        .map_err(|e| ImageError::io("creating mount root", e))?
        .keep();
    fs::set_permissions(&root, fs::Permissions::from_mode(0o755))
        .map_err(|e| ImageError::io(format!("setting permissions on {}", root.display()), e))?;
    Ok(root)
}

impl DiskImage {
    /// Mount every formatted partition below a fresh temporary root.
    ///
    /// Partitions are mounted in layout order. If one fails, those already
    /// mounted are unmounted again and the root is removed. Mountpoints that
    /// cannot be unmounted keep the image mounted. Mounting a mounted image
    /// does nothing.
    pub fn mount(&mut self, ctx: &BuildContext) -> Result<()> {
        if self.is_mounted() {
            return Ok(());
        }
        if !self.is_mapped() {
            return Err(ImageError::NotSetUp("mapped"));
        }

        let mut session = MountSession {
            root: create_mount_root()?,
            mounted: Vec::new(),
        };

        for part in self.partitions.iter().filter(|p| p.filesystem.is_mountable()) {
            let mountpoint = session.root.join(&part.mount_dir);
            let result = mount_partition(ctx, part.loop_device.as_deref(), &mountpoint);
            if let Err(e) = result {
                let mut cleanup = session.unmount_all(ctx);
                if mountpoint.is_dir() {
                    if let Err(dir_err) = remove_empty_dirs(&mountpoint, &session.root) {
                        cleanup.push(dir_err);
                    }
                }
                if session.mounted.is_empty() {
                    if let Err(root_err) = session.remove_root() {
                        cleanup.push(root_err);
                    }
                } else {
                    // Survivors stay tracked so unmount or unmap can retry them.
                    self.mount = Some(session);
                }
                return Err(e.with_cleanup(cleanup));
            }
            debug!("mounted {} at {}", part.label, mountpoint.display());
            session.mounted.push(mountpoint);
        }

        self.mount = Some(session);
        self.log_state("mounted");
        Ok(())
    }

    /// Flush and unmount every partition in reverse mount order.
    ///
    /// A failing `sync` aborts before anything is unmounted. A failing
    /// unmount does not stop the others; the image stays mounted with the
    /// survivors and every failure is reported. Unmounting an image that is
    /// not mounted does nothing.
    pub fn unmount(&mut self, ctx: &BuildContext) -> Result<()> {
        let Some(session) = self.mount.as_mut() else {
            return Ok(());
        };

        Cmd::new(&ctx.tools.sync)
            .error_msg("flushing filesystem buffers")
            .run(ctx.runner())?;

        let errors = session.unmount_all(ctx);
        if !session.mounted.is_empty() {
            return ImageError::from_cleanup(errors);
        }

        let root = session.remove_root();
        self.mount = None;
        self.log_state("unmounted");
        ImageError::from_cleanup(errors)?;
        root
    }
}

fn mount_partition(ctx: &BuildContext, loop_device: Option<&str>, mountpoint: &Path) -> Result<()> {
    let name = loop_device.ok_or(ImageError::NotSetUp("mapped"))?;
    fs::create_dir_all(mountpoint)
        .map_err(|e| ImageError::io(format!("creating {}", mountpoint.display()), e))?;
    Cmd::new(&ctx.tools.mount)
        .arg_path(&ctx.mapper_device(name))
        .arg_path(mountpoint)
        .run(ctx.runner())
        .map(|_| ())
}

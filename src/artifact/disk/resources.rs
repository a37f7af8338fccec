//! Stack of temporary resources created while installing a bootloader.
//!
//! Bind mounts, placeholder files and scratch directories are pushed as
//! they are created and released in reverse order. Unwinding attempts every
//! entry even when some fail.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::build::context::BuildContext;
use crate::error::{ImageError, Result};
use crate::process::Cmd;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    /// Mountpoint of a bind mount.
    BindMount(PathBuf),
    /// File created as a mount target.
    File(PathBuf),
    /// Empty scratch directory.
    Dir(PathBuf),
}

#[derive(Debug, Default)]
pub struct ResourceStack {
    stack: Vec<Resource>,
}

impl ResourceStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, resource: Resource) {
        self.stack.push(resource);
    }

    pub fn len(&self) -> usize {
        self.stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    /// `mount --bind source target`, recorded for unwinding.
    pub fn bind_mount(&mut self, ctx: &BuildContext, source: &Path, target: &Path) -> Result<()> {
        Cmd::new(&ctx.tools.mount)
            .arg("--bind")
            .arg_path(source)
            .arg_path(target)
            .run(ctx.runner())?;
        debug!("bound {} on {}", source.display(), target.display());
        self.push(Resource::BindMount(target.to_path_buf()));
        Ok(())
    }

    /// Create an empty file to serve as a bind-mount target.
    pub fn placeholder_file(&mut self, path: &Path) -> Result<()> {
        fs::File::create(path)
            .map_err(|e| ImageError::io(format!("creating {}", path.display()), e))?;
        self.push(Resource::File(path.to_path_buf()));
        Ok(())
    }

    /// Release everything in reverse creation order.
    pub fn unwind(&mut self, ctx: &BuildContext) -> Result<()> {
        let mut errors = Vec::new();
        while let Some(resource) = self.stack.pop() {
            if let Err(e) = release(ctx, &resource) {
                warn!("failed to release {:?}: {}", resource, e);
                errors.push(e);
            }
        }
        ImageError::from_cleanup(errors)
    }
}

fn release(ctx: &BuildContext, resource: &Resource) -> Result<()> {
    match resource {
        Resource::BindMount(target) => Cmd::new(&ctx.tools.umount)
            .arg_path(target)
            .run(ctx.runner())
            .map(|_| ()),
        Resource::File(path) => fs::remove_file(path)
            .map_err(|e| ImageError::io(format!("removing {}", path.display()), e)),
        Resource::Dir(path) => fs::remove_dir(path)
            .map_err(|e| ImageError::io(format!("removing {}", path.display()), e)),
    }
}

impl Drop for ResourceStack {
    fn drop(&mut self) {
        if !self.stack.is_empty() {
            warn!("{} boot setup resources were never released", self.stack.len());
        }
    }
}

//! End-to-end image build.
//!
//! ```text
//! descriptions ─▶ select variant ─▶ partition ─▶ map ─▶ format ─▶ mount
//!     ─▶ payload ─▶ boot setup ─▶ unmount ─▶ unmap ─▶ [qcow2 + snapshot]
//! ```
//!
//! Inputs are read, the backing file is partitioned and the payload is
//! unpacked without privileges. Every step touching devices or mounts runs
//! in its own privileged scope.
//! Once the image is mapped, it is always unmounted and unmapped again,
//! whether or not the steps in between succeeded.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::info;

use crate::artifact::disk::snapshot::convert_to_qcow2;
use crate::artifact::disk::{select_image, Image};
use crate::build::context::BuildContext;
use crate::build::payload::extract_payload;
use crate::config::BuildConfig;
use crate::description::{GadgetDescription, HardwareDescription};
use crate::error::{merge_cleanup, ImageError, Result};

/// Inputs of one build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    pub hardware: PathBuf,
    pub gadget: PathBuf,
    /// Tar archive unpacked into the system root.
    pub payload: PathBuf,
    /// Raw image to create.
    pub output: PathBuf,
    pub size_bytes: u64,
    /// Also convert to this qcow2 file.
    pub qcow2: Option<PathBuf>,
}

/// Exclusive advisory lock on a backing file, held for the whole build.
pub struct BuildLock {
    _file: File,
}

impl BuildLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(|e| ImageError::io(format!("opening {}", path.display()), e))?;
        file.try_lock_exclusive()
            .map_err(|_| ImageError::Locked(path.to_path_buf()))?;
        Ok(Self { _file: file })
    }
}

/// Build the image described by `request`. Returns the final artifact path.
pub fn build_image(ctx: &BuildContext, config: &BuildConfig, request: &BuildRequest) -> Result<PathBuf> {
    ctx.drop_privileges()?;

    let hardware = HardwareDescription::load(&request.hardware)?;
    let gadget = GadgetDescription::load(&request.gadget)?;
    let mut image = select_image(
        &hardware,
        &gadget,
        &request.output,
        request.size_bytes,
        config,
    )?;

    let _lock = BuildLock::acquire(&request.output)?;
    assemble(ctx, image.as_mut(), &request.payload)?;
    info!("Built {}", request.output.display());

    match &request.qcow2 {
        Some(qcow2) => {
            convert_to_qcow2(ctx, &request.output, qcow2, &config.snapshot_name)?;
            Ok(qcow2.clone())
        }
        None => Ok(request.output.clone()),
    }
}

/// Partition, populate and release `image`.
pub fn assemble(ctx: &BuildContext, image: &mut dyn Image, payload: &Path) -> Result<()> {
    image.partition(ctx)?;
    ctx.privileged(|| image.map(ctx))?;

    let populated = populate(ctx, image, payload);
    let teardown = ctx.privileged(|| match image.unmount(ctx) {
        Ok(()) => image.unmap(ctx),
        Err(e) => {
            let backing_file = image.disk().backing_file().to_path_buf();
            Err(e.with_cleanup(vec![ImageError::StillMapped(backing_file)]))
        }
    });
    merge_cleanup(populated, teardown)
}

fn populate(ctx: &BuildContext, image: &mut dyn Image, payload: &Path) -> Result<()> {
    ctx.privileged(|| image.format(ctx))?;
    ctx.privileged(|| image.mount(ctx))?;
    let system = image.system()?;
    // Untrusted input: the mount scope has already dropped privileges.
    extract_payload(ctx, payload, &system)?;
    ctx.privileged(|| image.setup_boot(ctx))
}

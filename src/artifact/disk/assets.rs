//! Boot assets shipped by a gadget: files copied into the boot partition
//! and raw blobs written at fixed offsets of the disk (bootloader stages).

use std::fs::{self, OpenOptions};
use std::io::{self, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};

use tracing::info;

use crate::error::{ImageError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootAsset {
    /// Copied to `target` (default: the source file name) under the boot mount.
    File { source: PathBuf, target: Option<PathBuf> },
    /// Written verbatim into the backing file at `offset` bytes.
    Raw { source: PathBuf, offset: u64 },
}

/// Destination of a file asset inside the boot partition.
///
/// The target must be relative and may not climb out with `..`.
pub fn file_asset_destination(boot: &Path, source: &Path, target: Option<&Path>) -> Result<PathBuf> {
    let relative = match target {
        Some(target) => target.to_path_buf(),
        None => PathBuf::from(
            source
                .file_name()
                .ok_or_else(|| ImageError::InvalidAssetTarget(source.to_path_buf()))?,
        ),
    };

    let safe = !relative.as_os_str().is_empty()
        && relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if !safe {
        return Err(ImageError::InvalidAssetTarget(relative));
    }
    Ok(boot.join(relative))
}

/// Copy a file asset into the boot partition, creating parent directories.
pub fn install_file_asset(boot: &Path, source: &Path, target: Option<&Path>) -> Result<PathBuf> {
    let dest = file_asset_destination(boot, source, target)?;
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| ImageError::io(format!("creating {}", parent.display()), e))?;
    }
    fs::copy(source, &dest).map_err(|e| {
        ImageError::io(format!("copying {} to {}", source.display(), dest.display()), e)
    })?;
    Ok(dest)
}

/// Check that a raw asset ends before `limit`, the first partition's byte offset.
pub fn check_raw_asset(source: &Path, offset: u64, limit: u64) -> Result<()> {
    let len = fs::metadata(source)
        .map_err(|e| ImageError::io(format!("reading {}", source.display()), e))?
        .len();
    let end = offset.checked_add(len).unwrap_or(u64::MAX);
    if end > limit {
        return Err(ImageError::RawAssetOverlapsPartition {
            path: source.to_path_buf(),
            end,
            limit,
        });
    }
    Ok(())
}

/// Write `source` into `backing_file` at `offset` without truncating it.
pub fn write_raw_asset(backing_file: &Path, source: &Path, offset: u64) -> Result<()> {
    let ctx = || format!("writing {} into {} at {}", source.display(), backing_file.display(), offset);
    let mut input = fs::File::open(source).map_err(|e| ImageError::io(ctx(), e))?;
    let mut output = OpenOptions::new()
        .write(true)
        .open(backing_file)
        .map_err(|e| ImageError::io(ctx(), e))?;
    output
        .seek(SeekFrom::Start(offset))
        .map_err(|e| ImageError::io(ctx(), e))?;
    io::copy(&mut input, &mut output).map_err(|e| ImageError::io(ctx(), e))?;
    Ok(())
}

/// Install every asset. Raw assets are all checked before any is written.
pub fn provision_assets(
    assets: &[BootAsset],
    boot: &Path,
    backing_file: &Path,
    first_partition_offset: u64,
) -> Result<()> {
    for asset in assets {
        if let BootAsset::Raw { source, offset } = asset {
            check_raw_asset(source, *offset, first_partition_offset)?;
        }
    }

    for asset in assets {
        match asset {
            BootAsset::File { source, target } => {
                let dest = install_file_asset(boot, source, target.as_deref())?;
                info!("Installed boot asset {}", dest.display());
            }
            BootAsset::Raw { source, offset } => {
                write_raw_asset(backing_file, source, *offset)?;
                info!("Wrote {} at byte {}", source.display(), offset);
            }
        }
    }
    Ok(())
}

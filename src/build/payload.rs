//! Unpacking the system payload into the mounted system root.

use std::path::Path;

use tracing::info;

use crate::build::context::BuildContext;
use crate::error::{ImageError, Result};
use crate::process::Cmd;

/// Extract `archive` into `dest`, keeping numeric ownership.
pub fn extract_payload(ctx: &BuildContext, archive: &Path, dest: &Path) -> Result<()> {
    if !archive.is_file() {
        return Err(ImageError::io(
            format!("reading payload {}", archive.display()),
            std::io::ErrorKind::NotFound.into(),
        ));
    }

    Cmd::new(&ctx.tools.tar)
        .args(["--numeric-owner", "-xf"])
        .arg_path(archive)
        .arg("-C")
        .arg_path(dest)
        .error_msg(format!("extracting {}", archive.display()))
        .run(ctx.runner())?;

    info!("Extracted {} into {}", archive.display(), dest.display());
    Ok(())
}

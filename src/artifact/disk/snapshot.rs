//! Conversion of a finished raw image to a compressed qcow2 with an
//! internal snapshot of its pristine state.

use std::path::Path;

use tracing::info;

use crate::build::context::BuildContext;
use crate::error::Result;
use crate::process::Cmd;

pub fn convert_to_qcow2(
    ctx: &BuildContext,
    raw: &Path,
    output: &Path,
    snapshot_name: &str,
) -> Result<()> {
    Cmd::new(&ctx.tools.qemu_img)
        .args(["convert", "-c", "-O", "qcow2", "-o", "compat=0.10"])
        .arg_path(raw)
        .arg_path(output)
        .error_msg(format!("converting {} to qcow2", raw.display()))
        .run(ctx.runner())?;

    Cmd::new(&ctx.tools.qemu_img)
        .args(["snapshot", "-c", snapshot_name])
        .arg_path(output)
        .error_msg(format!("creating snapshot '{}'", snapshot_name))
        .run(ctx.runner())?;

    info!("Wrote {} (snapshot '{}')", output.display(), snapshot_name);
    Ok(())
}

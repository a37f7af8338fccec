//! Loop/device-mapper exposure of image partitions through `kpartx`.

use tracing::debug;

use super::DiskImage;
use crate::build::context::BuildContext;
use crate::error::{ImageError, Result};
use crate::process::Cmd;

/// Field of a `kpartx -v` line holding the mapping name.
const KPARTX_NAME_FIELD: usize = 2;

/// Extract mapping names from `kpartx -avs` output.
///
/// Each line looks like
/// `add map loop0p1 (252:0): 0 262144 linear 7:0 8192`. Blank lines are
/// skipped; anything too short to carry a name is rejected.
pub fn parse_kpartx_output(output: &str) -> Result<Vec<String>> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            line.split_whitespace()
                .nth(KPARTX_NAME_FIELD)
                .map(str::to_string)
                .ok_or_else(|| ImageError::MapParse {
                    line: line.to_string(),
                })
        })
        .collect()
}

impl DiskImage {
    /// Expose every partition as a device-mapper node.
    ///
    /// Mapping an already mapped image does nothing. If kpartx reports a
    /// different number of partitions than the layout, the mappings it made
    /// are removed again before failing.
    pub fn map(&mut self, ctx: &BuildContext) -> Result<()> {
        if !self.is_partitioned() {
            return Err(ImageError::NotSetUp("partitioned"));
        }
        if self.is_mapped() {
            return Ok(());
        }

        let output = Cmd::new(&ctx.tools.kpartx)
            .arg("-avs")
            .arg_path(&self.backing_file)
            .error_msg(format!("mapping {}", self.backing_file.display()))
            .run(ctx.runner())?;

        let names = match parse_kpartx_output(&output.stdout) {
            Ok(names) if names.len() == self.partitions.len() => names,
            Ok(names) => {
                let err = ImageError::MapCount {
                    expected: self.partitions.len(),
                    found: names.len(),
                };
                return Err(err.with_cleanup(self.remove_mappings(ctx).err().into_iter().collect()));
            }
            Err(err) => {
                return Err(err.with_cleanup(self.remove_mappings(ctx).err().into_iter().collect()))
            }
        };

        for (part, name) in self.partitions.iter_mut().zip(names) {
            debug!("{} -> {}", part.label, name);
            part.loop_device = Some(name);
        }
        self.log_state("mapped");
        Ok(())
    }

    /// Remove the device-mapper nodes.
    ///
    /// A mounted image is unmounted first. Each mapping is cleared with
    /// `dmsetup clear`, stopping at the first failure, before `kpartx -d`
    /// deletes them. Unmapping an unmapped image does nothing.
    pub fn unmap(&mut self, ctx: &BuildContext) -> Result<()> {
        if !self.is_mapped() {
            return Ok(());
        }
        if self.is_mounted() {
            self.unmount(ctx)?;
        }

        for part in &self.partitions {
            if let Some(name) = &part.loop_device {
                Cmd::new(&ctx.tools.dmsetup)
                    .args(["clear", name.as_str()])
                    .error_msg(format!("clearing mapping {}", name))
                    .run(ctx.runner())?;
            }
        }

        self.remove_mappings(ctx)?;

        for part in &mut self.partitions {
            part.loop_device = None;
        }
        self.log_state("unmapped");
        Ok(())
    }

    fn remove_mappings(&self, ctx: &BuildContext) -> Result<()> {
        Cmd::new(&ctx.tools.kpartx)
            .arg("-d")
            .arg_path(&self.backing_file)
            .error_msg(format!("removing mappings of {}", self.backing_file.display()))
            .run(ctx.runner())
            .map(|_| ())
    }
}

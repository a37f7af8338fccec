//! Preflight checks for image builds.
//!
//! Validates that the host has every program the build will drive before
//! anything is partitioned, so a missing `kpartx` is reported up front
//! rather than halfway through with a mapped image.
//!
//! # Example
//!
//! ```rust,ignore
//! use device_image::config::ToolPaths;
//! use device_image::preflight::check_host_tools;
//!
//! check_host_tools(&ToolPaths::default(), false)?;
//! ```

use anyhow::{bail, Result};

use crate::config::ToolPaths;

/// Check if a command exists on the host system.
///
/// Absolute and relative paths are checked directly, bare names through PATH.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Check that specific tools are available.
///
/// Each tuple is (command, package). All missing tools are reported at once.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<_> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .collect();

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }

    Ok(())
}

/// Check every configured tool, plus `qemu-img` when a snapshot is wanted.
pub fn check_host_tools(tools: &ToolPaths, snapshot: bool) -> Result<()> {
    let mut required = tools.required();
    if snapshot {
        required.extend(tools.snapshot_tools());
    }
    check_required_tools(&required)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_exists() {
        assert!(command_exists("ls"));
        assert!(!command_exists("definitely_not_a_real_command_12345"));
    }

    #[test]
    fn test_check_required_tools_lists_every_missing_tool() {
        let tools = &[
            ("ls", "coreutils"),
            ("nonexistent_command_xyz", "fake-package"),
            ("another_missing_tool_abc", "other-package"),
        ];
        let msg = check_required_tools(tools).unwrap_err().to_string();
        assert!(msg.contains("nonexistent_command_xyz (install: fake-package)"));
        assert!(msg.contains("another_missing_tool_abc (install: other-package)"));
        assert!(!msg.contains("ls (install"));
    }

    #[test]
    fn test_host_tools_follow_configuration() {
        let mut tools = ToolPaths::default();
        for name in [
            &mut tools.parted,
            &mut tools.kpartx,
            &mut tools.dmsetup,
            &mut tools.mkfs_ext4,
            &mut tools.mkfs_vfat,
            &mut tools.blockdev,
            &mut tools.mount,
            &mut tools.umount,
            &mut tools.sync,
            &mut tools.chroot,
            &mut tools.tar,
        ] {
            *name = "ls".into();
        }
        tools.qemu_img = "definitely_not_qemu_img_987".into();

        assert!(check_host_tools(&tools, false).is_ok());
        let msg = check_host_tools(&tools, true).unwrap_err().to_string();
        assert!(msg.contains("qemu-utils"));
    }
}

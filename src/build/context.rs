//! Build context shared by every image operation.
//!
//! Bundles the command runner, the configured tool paths and the privilege
//! controller so disk operations take a single `&BuildContext`.

use std::path::PathBuf;

use crate::build::privileges::{with_privileges, NoPrivileges, PrivilegeControl, SudoPrivileges};
use crate::config::{BuildConfig, ToolPaths};
use crate::error::Result;
use crate::process::{CommandRunner, SystemRunner};

pub struct BuildContext {
    /// External program paths.
    pub tools: ToolPaths,
    runner: Box<dyn CommandRunner>,
    privileges: Box<dyn PrivilegeControl>,
}

impl BuildContext {
    pub fn new(
        tools: ToolPaths,
        runner: Box<dyn CommandRunner>,
        privileges: Box<dyn PrivilegeControl>,
    ) -> Self {
        Self {
            tools,
            runner,
            privileges,
        }
    }

    /// Context for a real build on this host.
    ///
    /// Under sudo, privileges are switched per step; otherwise the process
    /// identity is used as is.
    pub fn host(config: &BuildConfig) -> Self {
        let privileges: Box<dyn PrivilegeControl> = match SudoPrivileges::from_env() {
            Some(sudo) => Box::new(sudo),
            None => Box::new(NoPrivileges),
        };
        Self::new(
            config.tools.clone(),
            Box::new(SystemRunner::new(config.verbose)),
            privileges,
        )
    }

    pub fn runner(&self) -> &dyn CommandRunner {
        self.runner.as_ref()
    }

    /// Run `f` as root, dropping back afterwards whatever the outcome.
    pub fn privileged<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        with_privileges(self.privileges.as_ref(), f)
    }

    /// Lower privileges for unprivileged work (parsing inputs, planning).
    pub fn drop_privileges(&self) -> Result<()> {
        self.privileges.drop_privileges()
    }

    /// Device node for a kpartx mapping name such as `loop0p1`.
    pub fn mapper_device(&self, name: &str) -> PathBuf {
        self.tools.device_mapper_dir.join(name)
    }
}

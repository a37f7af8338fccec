//! Effective-uid switching for builds started through `sudo`.
//!
//! The process keeps root as its saved uid but runs unprivileged by
//! default. Only the steps that touch block devices, mounts or chroots
//! escalate, each inside its own scope.

use tracing::{debug, warn};

use crate::error::{merge_cleanup, ImageError, Result};

/// Raise and lower the effective identity of the process.
pub trait PrivilegeControl {
    fn escalate(&self) -> Result<()>;
    fn drop_privileges(&self) -> Result<()>;
}

/// Switches between root and the invoking user recorded by sudo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SudoPrivileges {
    uid: libc::uid_t,
    gid: libc::gid_t,
}

impl SudoPrivileges {
    pub fn new(uid: libc::uid_t, gid: libc::gid_t) -> Self {
        Self { uid, gid }
    }

    /// Read `SUDO_UID`/`SUDO_GID` when the real uid is root.
    ///
    /// Returns `None` when not running under sudo.
    pub fn from_env() -> Option<Self> {
        // SAFETY: getuid has no preconditions and cannot fail.
        if unsafe { libc::getuid() } != 0 {
            return None;
        }
        let uid = std::env::var("SUDO_UID").ok()?.parse().ok()?;
        let gid = std::env::var("SUDO_GID").ok()?.parse().ok()?;
        Some(Self::new(uid, gid))
    }
}

fn check(ret: libc::c_int, what: &str) -> Result<()> {
    if ret == 0 {
        Ok(())
    } else {
        Err(ImageError::Privilege(format!(
            "{}: {}",
            what,
            std::io::Error::last_os_error()
        )))
    }
}

impl PrivilegeControl for SudoPrivileges {
    fn escalate(&self) -> Result<()> {
        debug!("escalating to root");
        // SAFETY: plain syscalls on integer ids.
        check(unsafe { libc::seteuid(0) }, "seteuid(0)")?;
        check(unsafe { libc::setegid(0) }, "setegid(0)")
    }

    fn drop_privileges(&self) -> Result<()> {
        debug!("dropping to uid {} gid {}", self.uid, self.gid);
        // Group first: changing it needs the root euid.
        // SAFETY: plain syscalls on integer ids.
        check(unsafe { libc::setegid(self.gid) }, "setegid")?;
        check(unsafe { libc::seteuid(self.uid) }, "seteuid")
    }
}

/// Used when the process already runs with the identity it needs.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPrivileges;

impl PrivilegeControl for NoPrivileges {
    fn escalate(&self) -> Result<()> {
        Ok(())
    }

    fn drop_privileges(&self) -> Result<()> {
        Ok(())
    }
}

/// Elevated section. Privileges are dropped again on [`release`] or drop.
///
/// [`release`]: PrivilegeScope::release
pub struct PrivilegeScope<'a> {
    control: &'a dyn PrivilegeControl,
    active: bool,
}

impl<'a> PrivilegeScope<'a> {
    pub fn enter(control: &'a dyn PrivilegeControl) -> Result<Self> {
        if let Err(e) = control.escalate() {
            // A half-applied escalation must not linger.
            let cleanup = control.drop_privileges().err().into_iter().collect();
            return Err(e.with_cleanup(cleanup));
        }
        Ok(Self {
            control,
            active: true,
        })
    }

    /// Leave the scope, reporting a failure to drop.
    pub fn release(mut self) -> Result<()> {
        self.active = false;
        self.control.drop_privileges()
    }
}

impl Drop for PrivilegeScope<'_> {
    fn drop(&mut self) {
        if self.active {
            if let Err(e) = self.control.drop_privileges() {
                warn!("failed to drop privileges while unwinding: {}", e);
            }
        }
    }
}

/// Run `f` with elevated privileges, always dropping them afterwards.
pub fn with_privileges<T>(
    control: &dyn PrivilegeControl,
    f: impl FnOnce() -> Result<T>,
) -> Result<T> {
    let scope = PrivilegeScope::enter(control)?;
    let result = f();
    merge_cleanup(result, scope.release())
}

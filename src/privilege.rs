use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{DaemonError, DaemonResult};
use crate::sys::ProcessEnvironment;
use crate::types::{Group, User};

/// Filesystem context and identity the daemon switches to.
#[derive(Debug, Clone)]
pub struct Privileges<'a> {
    pub prevent_core: bool,
    pub chroot: Option<&'a Path>,
    pub working_directory: &'a Path,
    pub umask: u32,
    pub user: Option<&'a User>,
    pub group: Option<&'a Group>,
}

/// Target ids after name resolution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Identity {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

/// Looks up the numeric ids of the configured user and group.
pub fn resolve<E: ProcessEnvironment>(
    env: &E,
    user: Option<&User>,
    group: Option<&Group>,
) -> DaemonResult<Identity> {
    let uid = user
        .map(|u| env.resolve_user(u).map_err(|e| DaemonError::privilege(format!("resolve {u}"), e)))
        .transpose()?;
    let gid = group
        .map(|g| env.resolve_group(g).map_err(|e| DaemonError::privilege(format!("resolve {g}"), e)))
        .transpose()?;
    Ok(Identity { uid, gid })
}

/// Applies `privileges` in an order that never strands the process:
/// core limit, chroot and working directory while the old credentials still
/// allow traversal, then umask, then group before user (once the uid is
/// dropped the gid can no longer change).
pub fn apply<E: ProcessEnvironment>(env: &E, privileges: &Privileges<'_>) -> DaemonResult<()> {
    if privileges.prevent_core {
        env.prevent_core_dump().map_err(|source| DaemonError::Environment {
            operation: "disable core dumps",
            source,
        })?;
    }

    if let Some(root) = privileges.chroot {
        env.change_root(root).map_err(|e| {
            DaemonError::privilege(format!("change root directory to {}", root.display()), e)
        })?;
        debug!(root = %root.display(), "changed root directory");
    }

    let directory = privileges.working_directory;
    env.change_directory(directory).map_err(|e| {
        DaemonError::privilege(
            format!("change working directory to {}", directory.display()),
            e,
        )
    })?;

    let previous = env.set_umask(privileges.umask);
    debug!(
        umask = %format!("{:o}", privileges.umask),
        previous = %format!("{previous:o}"),
        "set umask"
    );

    let identity = resolve(env, privileges.user, privileges.group)?;
    if let Some(gid) = identity.gid {
        env.set_group(gid)
            .map_err(|e| DaemonError::privilege(format!("set group id to {gid}"), e))?;
        debug!(gid, "dropped group");
    }
    if let Some(uid) = identity.uid {
        env.set_user(uid)
            .map_err(|e| DaemonError::privilege(format!("set user id to {uid}"), e))?;
        debug!(uid, "dropped user");
    }
    Ok(())
}

/// Working directory the daemon uses when none is configured.
pub fn default_working_directory() -> PathBuf {
    PathBuf::from("/")
}

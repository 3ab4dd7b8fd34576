//! Owner identities and worker-process privilege drop.

use crate::error::{BroodError, Result};
use nix::unistd::{Gid, Uid, User, geteuid, initgroups, setgid, setuid};
use std::ffi::CString;

/// The credential a worker process runs as and is authorized to serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
}

impl Identity {
    pub fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.uid, self.gid)
    }
}

/// Switch the calling process to `identity`.
///
/// Group id is set before the supplementary groups because setgid can clear
/// the group list on some platforms; uid goes last so the first two calls
/// still run privileged. A non-root caller cannot switch and is left as-is,
/// which is the normal case for development runs.
///
/// Failure here is fatal for the worker: it must not serve connections
/// under the wrong credential.
pub fn drop_privileges(identity: Identity) -> Result<()> {
    if !geteuid().is_root() {
        tracing::debug!(%identity, "not running as root, skipping privilege drop");
        return Ok(());
    }

    let uid = Uid::from_raw(identity.uid);
    let gid = Gid::from_raw(identity.gid);

    let user = User::from_uid(uid)
        .map_err(|e| BroodError::Setup(format!("getpwuid({}): {}", identity.uid, e)))?
        .ok_or_else(|| {
            BroodError::Setup(format!(
                "no passwd entry for uid {}, cannot resolve user name",
                identity.uid
            ))
        })?;

    setgid(gid).map_err(|e| {
        BroodError::Setup(format!("setgid({}): {}", identity.gid, e))
    })?;

    let name = CString::new(user.name.as_bytes())
        .map_err(|_| BroodError::Setup(format!("user name for uid {} contains NUL", identity.uid)))?;
    initgroups(&name, gid).map_err(|e| {
        BroodError::Setup(format!("initgroups({}, {}): {}", user.name, identity.gid, e))
    })?;

    setuid(uid).map_err(|e| {
        BroodError::Setup(format!("setuid({}): {}", identity.uid, e))
    })?;

    tracing::debug!(%identity, "dropped privileges");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_display() {
        let id = Identity::new(1000, 100);
        assert_eq!(id.to_string(), "1000:100");
    }

    #[test]
    fn test_identity_equality() {
        assert_eq!(Identity::new(1, 2), Identity::new(1, 2));
        assert_ne!(Identity::new(1, 2), Identity::new(1, 3));
        assert_ne!(Identity::new(1, 2), Identity::new(2, 2));
    }

    #[test]
    fn test_drop_privileges_without_root_is_noop() {
        if geteuid().is_root() {
            // Cannot exercise the skip path as root.
            return;
        }
        drop_privileges(Identity::new(12345, 12345)).unwrap();
    }
}

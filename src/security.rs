#![forbid(unsafe_code)]

//! Startup safety checks.

use anyhow::{Result, bail};
use nix::unistd::Uid;

/// Refuses to start when running as root. The server writes into its temp
/// directory and spawns external binaries, neither of which should ever
/// happen with system-wide privileges.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!("{process} refuses to run as root; start it under a regular user account");
    }
    Ok(())
}

//! Process group anchoring
//!
//! A node manager puts all of its services into one process group, so a
//! single `killpg` reaches every service (and whatever they forked) on exit.
//! The group is allocated by an anchor: a short-lived process started in a
//! new group and never reaped, whose zombie keeps the group id valid.

use eyre::Context;
use tracing::{debug, warn};

/// Holds the anchor's zombie; dropping it reaps the anchor.
#[derive(Debug)]
pub struct ProcessGroupAnchor {
    anchor: std::process::Child,
    pgid: i32,
}

impl ProcessGroupAnchor {
    pub fn spawn() -> eyre::Result<Self> {
        use std::os::unix::process::CommandExt;

        let anchor = std::process::Command::new("true")
            .process_group(0)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .wrap_err("Failed to spawn process group anchor")?;

        let pgid = anchor.id() as i32;
        debug!("Process group anchor holds PGID {}", pgid);
        Ok(Self { anchor, pgid })
    }

    pub fn pgid(&self) -> i32 {
        self.pgid
    }

    /// Signal the whole group.
    pub fn signal(&self, signal: nix::sys::signal::Signal) {
        kill_process_group(self.pgid, signal);
    }
}

impl Drop for ProcessGroupAnchor {
    fn drop(&mut self) {
        let _ = self.anchor.kill();
        let _ = self.anchor.wait();
    }
}

/// Send one signal to a whole process group.
pub fn kill_process_group(pgid: i32, signal: nix::sys::signal::Signal) {
    use nix::{sys::signal::killpg, unistd::Pid};

    match killpg(Pid::from_raw(pgid), signal) {
        Ok(()) => debug!("Sent {:?} to process group {}", signal, pgid),
        Err(nix::errno::Errno::ESRCH) => debug!("Process group {} is already empty", pgid),
        Err(e) => warn!("Failed to signal process group {}: {}", pgid, e),
    }
}

//! Orphan cleanup
//!
//! Every launched process is recorded in a [`CleanupRegistry`] while it is
//! alive. On node manager exit the registry is walked: each process and its
//! descendants get SIGTERM, a short grace period, then SIGKILL.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
    time::Duration,
};
use tracing::debug;

/// Grace period between SIGTERM and SIGKILL during cleanup
pub const TERMINATION_GRACE_PERIOD: Duration = Duration::from_millis(200);

/// Live child processes, keyed by PID
#[derive(Debug, Default)]
pub struct CleanupRegistry {
    pids: Mutex<HashMap<u32, String>>,
}

impl CleanupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<u32, String>> {
        self.pids.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self, pid: u32, owner: &str) {
        debug!("[{}] Registered PID {}", owner, pid);
        self.table().insert(pid, owner.to_string());
    }

    pub fn unregister(&self, pid: u32) {
        if let Some(owner) = self.table().remove(&pid) {
            debug!("[{}] Unregistered PID {}", owner, pid);
        }
    }

    pub fn pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.table().keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }

    /// Terminate every registered process tree, then forget them.
    ///
    /// Returns the number of processes signalled.
    #[cfg(unix)]
    pub fn terminate_all(&self, grace: Duration) -> usize {
        let roots: Vec<(u32, String)> = self.table().drain().collect();
        if roots.is_empty() {
            return 0;
        }

        let mut targets = Vec::new();
        for (pid, owner) in &roots {
            debug!("[{}] Cleaning up PID {}", owner, pid);
            targets.push(*pid);
            targets.extend(super::tree::find_all_descendants(*pid));
        }
        signal_escalating(&targets, grace);
        targets.len()
    }

    #[cfg(not(unix))]
    pub fn terminate_all(&self, _grace: Duration) -> usize {
        let count = self.table().len();
        self.table().clear();
        count
    }
}

/// Kill every descendant of the current process.
#[cfg(unix)]
pub fn kill_all_descendants(grace: Duration) {
    let descendants = super::tree::find_all_descendants(std::process::id());
    if descendants.is_empty() {
        debug!("No descendant processes to terminate");
        return;
    }
    debug!("Terminating {} descendant processes", descendants.len());
    signal_escalating(&descendants, grace);
}

#[cfg(not(unix))]
pub fn kill_all_descendants(_grace: Duration) {}

/// SIGTERM in reverse order (children first), wait, then SIGKILL.
#[cfg(unix)]
fn signal_escalating(pids: &[u32], grace: Duration) {
    use nix::{
        sys::signal::{kill, Signal},
        unistd::Pid,
    };

    for &pid in pids.iter().rev() {
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }
    std::thread::sleep(grace);
    for &pid in pids.iter().rev() {
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_unregister() {
        let registry = CleanupRegistry::new();
        registry.register(42, "mpf1:Markup:1");
        registry.register(7, "mpf1:Markup:2");
        assert_eq!(registry.pids(), vec![7, 42]);
        registry.unregister(42);
        registry.unregister(42);
        assert_eq!(registry.pids(), vec![7]);
    }

    #[cfg(unix)]
    #[test]
    fn test_terminate_all_kills_registered_process() {
        let mut child = std::process::Command::new("/bin/sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let registry = CleanupRegistry::new();
        registry.register(child.id(), "mpf1:Sleep:1");

        assert_eq!(registry.terminate_all(TERMINATION_GRACE_PERIOD), 1);
        assert!(registry.is_empty());

        let status = child.wait().unwrap();
        assert!(!status.success());
    }
}

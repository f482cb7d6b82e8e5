//! Launcher configuration and restart policy

use crate::process::CleanupRegistry;
use std::{path::PathBuf, process::ExitStatus, sync::Arc, time::Duration};

/// Default time given to a process to stop after the shutdown hook
pub const DEFAULT_SHUTDOWN_WAIT: Duration = Duration::from_secs(10);

/// Default pause between an abnormal exit and the relaunch
pub const DEFAULT_RESTART_BACKOFF: Duration = Duration::from_secs(1);

/// Exit code of a process terminated by SIGTERM
pub const SIGTERM_EXIT_CODE: i32 = 143;

/// Configuration shared by all launchers on a node manager
#[derive(Debug, Clone)]
pub struct LauncherSettings {
    /// Budget for each of the two shutdown waits (output closed, exited)
    pub shutdown_wait: Duration,
    /// Fixed delay before a restart
    pub restart_backoff: Duration,
    /// MPF installation root, exported as `MPF_HOME` for substitution
    pub mpf_home: Option<PathBuf>,
    /// Process group launched processes join (None = their own group)
    pub pgid: Option<i32>,
    /// Registry of live child PIDs for orphan cleanup
    pub cleanup: Option<Arc<CleanupRegistry>>,
}

impl Default for LauncherSettings {
    fn default() -> Self {
        Self {
            shutdown_wait: DEFAULT_SHUTDOWN_WAIT,
            restart_backoff: DEFAULT_RESTART_BACKOFF,
            mpf_home: None,
            pgid: None,
            cleanup: None,
        }
    }
}

/// How a run of the process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Exit code 0
    Normal,
    /// Exit code 143 or killed by SIGTERM
    Terminated,
    /// Anything else, including a failed spawn
    Abnormal(Option<i32>),
}

impl ExitKind {
    pub fn from_code(code: Option<i32>) -> Self {
        match code {
            Some(0) => ExitKind::Normal,
            Some(SIGTERM_EXIT_CODE) => ExitKind::Terminated,
            other => ExitKind::Abnormal(other),
        }
    }

    pub fn from_status(status: &ExitStatus) -> Self {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if status.signal() == Some(nix::libc::SIGTERM) {
                return ExitKind::Terminated;
            }
        }
        Self::from_code(status.code())
    }

    pub fn is_abnormal(&self) -> bool {
        matches!(self, ExitKind::Abnormal(_))
    }
}

/// What the supervisor does after a run ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Relaunch after the backoff
    Restart,
    /// Failed too fast on a restart: disable restarts and flag the service
    Fatal,
    /// Stop supervising
    Finish,
}

/// Restart policy.
///
/// Only abnormal exits are restarted, and only while restarts are allowed.
/// A restarted run that dies before `min_up` has elapsed is fatal; the very
/// first run is exempt.
pub fn restart_decision(
    exit: ExitKind,
    uptime: Duration,
    min_up: Duration,
    first_run: bool,
    restart_allowed: bool,
) -> RestartDecision {
    if !exit.is_abnormal() || !restart_allowed {
        return RestartDecision::Finish;
    }
    if uptime < min_up && !first_run {
        return RestartDecision::Fatal;
    }
    RestartDecision::Restart
}

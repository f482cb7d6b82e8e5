//! Process launcher
//!
//! A [`ProcessLauncher`] owns one service instance's OS process: it resolves
//! the command, starts a supervision task that spawns and restarts the
//! process according to the restart policy, and stops it on request.
//!
//! The launcher kind only changes two things, expressed as a
//! [`LaunchStrategy`]: how the process is asked to stop and which library
//! directory it needs.

pub mod cmdline;
pub mod environment;
pub mod output;
pub mod state;
mod supervisor;

pub use environment::{LaunchStrategy, ShutdownSignal};
pub use output::{LineFilter, LogFileReceiver, OutputHooks, OutputReceiver, StreamKind};
pub use state::{ExitKind, LauncherSettings, RestartDecision};

use crate::state::descriptors::ServiceDescriptor;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use supervisor::{LauncherShared, RunPlan};
use tracing::{debug, error, warn};

/// Grace given to the supervision task to observe a forced kill
const KILL_GRACE: Duration = Duration::from_secs(1);

pub struct ProcessLauncher {
    service: ServiceDescriptor,
    settings: LauncherSettings,
    hooks: OutputHooks,
    strategy: LaunchStrategy,
    shared: Arc<LauncherShared>,
    started: AtomicBool,
    shutdown_started: AtomicBool,
}

impl ProcessLauncher {
    pub fn new(service: ServiceDescriptor, settings: LauncherSettings, hooks: OutputHooks) -> Self {
        let strategy =
            LaunchStrategy::for_kind(service.service.launcher, settings.mpf_home.as_deref());
        let shared = Arc::new(LauncherShared::new(service.fully_qualified_name()));
        Self {
            service,
            settings,
            hooks,
            strategy,
            shared,
            started: AtomicBool::new(false),
            shutdown_started: AtomicBool::new(false),
        }
    }

    /// Resolve the command and start supervising in the background.
    ///
    /// Returns false, and marks the launcher as run to completion, when the
    /// command cannot be resolved or no runtime is available. Also returns
    /// false once shutdown has begun. Calling it again after a successful
    /// start does nothing.
    pub fn startup(&self, min_service_up_time: Duration) -> bool {
        if self.shutdown_started.load(Ordering::SeqCst) {
            debug!("[{}] Shut down before it was started", self.fully_qualified_name());
            return false;
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return !self.shared.fatal.load(Ordering::SeqCst);
        }

        let fqn = self.fully_qualified_name();
        let lookup = environment::variable_lookup(&self.settings);

        let program = match cmdline::resolve_command(&self.service.service.cmd, &lookup) {
            Ok(program) => program,
            Err(e) => {
                error!("[{}] Unable to resolve command: {:#}", fqn, e);
                self.shared.restart_on_failure.store(false, Ordering::SeqCst);
                self.shared.finish();
                return false;
            }
        };
        let args = cmdline::build_args(&self.service.service.args, &lookup);
        let env = environment::build_environment(
            &self.service,
            &self.strategy,
            std::env::vars(),
            &lookup,
        );

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                error!("[{}] No async runtime to supervise in: {}", fqn, e);
                self.shared.restart_on_failure.store(false, Ordering::SeqCst);
                self.shared.finish();
                return false;
            }
        };

        debug!("[{}] Launching {} {:?}", fqn, program.display(), args);
        let plan = RunPlan {
            service: self.service.clone(),
            program,
            args,
            env,
            strategy: self.strategy.clone(),
            min_up: min_service_up_time,
        };
        handle.spawn(supervisor::supervise(
            self.shared.clone(),
            plan,
            self.settings.clone(),
            self.hooks.clone(),
        ));
        true
    }

    /// Stop the process and disable restarts. Idempotent.
    ///
    /// Waits up to the shutdown budget for stdout to close, then up to the
    /// same budget for the supervisor to finish, and kills the process if
    /// it is still alive after that.
    pub async fn shutdown(&self) {
        let fqn = self.fully_qualified_name();
        if self.shutdown_started.swap(true, Ordering::SeqCst) {
            self.wait_for_completion().await;
            return;
        }

        self.shared.restart_on_failure.store(false, Ordering::SeqCst);
        self.shared.stopping.store(true, Ordering::SeqCst);
        self.shared.stop.notify_one();

        if !self.started.load(Ordering::SeqCst) {
            self.shared.finish();
            return;
        }

        if *self.shared.alive.borrow() {
            supervisor::request_stop(&self.shared, &self.strategy).await;
        }

        let wait = self.settings.shutdown_wait;
        let mut stdout_open = self.shared.stdout_open.subscribe();
        if tokio::time::timeout(wait, stdout_open.wait_for(|open| !*open))
            .await
            .is_err()
        {
            debug!("[{}] Output still open after {:?}", fqn, wait);
        }

        let mut completed = self.shared.completed.subscribe();
        if tokio::time::timeout(wait, completed.wait_for(|done| *done))
            .await
            .is_ok()
        {
            return;
        }

        let pid = self.shared.pid.load(Ordering::SeqCst);
        if *self.shared.alive.borrow() && pid != 0 {
            warn!("[{}] Did not stop within {:?}, killing PID {}", fqn, wait, pid);
            supervisor::send_signal(fqn, pid, nix::sys::signal::Signal::SIGKILL);
        }
        if tokio::time::timeout(KILL_GRACE, completed.wait_for(|done| *done))
            .await
            .is_err()
        {
            warn!("[{}] Supervisor still running after forced kill", fqn);
        }
    }

    /// Write a line to the running process's stdin.
    pub async fn send_line(&self, text: &str) -> eyre::Result<()> {
        supervisor::write_line(&self.shared, text).await
    }

    /// Resolves once the supervision loop has ended.
    pub async fn wait_for_completion(&self) {
        let mut completed = self.shared.completed.subscribe();
        let _ = completed.wait_for(|done| *done).await;
    }

    pub fn service(&self) -> &ServiceDescriptor {
        &self.service
    }

    pub fn fully_qualified_name(&self) -> &str {
        self.service.fully_qualified_name()
    }

    pub fn strategy(&self) -> &LaunchStrategy {
        &self.strategy
    }

    pub fn is_run_to_completion(&self) -> bool {
        self.shared.run_to_completion.load(Ordering::SeqCst)
    }

    pub fn has_fatal_issue(&self) -> bool {
        self.shared.fatal.load(Ordering::SeqCst)
    }

    pub fn is_alive(&self) -> bool {
        *self.shared.alive.borrow()
    }

    pub fn restarts(&self) -> u32 {
        self.shared.restarts.load(Ordering::SeqCst)
    }

    pub fn pid(&self) -> Option<u32> {
        match self.shared.pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    pub fn start_time_millis(&self) -> u64 {
        self.shared.start_time_millis.load(Ordering::SeqCst)
    }
}

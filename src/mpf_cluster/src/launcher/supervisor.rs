//! Supervision task of a single service process
//!
//! One task per launcher runs the spawn, wait, classify, restart cycle. Two
//! more tasks drain the process's stdout and stderr for each run. State that
//! the owning [`ProcessLauncher`](super::ProcessLauncher) needs to observe
//! lives in [`LauncherShared`]; waits use `watch` channels instead of polling.

use super::{
    environment::{build_command, LaunchStrategy, ShutdownSignal},
    output::{drain_stream, OutputHooks, StreamKind},
    state::{restart_decision, ExitKind, LauncherSettings, RestartDecision},
};
use crate::{
    state::descriptors::{now_millis, ServiceDescriptor},
    util::logging::is_verbose,
};
use eyre::{bail, WrapErr};
use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::{
    io::AsyncWriteExt,
    process::ChildStdin,
    sync::{watch, Mutex, Notify},
};
use tracing::{debug, error, info, warn};

/// State shared between a launcher handle and its supervision task
pub(crate) struct LauncherShared {
    pub fqn: String,
    /// Cleared by shutdown or a fatal fast failure
    pub restart_on_failure: AtomicBool,
    /// Set once shutdown has been requested
    pub stopping: AtomicBool,
    pub run_to_completion: AtomicBool,
    pub fatal: AtomicBool,
    pub restarts: AtomicU32,
    /// PID of the current run, 0 when nothing is running
    pub pid: AtomicU32,
    pub start_time_millis: AtomicU64,
    pub stdin: Mutex<Option<ChildStdin>>,
    pub stdout_open: watch::Sender<bool>,
    pub alive: watch::Sender<bool>,
    pub completed: watch::Sender<bool>,
    /// Wakes the supervisor out of a restart backoff
    pub stop: Notify,
}

impl LauncherShared {
    pub fn new(fqn: &str) -> Self {
        Self {
            fqn: fqn.to_string(),
            restart_on_failure: AtomicBool::new(true),
            stopping: AtomicBool::new(false),
            run_to_completion: AtomicBool::new(false),
            fatal: AtomicBool::new(false),
            restarts: AtomicU32::new(0),
            pid: AtomicU32::new(0),
            start_time_millis: AtomicU64::new(0),
            stdin: Mutex::new(None),
            stdout_open: watch::Sender::new(false),
            alive: watch::Sender::new(false),
            completed: watch::Sender::new(false),
            stop: Notify::new(),
        }
    }

    pub fn restart_allowed(&self) -> bool {
        self.restart_on_failure.load(Ordering::SeqCst)
    }

    pub fn finish(&self) {
        self.run_to_completion.store(true, Ordering::SeqCst);
        self.completed.send_replace(true);
    }
}

/// Everything needed to start one run, resolved once at startup
pub(crate) struct RunPlan {
    pub service: ServiceDescriptor,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub strategy: LaunchStrategy,
    pub min_up: Duration,
}

/// Run the service until it finishes, becomes fatal or is shut down.
pub(crate) async fn supervise(
    shared: Arc<LauncherShared>,
    plan: RunPlan,
    settings: LauncherSettings,
    hooks: OutputHooks,
) {
    let fqn = shared.fqn.clone();
    let mut first_run = true;

    while shared.restart_allowed() {
        let command = match build_command(
            &plan.service,
            &plan.program,
            &plan.args,
            &plan.env,
            &settings,
        ) {
            Ok(command) => command,
            Err(e) => {
                error!("[{}] Unable to prepare launch: {:#}", fqn, e);
                shared.restart_on_failure.store(false, Ordering::SeqCst);
                shared.fatal.store(true, Ordering::SeqCst);
                break;
            }
        };

        let (exit, uptime) = run_once(&shared, command, &plan.strategy, &settings, &hooks).await;
        debug!("[{}] Exited ({:?}) after {:?}", fqn, exit, uptime);

        match restart_decision(exit, uptime, plan.min_up, first_run, shared.restart_allowed()) {
            RestartDecision::Finish => break,
            RestartDecision::Fatal => {
                error!(
                    "[{}] Failed again after {:?}, less than the minimum up time of {:?}; not restarting",
                    fqn, uptime, plan.min_up
                );
                shared.restart_on_failure.store(false, Ordering::SeqCst);
                shared.fatal.store(true, Ordering::SeqCst);
                break;
            }
            RestartDecision::Restart => {
                let attempt = shared.restarts.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(
                    "[{}] Exited abnormally ({:?}), restart {} in {:?}",
                    fqn, exit, attempt, settings.restart_backoff
                );
                tokio::select! {
                    _ = tokio::time::sleep(settings.restart_backoff) => {}
                    _ = shared.stop.notified() => {
                        debug!("[{}] Shutdown during restart backoff", fqn);
                    }
                }
            }
        }
        first_run = false;
    }

    if is_verbose() {
        info!("[{}] Supervision finished", fqn);
    }
    shared.finish();
}

/// Spawn once and wait for the exit. A failed spawn counts as an abnormal
/// exit with zero uptime.
async fn run_once(
    shared: &Arc<LauncherShared>,
    mut command: tokio::process::Command,
    strategy: &LaunchStrategy,
    settings: &LauncherSettings,
    hooks: &OutputHooks,
) -> (ExitKind, Duration) {
    let fqn = &shared.fqn;
    let started = Instant::now();

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            error!("[{}] Unable to start: {}", fqn, e);
            return (ExitKind::Abnormal(None), Duration::ZERO);
        }
    };

    let pid = child.id().unwrap_or(0);
    shared.pid.store(pid, Ordering::SeqCst);
    shared.start_time_millis.store(now_millis(), Ordering::SeqCst);
    if let Some(cleanup) = &settings.cleanup {
        cleanup.register(pid, fqn);
    }

    *shared.stdin.lock().await = child.stdin.take();

    match child.stdout.take() {
        Some(stdout) => {
            shared.stdout_open.send_replace(true);
            let shared = shared.clone();
            let hooks = hooks.clone();
            tokio::spawn(async move {
                drain_stream(stdout, &shared.fqn, StreamKind::Stdout, &hooks).await;
                shared.stdout_open.send_replace(false);
            });
        }
        None => {
            shared.stdout_open.send_replace(false);
        }
    }
    if let Some(stderr) = child.stderr.take() {
        let fqn = fqn.clone();
        let hooks = hooks.clone();
        tokio::spawn(async move {
            drain_stream(stderr, &fqn, StreamKind::Stderr, &hooks).await;
        });
    }

    shared.alive.send_replace(true);
    if is_verbose() {
        info!("[{}] Started with PID {}", fqn, pid);
    }

    // shutdown raced with the spawn
    if shared.stopping.load(Ordering::SeqCst) {
        request_stop(shared, strategy).await;
    }

    let status = child.wait().await;
    let uptime = started.elapsed();

    if let Some(cleanup) = &settings.cleanup {
        cleanup.unregister(pid);
    }
    shared.stdin.lock().await.take();
    shared.pid.store(0, Ordering::SeqCst);
    shared.alive.send_replace(false);

    let exit = match status {
        Ok(status) => ExitKind::from_status(&status),
        Err(e) => {
            error!("[{}] Failed to wait for process: {}", fqn, e);
            ExitKind::Abnormal(None)
        }
    };
    (exit, uptime)
}

/// Ask the running process to stop the way its launcher kind expects.
pub(crate) async fn request_stop(shared: &LauncherShared, strategy: &LaunchStrategy) {
    match &strategy.shutdown {
        ShutdownSignal::Terminate => {
            let pid = shared.pid.load(Ordering::SeqCst);
            if pid != 0 {
                send_signal(&shared.fqn, pid, nix::sys::signal::Signal::SIGTERM);
            }
        }
        ShutdownSignal::StdinLine(line) => {
            if let Err(e) = write_line(shared, line).await {
                debug!("[{}] Unable to send quit line: {:#}", shared.fqn, e);
            }
        }
    }
}

/// Write one line to the current run's stdin.
pub(crate) async fn write_line(shared: &LauncherShared, text: &str) -> eyre::Result<()> {
    let mut stdin = shared.stdin.lock().await;
    let Some(pipe) = stdin.as_mut() else {
        bail!("[{}] process is not running", shared.fqn);
    };
    pipe.write_all(text.as_bytes())
        .await
        .wrap_err_with(|| format!("[{}] write to stdin failed", shared.fqn))?;
    pipe.write_all(b"\n").await?;
    pipe.flush().await?;
    Ok(())
}

pub(crate) fn send_signal(fqn: &str, pid: u32, signal: nix::sys::signal::Signal) {
    use nix::{sys::signal::kill, unistd::Pid};

    match kill(Pid::from_raw(pid as i32), signal) {
        Ok(()) => debug!("[{}] Sent {:?} to PID {}", fqn, signal, pid),
        Err(e) => debug!("[{}] Unable to send {:?} to PID {}: {}", fqn, signal, pid, e),
    }
}

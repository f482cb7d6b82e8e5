//! Shared utilities for command handlers

use mpf_cluster::process::{kill_all_descendants, CleanupRegistry, TERMINATION_GRACE_PERIOD};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tracing::debug;

/// Build a Tokio multi-thread runtime sized to the machine.
///
/// Uses the number of CPUs capped at 8; the workload is mostly idle waiting
/// on child processes and channel events.
pub(crate) fn build_tokio_runtime() -> eyre::Result<tokio::runtime::Runtime> {
    let worker_threads = std::cmp::min(num_cpus::get(), 8);
    let max_blocking = worker_threads * 2;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .max_blocking_threads(max_blocking)
        .thread_name("mpf_cluster-worker")
        .enable_all()
        .build()?;
    debug!(
        "Tokio runtime created ({} worker threads, {} max blocking threads)",
        worker_threads, max_blocking
    );
    Ok(runtime)
}

/// Kills every launched process if the command unwinds without a graceful
/// shutdown.
pub(crate) struct CleanupGuard {
    enabled: AtomicBool,
    registry: Arc<CleanupRegistry>,
}

impl CleanupGuard {
    pub(crate) fn new(registry: Arc<CleanupRegistry>) -> Self {
        Self {
            enabled: AtomicBool::new(true),
            registry,
        }
    }

    /// Call once graceful shutdown has completed.
    pub(crate) fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
        debug!("CleanupGuard disabled after graceful shutdown");
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if !self.enabled.load(Ordering::Relaxed) {
            return;
        }
        let count = self.registry.terminate_all(TERMINATION_GRACE_PERIOD);
        debug!("CleanupGuard terminated {} registered processes", count);
        kill_all_descendants(TERMINATION_GRACE_PERIOD);
    }
}

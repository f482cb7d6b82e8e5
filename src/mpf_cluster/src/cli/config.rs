//! Runtime configuration (`--config`)

use eyre::{ensure, WrapErr};
use mpf_cluster::{
    launcher::LauncherSettings,
    state::descriptors::DEFAULT_MIN_SERVICE_UP_TIME_MILLIS,
};
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Used as the master's member description
    pub cluster_name: String,
    pub broker_uri: String,
    pub connect_timeout_ms: u64,
    pub launcher: LauncherConfig,
    pub reconcile_interval_ms: u64,
    pub drain_interval_ms: u64,
    pub auto_configure: bool,
    pub auto_unconfigure: bool,
    pub launch_on_join: bool,
    pub mpf_home: Option<PathBuf>,
    /// Base directory for per-service stdout/stderr logs
    pub service_log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    pub shutdown_wait_ms: u64,
    pub restart_backoff_ms: u64,
    pub min_service_up_time_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            cluster_name: "mpf".to_string(),
            broker_uri: "failover:(tcp://localhost:61616)".to_string(),
            connect_timeout_ms: 10_000,
            launcher: LauncherConfig::default(),
            reconcile_interval_ms: 5_000,
            drain_interval_ms: 2_000,
            auto_configure: false,
            auto_unconfigure: false,
            launch_on_join: true,
            mpf_home: std::env::var_os("MPF_HOME").map(PathBuf::from),
            service_log_dir: None,
        }
    }
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            shutdown_wait_ms: 10_000,
            restart_backoff_ms: 1_000,
            min_service_up_time_ms: DEFAULT_MIN_SERVICE_UP_TIME_MILLIS,
        }
    }
}

impl RuntimeConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }

    /// Launcher settings without the per-process parts (group, registry)
    pub fn launcher_settings(&self) -> LauncherSettings {
        LauncherSettings {
            shutdown_wait: Duration::from_millis(self.launcher.shutdown_wait_ms),
            restart_backoff: Duration::from_millis(self.launcher.restart_backoff_ms),
            mpf_home: self.mpf_home.clone(),
            ..Default::default()
        }
    }

    fn validate(&self) -> eyre::Result<()> {
        ensure!(self.reconcile_interval_ms > 0, "reconcile_interval_ms must be positive");
        ensure!(!self.cluster_name.trim().is_empty(), "cluster_name must not be empty");
        Ok(())
    }
}

/// Load the runtime config, or the defaults when no path is given.
pub fn load_runtime_config(path: Option<&Path>) -> eyre::Result<RuntimeConfig> {
    let config = match path {
        Some(path) => {
            debug!("Loading runtime config from {}", path.display());
            let text = std::fs::read_to_string(path)
                .wrap_err_with(|| format!("unable to read {}", path.display()))?;
            serde_yaml::from_str(&text)
                .wrap_err_with(|| format!("invalid runtime config {}", path.display()))?
        }
        None => RuntimeConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime.yaml");
        std::fs::write(
            &path,
            "broker_uri: tcp://amq:61616\nlauncher:\n  restart_backoff_ms: 50\n",
        )
        .unwrap();

        let config = load_runtime_config(Some(&path)).unwrap();
        assert_eq!(config.broker_uri, "tcp://amq:61616");
        assert_eq!(config.launcher.restart_backoff_ms, 50);
        assert_eq!(config.launcher.shutdown_wait_ms, 10_000);
        assert_eq!(
            config.launcher_settings().restart_backoff,
            Duration::from_millis(50)
        );
    }

    #[test]
    fn test_zero_reconcile_interval_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime.yaml");
        std::fs::write(&path, "reconcile_interval_ms: 0\n").unwrap();
        assert!(load_runtime_config(Some(&path)).is_err());
    }
}

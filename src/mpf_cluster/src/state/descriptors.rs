//! Replicated entity descriptors

use super::states::States;
use serde::{Deserialize, Serialize};
use std::{
    path::PathBuf,
    time::{SystemTime, UNIX_EPOCH},
};

/// Default minimum time a restarted service must stay up before a fast
/// failure is considered fatal.
pub const DEFAULT_MIN_SERVICE_UP_TIME_MILLIS: u64 = 60_000;

/// How a service's process is launched and asked to stop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LauncherKind {
    /// Plain executable, stopped with SIGTERM
    #[default]
    Generic,
    /// Component executor: reads a quit line on stdin and needs the MPF
    /// library directory on its library search path
    Simple,
}

/// Environment variable applied to a launched process
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
    /// When set, the value is appended to an inherited value with this
    /// separator instead of replacing it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sep: Option<String>,
}

/// Static definition of a service: the process template
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub name: String,
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub launcher: LauncherKind,
    #[serde(default)]
    pub env: Vec<EnvVar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// One node-manager host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub hostname: String,
    pub last_known_state: States,
    pub min_service_up_time_millis: u64,
}

impl NodeDescriptor {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            last_known_state: States::Unknown,
            min_service_up_time_millis: DEFAULT_MIN_SERVICE_UP_TIME_MILLIS,
        }
    }

    pub fn with_min_service_up_time(mut self, millis: u64) -> Self {
        self.min_service_up_time_millis = millis;
        self
    }

    pub fn is_running(&self) -> bool {
        self.last_known_state == States::Running
    }
}

/// One configured instance of a service on a host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    fully_qualified_name: String,
    pub host: String,
    pub rank: u32,
    pub service: ServiceDefinition,
    pub broker_uri: String,
    pub restarts: u32,
    pub fatal_issue: bool,
    pub last_known_state: States,
    pub start_time_millis: u64,
}

impl ServiceDescriptor {
    pub fn new(
        service: ServiceDefinition,
        host: impl Into<String>,
        rank: u32,
        broker_uri: impl Into<String>,
    ) -> Self {
        let host = host.into();
        Self {
            fully_qualified_name: fully_qualified_name(&host, &service.name, rank),
            host,
            rank,
            service,
            broker_uri: broker_uri.into(),
            restarts: 0,
            fatal_issue: false,
            last_known_state: States::Unknown,
            start_time_millis: 0,
        }
    }

    /// `host:serviceName:rank`
    pub fn fully_qualified_name(&self) -> &str {
        &self.fully_qualified_name
    }

    pub fn name(&self) -> &str {
        &self.service.name
    }

    pub fn is_alive(&self) -> bool {
        self.last_known_state == States::Running
    }

    /// Same instance with the same definition, ignoring runtime fields.
    pub fn same_definition(&self, other: &ServiceDescriptor) -> bool {
        self.fully_qualified_name == other.fully_qualified_name
            && self.service == other.service
            && self.broker_uri == other.broker_uri
    }
}

pub fn fully_qualified_name(host: &str, service_name: &str, rank: u32) -> String {
    format!("{}:{}:{}", host, service_name, rank)
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

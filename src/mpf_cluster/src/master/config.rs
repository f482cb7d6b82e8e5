//! Cluster configuration: node-manager targets and their service templates

use crate::state::descriptors::{NodeDescriptor, ServiceDefinition, ServiceDescriptor};
use eyre::WrapErr;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    fs,
    path::Path,
};
use tracing::{debug, warn};

/// Desired layout of the cluster
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub node_managers: Vec<NodeManagerConfig>,
    /// Templates given to node managers that are added automatically
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub new_node_services: Vec<ServiceTemplate>,
}

/// One node-manager host and the services it should run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeManagerConfig {
    pub target: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub auto_configured: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_service_up_time_millis: Option<u64>,
    #[serde(default)]
    pub services: Vec<ServiceTemplate>,
}

/// A service definition instantiated `count` times on a host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceTemplate {
    #[serde(default = "default_count")]
    pub count: u32,
    #[serde(flatten)]
    pub service: ServiceDefinition,
}

fn default_count() -> u32 {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Yaml,
    Json,
}

impl ConfigFormat {
    /// `.json` is JSON, everything else YAML
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => ConfigFormat::Json,
            _ => ConfigFormat::Yaml,
        }
    }
}

impl ClusterConfig {
    pub fn parse(text: &str, format: ConfigFormat) -> eyre::Result<Self> {
        match format {
            ConfigFormat::Yaml => serde_yaml::from_str(text).wrap_err("invalid YAML cluster config"),
            ConfigFormat::Json => serde_json::from_str(text).wrap_err("invalid JSON cluster config"),
        }
    }

    pub fn load(path: &Path) -> eyre::Result<Self> {
        debug!("Loading cluster config from {}", path.display());
        let text = fs::read_to_string(path)
            .wrap_err_with(|| format!("unable to read {}", path.display()))?;
        Self::parse(&text, ConfigFormat::from_path(path))
            .wrap_err_with(|| format!("unable to load {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> eyre::Result<()> {
        let text = match ConfigFormat::from_path(path) {
            ConfigFormat::Yaml => serde_yaml::to_string(self)?,
            ConfigFormat::Json => serde_json::to_string_pretty(self)?,
        };
        fs::write(path, text).wrap_err_with(|| format!("unable to write {}", path.display()))
    }

    pub fn has_target(&self, host: &str) -> bool {
        self.node_managers.iter().any(|nm| nm.target == host)
    }

    /// Add `host` with the new-node templates. False if already present.
    pub fn add_auto_configured(&mut self, host: &str) -> bool {
        if self.has_target(host) {
            return false;
        }
        self.node_managers.push(NodeManagerConfig {
            target: host.to_string(),
            auto_configured: true,
            min_service_up_time_millis: None,
            services: self.new_node_services.clone(),
        });
        true
    }

    /// Drop `host` if it was added automatically.
    pub fn remove_auto_configured(&mut self, host: &str) -> bool {
        let before = self.node_managers.len();
        self.node_managers
            .retain(|nm| !(nm.auto_configured && nm.target == host));
        self.node_managers.len() != before
    }
}

/// Nodes and services a configuration asks for
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredState {
    pub nodes: Vec<NodeDescriptor>,
    pub services: Vec<ServiceDescriptor>,
}

/// Expand a configuration into descriptors.
///
/// Targets that are empty or repeated are dropped, as are templates with no
/// name or command and templates repeating a name on the same host. Each
/// template yields ranks `1..=count`.
pub fn desired_state(
    config: &ClusterConfig,
    broker_uri: &str,
    default_min_up_time_millis: u64,
) -> DesiredState {
    let mut desired = DesiredState::default();
    let mut hosts = HashSet::new();

    for nm in &config.node_managers {
        let host = nm.target.trim();
        if host.is_empty() {
            warn!("Ignoring node manager with an empty target");
            continue;
        }
        if !hosts.insert(host.to_string()) {
            warn!("Ignoring duplicate node manager target {}", host);
            continue;
        }

        desired.nodes.push(
            NodeDescriptor::new(host).with_min_service_up_time(
                nm.min_service_up_time_millis
                    .unwrap_or(default_min_up_time_millis),
            ),
        );

        let mut names = HashSet::new();
        for template in &nm.services {
            let def = &template.service;
            if def.name.trim().is_empty() || def.cmd.trim().is_empty() {
                warn!("[{}] Ignoring service template without name or command", host);
                continue;
            }
            if !names.insert(def.name.clone()) {
                warn!("[{}] Ignoring duplicate service template {}", host, def.name);
                continue;
            }
            desired.services.extend(
                (1..=template.count)
                    .map(|rank| ServiceDescriptor::new(def.clone(), host, rank, broker_uri)),
            );
        }
    }

    desired
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
node_managers:
  - target: mpf1
    services:
      - name: Markup
        cmd: /bin/sleep
        args: ["30"]
        count: 2
      - name: Markup
        cmd: /bin/true
      - name: ""
        cmd: /bin/true
  - target: mpf1
    services: []
  - target: "  "
  - target: mpf2
    min_service_up_time_millis: 500
    services:
      - name: Ocv
        cmd: /bin/true
        launcher: simple
new_node_services:
  - name: Speech
    cmd: /bin/true
"#;

    #[test]
    fn test_desired_state_drops_malformed_entries() {
        let config = ClusterConfig::parse(YAML, ConfigFormat::Yaml).unwrap();
        let desired = desired_state(&config, "tcp://amq:61616", 60_000);

        let hosts: Vec<_> = desired.nodes.iter().map(|n| n.hostname.as_str()).collect();
        assert_eq!(hosts, vec!["mpf1", "mpf2"]);
        assert_eq!(desired.nodes[1].min_service_up_time_millis, 500);

        let fqns: Vec<_> = desired
            .services
            .iter()
            .map(|s| s.fully_qualified_name())
            .collect();
        assert_eq!(fqns, vec!["mpf1:Markup:1", "mpf1:Markup:2", "mpf2:Ocv:1"]);
        assert_eq!(desired.services[0].service.args, vec!["30".to_string()]);
    }

    #[test]
    fn test_auto_configured_round_trip() {
        let mut config = ClusterConfig::parse(YAML, ConfigFormat::Yaml).unwrap();
        assert!(!config.add_auto_configured("mpf1"));
        assert!(config.add_auto_configured("mpf9"));
        let added = config.node_managers.last().unwrap();
        assert!(added.auto_configured);
        assert_eq!(added.services[0].service.name, "Speech");

        // hand-configured hosts are never removed
        assert!(!config.remove_auto_configured("mpf2"));
        assert!(config.remove_auto_configured("mpf9"));
        assert!(!config.has_target("mpf9"));
    }

    #[test]
    fn test_save_and_load_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let config = ClusterConfig::parse(YAML, ConfigFormat::Yaml).unwrap();

        for name in ["nodes.json", "nodes.yaml"] {
            let path = dir.path().join(name);
            config.save(&path).unwrap();
            assert_eq!(ClusterConfig::load(&path).unwrap(), config);
        }
        let json = fs::read_to_string(dir.path().join("nodes.json")).unwrap();
        assert!(json.trim_start().starts_with('{'));
    }
}

//! Master-side cluster control
//!
//! The master owns the desired configuration. It turns configuration into
//! table entries, drives launches and shutdowns by setting service states
//! that node managers act on, and mirrors whatever node managers report.

use super::{
    config::{desired_state, ClusterConfig},
    StreamingJobHandler,
};
use crate::{
    channel::{
        messages::{ClusterMessage, StreamingJobMessage},
        ChannelError, ChannelEvent, GroupChannel,
    },
    identity::{self, NodeType},
    state::{ClusterEvent, ClusterState, NodeDescriptor, ServiceDescriptor, States, UpdateOutcome},
};
use eyre::{eyre, WrapErr};
use std::{
    collections::HashSet,
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tracing::{debug, info, warn};

/// Default wait for node managers to acknowledge a global shutdown
pub const DEFAULT_DRAIN_INTERVAL: Duration = Duration::from_secs(2);

/// Knobs of the master coordinator
#[derive(Debug, Clone)]
pub struct MasterOptions {
    pub broker_uri: String,
    pub default_min_up_time_millis: u64,
    pub drain_interval: Duration,
    /// Add unknown node managers to the config when they join
    pub auto_configure: bool,
    /// Remove automatically added node managers when they go down
    pub auto_unconfigure: bool,
    /// Launch a node's services as soon as it joins
    pub launch_on_join: bool,
    /// Where a pruned or extended config is written back
    pub config_path: Option<PathBuf>,
}

impl Default for MasterOptions {
    fn default() -> Self {
        Self {
            broker_uri: String::new(),
            default_min_up_time_millis: crate::state::descriptors::DEFAULT_MIN_SERVICE_UP_TIME_MILLIS,
            drain_interval: DEFAULT_DRAIN_INTERVAL,
            auto_configure: false,
            auto_unconfigure: false,
            launch_on_join: false,
            config_path: None,
        }
    }
}

/// What a config apply changed
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ApplySummary {
    pub nodes_added: usize,
    pub nodes_removed: usize,
    pub services_added: usize,
    pub services_updated: usize,
    pub services_removed: usize,
}

impl ApplySummary {
    pub fn is_empty(&self) -> bool {
        *self == ApplySummary::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServiceChange {
    Added,
    Updated,
    Unchanged,
}

#[derive(Clone)]
pub struct MasterCoordinator {
    state: Arc<ClusterState>,
    channel: GroupChannel,
    config: Arc<Mutex<ClusterConfig>>,
    options: Arc<MasterOptions>,
    jobs: Option<Arc<dyn StreamingJobHandler>>,
}

impl MasterCoordinator {
    pub fn new(
        state: Arc<ClusterState>,
        channel: GroupChannel,
        options: MasterOptions,
        jobs: Option<Arc<dyn StreamingJobHandler>>,
    ) -> Self {
        Self {
            state,
            channel,
            config: Arc::new(Mutex::new(ClusterConfig::default())),
            options: Arc::new(options),
            jobs,
        }
    }

    pub fn state(&self) -> &Arc<ClusterState> {
        &self.state
    }

    pub fn config(&self) -> ClusterConfig {
        self.config_guard().clone()
    }

    fn config_guard(&self) -> MutexGuard<'_, ClusterConfig> {
        self.config.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ===== Configuration =====

    /// Make `config` the desired layout and bring the tables in line.
    ///
    /// Applying the same config twice changes nothing the second time.
    pub fn apply_config(&self, config: ClusterConfig) -> ApplySummary {
        let desired = desired_state(
            &config,
            &self.options.broker_uri,
            self.options.default_min_up_time_millis,
        );
        *self.config_guard() = config;

        let mut summary = ApplySummary::default();
        let wanted_hosts: HashSet<&str> =
            desired.nodes.iter().map(|n| n.hostname.as_str()).collect();
        let wanted_services: HashSet<&str> = desired
            .services
            .iter()
            .map(|s| s.fully_qualified_name())
            .collect();

        for node in &desired.nodes {
            match self.state.node(&node.hostname) {
                None => {
                    self.publish_node(node.clone(), States::Configured);
                    summary.nodes_added += 1;
                }
                Some(existing)
                    if existing.min_service_up_time_millis != node.min_service_up_time_millis =>
                {
                    let state = existing.last_known_state;
                    let updated = NodeDescriptor {
                        min_service_up_time_millis: node.min_service_up_time_millis,
                        ..existing
                    };
                    self.publish_node(updated, state);
                }
                Some(_) => {}
            }
        }

        for service in &desired.services {
            match self.apply_service(service) {
                ServiceChange::Added => summary.services_added += 1,
                ServiceChange::Updated => summary.services_updated += 1,
                ServiceChange::Unchanged => {}
            }
        }

        for service in self.state.services() {
            if wanted_services.contains(service.fully_qualified_name())
                || service.last_known_state.is_deleting()
            {
                continue;
            }
            self.remove_service(service);
            summary.services_removed += 1;
        }

        for node in self.state.nodes() {
            if !wanted_hosts.contains(node.hostname.as_str()) {
                info!("Node manager {} is no longer configured", node.hostname);
                self.publish_node(node, States::DeleteInactive);
                summary.nodes_removed += 1;
            }
        }

        if !summary.is_empty() {
            info!("Applied config: {:?}", summary);
        }
        summary
    }

    /// Load a config file and apply it.
    pub fn load_and_apply(&self, path: &std::path::Path) -> eyre::Result<ApplySummary> {
        let config = ClusterConfig::load(path)?;
        Ok(self.apply_config(config))
    }

    /// Create or refresh one configured service.
    fn apply_service(&self, desired: &ServiceDescriptor) -> ServiceChange {
        let fqn = desired.fully_qualified_name();
        let Some(existing) = self.state.service(fqn) else {
            self.publish_service(desired.clone(), States::Configured);
            return ServiceChange::Added;
        };

        match existing.last_known_state {
            // never clobber a live or fatally failed service
            States::Running | States::InactiveNoStart => {
                if !existing.same_definition(desired) {
                    debug!("[{}] Definition changed; applies after the next stop", fqn);
                }
                ServiceChange::Unchanged
            }
            States::Delete | States::DeleteInactive => {
                info!("[{}] Configured again before deletion finished", fqn);
                self.publish_service(desired.clone(), States::Configured);
                ServiceChange::Updated
            }
            state if !existing.same_definition(desired) => {
                let mut updated = desired.clone();
                updated.restarts = existing.restarts;
                updated.start_time_millis = existing.start_time_millis;
                self.publish_service(updated, state);
                ServiceChange::Updated
            }
            _ => ServiceChange::Unchanged,
        }
    }

    /// Start deleting a service. Without a running node manager to confirm,
    /// the master completes the deletion itself.
    fn remove_service(&self, service: ServiceDescriptor) {
        let fqn = service.fully_qualified_name().to_string();
        let node_running = self.state.is_node_running(&service.host);
        info!("[{}] No longer configured, deleting", fqn);
        let service = self.publish_service(service, States::Delete);
        if !node_running {
            self.publish_service(service, States::DeleteInactive);
        }
    }

    // ===== Launch and shutdown =====

    /// Launch every launchable service whose node manager is running.
    ///
    /// Returns the number of services asked to launch.
    pub fn launch_all(&self) -> usize {
        self.state
            .services()
            .into_iter()
            .filter(|s| self.should_launch(s))
            .map(|s| self.publish_service(s, States::Launching))
            .count()
    }

    /// Launch the launchable services of one node manager.
    pub fn launch_node(&self, host: &str) -> usize {
        self.state
            .services_on_host(host)
            .into_iter()
            .filter(|s| self.should_launch(s))
            .map(|s| self.publish_service(s, States::Launching))
            .count()
    }

    fn should_launch(&self, service: &ServiceDescriptor) -> bool {
        service.last_known_state.is_launchable()
            && !service.fatal_issue
            && self.state.is_node_running(&service.host)
    }

    /// Ask every node manager to stop its services, then wait the drain
    /// interval for acknowledgements.
    pub async fn shutdown_all(&self) {
        let mut stopping = 0;
        for service in self.state.services() {
            match service.last_known_state {
                States::Running | States::Launching => {
                    self.publish_service(service, States::ShuttingDown);
                    stopping += 1;
                }
                States::Configured | States::Unknown => {
                    self.publish_service(service, States::Inactive);
                }
                _ => {}
            }
        }
        info!(
            "Asked {} services to stop, waiting {:?}",
            stopping, self.options.drain_interval
        );
        tokio::time::sleep(self.options.drain_interval).await;
    }

    // ===== Streaming jobs =====

    /// Send a streaming-job control message to the node manager on `host`.
    pub fn send_streaming_job(
        &self,
        host: &str,
        message: StreamingJobMessage,
    ) -> eyre::Result<()> {
        let address = self
            .node_manager_address(host)
            .ok_or_else(|| eyre!("no node manager for {} in the current view", host))?;
        self.channel
            .send(Some(&address), &ClusterMessage::StreamingJob(message))
            .wrap_err_with(|| format!("unable to reach {}", address))
    }

    fn node_manager_address(&self, host: &str) -> Option<String> {
        self.channel.view()?.into_iter().find(|address| {
            identity::decode(address)
                .is_some_and(|id| id.node_type == NodeType::NodeManager && id.host == host)
        })
    }

    // ===== Events =====

    pub fn handle_channel_event(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::Message { src, message } => self.handle_message(&src, message),
            ChannelEvent::View(view) => {
                self.state.reconcile_view(&view, false);
            }
        }
    }

    /// Mirror a peer's report into the tables.
    pub fn handle_message(&self, src: &str, message: ClusterMessage) {
        match message {
            ClusterMessage::ServiceStatusUpdate { service } => {
                let fqn = service.fully_qualified_name().to_string();
                let state = service.last_known_state;
                if self.state.apply_service_update(service) == UpdateOutcome::Stale {
                    debug!("[{}] Stale {} from {} ignored", fqn, state, src);
                }
            }
            ClusterMessage::NodeStatusUpdate { hostname, node } => {
                self.state.apply_node_update(&hostname, node);
            }
            ClusterMessage::StreamingJob(job) => match &self.jobs {
                Some(handler) => handler.handle(src, job),
                None => debug!("No streaming job handler, dropping {:?} from {}", job.kind, src),
            },
        }
    }

    /// React to table changes: automatic (un)configuration and launch on join.
    pub fn handle_cluster_event(&self, event: &ClusterEvent) {
        match event {
            ClusterEvent::NewManager { node } => {
                if self.options.auto_configure {
                    self.auto_configure(&node.hostname);
                }
                if self.options.launch_on_join {
                    let launched = self.launch_node(&node.hostname);
                    if launched > 0 {
                        info!("Launching {} services on {}", launched, node.hostname);
                    }
                }
            }
            ClusterEvent::ManagerDown { node } if self.options.auto_unconfigure => {
                self.auto_unconfigure(&node.hostname);
            }
            _ => {}
        }
    }

    fn auto_configure(&self, host: &str) {
        let config = {
            let mut config = self.config_guard();
            if !config.add_auto_configured(host) {
                return;
            }
            config.clone()
        };
        info!("Auto-configuring node manager {}", host);
        self.persist(&config);
        self.apply_config(config);
    }

    fn auto_unconfigure(&self, host: &str) {
        let config = {
            let mut config = self.config_guard();
            if !config.remove_auto_configured(host) {
                return;
            }
            config.clone()
        };
        info!("Auto-unconfiguring node manager {}", host);
        self.persist(&config);
        self.apply_config(config);
    }

    fn persist(&self, config: &ClusterConfig) {
        if let Some(path) = &self.options.config_path {
            if let Err(e) = config.save(path) {
                warn!("Unable to persist cluster config: {:#}", e);
            }
        }
    }

    // ===== Table writes =====

    /// Store and broadcast; the table changes even if the broadcast fails.
    fn publish_service(&self, service: ServiceDescriptor, state: States) -> ServiceDescriptor {
        let mut local = service.clone();
        local.last_known_state = state;
        match self.state.update_service_state(service, state) {
            Ok(service) => service,
            Err(ChannelError::NotConnected) => {
                debug!("[{}] Set {} locally, not connected", local.fully_qualified_name(), state);
                local
            }
            Err(e) => {
                warn!(
                    "[{}] Failed to broadcast {}: {}",
                    local.fully_qualified_name(),
                    state,
                    e
                );
                local
            }
        }
    }

    fn publish_node(&self, node: NodeDescriptor, state: States) {
        let host = node.hostname.clone();
        if let Err(e) = self.state.update_node(node, state) {
            warn!("[node {}] Failed to broadcast {}: {}", host, state, e);
        }
    }
}

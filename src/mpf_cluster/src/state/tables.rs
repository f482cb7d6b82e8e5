//! Replicated service and node tables
//!
//! [`ClusterState`] is the only owner of the two cluster-wide maps. Local
//! changes go through `update_*_state`, which mutates the entry and publishes
//! it while holding the table lock. Remote changes go through `apply_*`,
//! which runs the out-of-order guard first. Every state change of an entry is
//! announced on the [`Notifier`].

use super::{
    descriptors::{NodeDescriptor, ServiceDescriptor, DEFAULT_MIN_SERVICE_UP_TIME_MILLIS},
    notifier::{ClusterEvent, Notifier},
    states::{is_stale_update, States},
};
use crate::channel::{messages::ClusterMessage, ChannelError, Publisher, StateSource};
use eyre::WrapErr;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard},
};
use tokio::sync::mpsc;
use tracing::debug;

/// Result of applying a remote update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Stored; `previous` is the state held before, if the entry existed
    Applied { previous: Option<States> },
    /// Dropped by the out-of-order guard
    Stale,
}

impl UpdateOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, UpdateOutcome::Applied { .. })
    }

    /// Applied and the state differs from what was stored
    pub fn changed_to(&self, state: States) -> bool {
        matches!(self, UpdateOutcome::Applied { previous } if *previous != Some(state))
    }
}

/// Wire form of a state hand-off
#[derive(Debug, Default, Serialize, Deserialize)]
struct TableSnapshot {
    services: BTreeMap<String, ServiceDescriptor>,
    nodes: BTreeMap<String, NodeDescriptor>,
}

pub struct ClusterState {
    publisher: Arc<dyn Publisher>,
    services: Mutex<BTreeMap<String, ServiceDescriptor>>,
    nodes: Mutex<BTreeMap<String, NodeDescriptor>>,
    notifier: Notifier,
    default_min_up_time_millis: u64,
}

impl ClusterState {
    pub fn new(publisher: Arc<dyn Publisher>) -> Self {
        Self {
            publisher,
            services: Mutex::new(BTreeMap::new()),
            nodes: Mutex::new(BTreeMap::new()),
            notifier: Notifier::default(),
            default_min_up_time_millis: DEFAULT_MIN_SERVICE_UP_TIME_MILLIS,
        }
    }

    /// Minimum up time given to node managers first seen in a view
    pub fn with_default_min_up_time(mut self, millis: u64) -> Self {
        self.default_min_up_time_millis = millis;
        self
    }

    /// Register the single subscriber for table events.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ClusterEvent> {
        self.notifier.subscribe()
    }

    pub(crate) fn notify(&self, event: ClusterEvent) {
        self.notifier.notify(event);
    }

    fn services_table(&self) -> MutexGuard<'_, BTreeMap<String, ServiceDescriptor>> {
        self.services.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn nodes_table(&self) -> MutexGuard<'_, BTreeMap<String, NodeDescriptor>> {
        self.nodes.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ===== Queries =====

    pub fn service(&self, fqn: &str) -> Option<ServiceDescriptor> {
        self.services_table().get(fqn).cloned()
    }

    pub fn services(&self) -> Vec<ServiceDescriptor> {
        self.services_table().values().cloned().collect()
    }

    pub fn services_on_host(&self, host: &str) -> Vec<ServiceDescriptor> {
        self.services_table()
            .values()
            .filter(|s| s.host == host)
            .cloned()
            .collect()
    }

    pub fn node(&self, hostname: &str) -> Option<NodeDescriptor> {
        self.nodes_table().get(hostname).cloned()
    }

    pub fn nodes(&self) -> Vec<NodeDescriptor> {
        self.nodes_table().values().cloned().collect()
    }

    pub fn is_node_running(&self, hostname: &str) -> bool {
        self.nodes_table()
            .get(hostname)
            .is_some_and(NodeDescriptor::is_running)
    }

    // ===== Local updates =====

    /// Set a service's state, store it and broadcast it.
    ///
    /// `DeleteInactive` removes the entry instead of storing it. The table is
    /// updated even if the broadcast fails; the error goes to the caller.
    pub fn update_service_state(
        &self,
        mut service: ServiceDescriptor,
        state: States,
    ) -> Result<ServiceDescriptor, ChannelError> {
        service.last_known_state = state;
        let fqn = service.fully_qualified_name().to_string();

        let (previous, published) = {
            let mut services = self.services_table();
            let previous = services.get(&fqn).map(|s| s.last_known_state);
            if let Some(previous) = previous {
                if !previous.can_transition_to(state) {
                    debug!("[{}] Unusual transition {} -> {}", fqn, previous, state);
                }
            }

            if state == States::DeleteInactive {
                services.remove(&fqn);
            } else {
                services.insert(fqn.clone(), service.clone());
            }

            let published = self.publisher.publish(
                None,
                &ClusterMessage::ServiceStatusUpdate {
                    service: service.clone(),
                },
            );
            (previous, published)
        };

        debug!("[{}] {:?} -> {}", fqn, previous, state);
        self.announce_service(&service, previous);
        published.map(|()| service)
    }

    /// Set a node manager's state, creating the entry on first reference.
    pub fn update_node_state(
        &self,
        hostname: &str,
        state: States,
    ) -> Result<NodeDescriptor, ChannelError> {
        let node = self.node(hostname).unwrap_or_else(|| {
            NodeDescriptor::new(hostname).with_min_service_up_time(self.default_min_up_time_millis)
        });
        self.update_node(node, state)
    }

    /// Store `node` with `state` and broadcast it.
    pub fn update_node(
        &self,
        mut node: NodeDescriptor,
        state: States,
    ) -> Result<NodeDescriptor, ChannelError> {
        node.last_known_state = state;

        let (previous, published) = {
            let mut nodes = self.nodes_table();
            let previous = nodes.get(&node.hostname).map(|n| n.last_known_state);
            if state == States::DeleteInactive {
                nodes.remove(&node.hostname);
            } else {
                nodes.insert(node.hostname.clone(), node.clone());
            }

            let published = self.publisher.publish(
                None,
                &ClusterMessage::NodeStatusUpdate {
                    hostname: node.hostname.clone(),
                    node: node.clone(),
                },
            );
            (previous, published)
        };

        debug!("[node {}] {:?} -> {}", node.hostname, previous, state);
        self.announce_node(&node, previous);
        published.map(|()| node)
    }

    // ===== Remote updates =====

    /// Apply a service update received from a peer.
    pub fn apply_service_update(&self, service: ServiceDescriptor) -> UpdateOutcome {
        let state = service.last_known_state;
        let previous = {
            let mut services = self.services_table();
            let fqn = service.fully_qualified_name();
            let previous = services.get(fqn).map(|s| s.last_known_state);
            if let Some(current) = previous {
                if is_stale_update(current, state) {
                    debug!("[{}] Dropping stale {} (have {})", fqn, state, current);
                    return UpdateOutcome::Stale;
                }
            }

            if state == States::DeleteInactive {
                services.remove(fqn);
            } else {
                services.insert(fqn.to_string(), service.clone());
            }
            previous
        };

        self.announce_service(&service, previous);
        UpdateOutcome::Applied { previous }
    }

    /// Apply a node update received from a peer.
    pub fn apply_node_update(&self, hostname: &str, node: NodeDescriptor) -> UpdateOutcome {
        let state = node.last_known_state;
        let previous = {
            let mut nodes = self.nodes_table();
            let previous = nodes.get(hostname).map(|n| n.last_known_state);
            if let Some(current) = previous {
                if is_stale_update(current, state) {
                    debug!("[node {}] Dropping stale {} (have {})", hostname, state, current);
                    return UpdateOutcome::Stale;
                }
            }

            if state == States::DeleteInactive {
                nodes.remove(hostname);
            } else {
                nodes.insert(hostname.to_string(), node.clone());
            }
            previous
        };

        self.announce_node(&node, previous);
        UpdateOutcome::Applied { previous }
    }

    fn announce_service(&self, service: &ServiceDescriptor, previous: Option<States>) {
        let state = service.last_known_state;
        if previous == Some(state) {
            return;
        }
        if let Some(event) = ClusterEvent::for_service(service, state) {
            self.notifier.notify(event);
        }
    }

    fn announce_node(&self, node: &NodeDescriptor, previous: Option<States>) {
        let state = node.last_known_state;
        if previous == Some(state) {
            return;
        }
        if let Some(event) = ClusterEvent::for_node(node, state) {
            self.notifier.notify(event);
        }
    }
}

impl StateSource for ClusterState {
    fn snapshot(&self) -> eyre::Result<Vec<u8>> {
        let services = self.services_table().clone();
        let nodes = self.nodes_table().clone();
        serde_json::to_vec(&TableSnapshot { services, nodes })
            .wrap_err("Failed to serialize cluster tables")
    }

    fn restore(&self, snapshot: &[u8]) -> eyre::Result<()> {
        let TableSnapshot { services, nodes } =
            serde_json::from_slice(snapshot).wrap_err("Failed to parse cluster table snapshot")?;
        debug!(
            "Restoring {} services and {} nodes from snapshot",
            services.len(),
            nodes.len()
        );
        *self.services_table() = services;
        *self.nodes_table() = nodes;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::state::descriptors::{LauncherKind, ServiceDefinition};

    /// Publisher that records every outgoing message
    #[derive(Default)]
    pub(crate) struct RecordingPublisher {
        pub(crate) sent: Mutex<Vec<ClusterMessage>>,
    }

    impl RecordingPublisher {
        pub(crate) fn count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    impl Publisher for RecordingPublisher {
        fn publish(&self, _dest: Option<&str>, message: &ClusterMessage) -> Result<(), ChannelError> {
            self.sent.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    pub(crate) fn service(host: &str, name: &str, rank: u32) -> ServiceDescriptor {
        let def = ServiceDefinition {
            name: name.to_string(),
            cmd: "/bin/true".to_string(),
            args: vec![],
            launcher: LauncherKind::Generic,
            env: vec![],
            working_dir: None,
            description: None,
        };
        ServiceDescriptor::new(def, host, rank, "tcp://localhost:61616")
    }

    pub(crate) fn state() -> (Arc<RecordingPublisher>, ClusterState) {
        let publisher = Arc::new(RecordingPublisher::default());
        let state = ClusterState::new(publisher.clone());
        (publisher, state)
    }

    #[test]
    fn test_update_stores_and_broadcasts() {
        let (publisher, state) = state();
        let desc = state
            .update_service_state(service("mpf1", "Markup", 1), States::Configured)
            .unwrap();
        assert_eq!(desc.last_known_state, States::Configured);
        assert_eq!(
            state.service("mpf1:Markup:1").unwrap().last_known_state,
            States::Configured
        );
        assert_eq!(publisher.count(), 1);
    }

    #[test]
    fn test_stale_running_then_launching_is_dropped() {
        let (_, state) = state();
        state
            .update_service_state(service("mpf1", "Markup", 1), States::Running)
            .unwrap();

        let mut late = service("mpf1", "Markup", 1);
        late.last_known_state = States::Launching;
        assert_eq!(state.apply_service_update(late), UpdateOutcome::Stale);
        assert_eq!(
            state.service("mpf1:Markup:1").unwrap().last_known_state,
            States::Running
        );
    }

    #[test]
    fn test_launching_then_running_is_applied() {
        let (_, state) = state();
        state
            .update_service_state(service("mpf1", "Markup", 1), States::Launching)
            .unwrap();

        let mut running = service("mpf1", "Markup", 1);
        running.last_known_state = States::Running;
        let outcome = state.apply_service_update(running);
        assert!(outcome.changed_to(States::Running));
        assert_eq!(
            state.service("mpf1:Markup:1").unwrap().last_known_state,
            States::Running
        );
    }

    #[test]
    fn test_delete_inactive_removes_entry() {
        let (_, state) = state();
        let mut rx = state.subscribe();
        state
            .update_service_state(service("mpf1", "Markup", 1), States::Delete)
            .unwrap();

        let mut gone = service("mpf1", "Markup", 1);
        gone.last_known_state = States::DeleteInactive;
        assert!(state.apply_service_update(gone).is_applied());
        assert!(state.service("mpf1:Markup:1").is_none());
        assert!(matches!(
            rx.try_recv(),
            Ok(ClusterEvent::ServiceReadyToRemove { .. })
        ));
    }

    #[test]
    fn test_node_update_creates_entry() {
        let (_, state) = state();
        let mut rx = state.subscribe();
        state.update_node_state("mpf1", States::Running).unwrap();
        assert!(state.is_node_running("mpf1"));
        assert!(matches!(rx.try_recv(), Ok(ClusterEvent::NewManager { .. })));

        // same state again is not announced twice
        state.update_node_state("mpf1", States::Running).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_snapshot_restore_replaces_tables() {
        let (_, source) = state();
        source.update_node_state("mpf1", States::Running).unwrap();
        source
            .update_service_state(service("mpf1", "Markup", 1), States::Running)
            .unwrap();
        let snapshot = source.snapshot().unwrap();

        let (_, target) = state();
        target.update_node_state("stale", States::Running).unwrap();
        target.restore(&snapshot).unwrap();

        assert!(target.node("stale").is_none());
        assert!(target.is_node_running("mpf1"));
        assert_eq!(target.services().len(), 1);
        assert_eq!(target.snapshot().unwrap(), snapshot);
    }
}

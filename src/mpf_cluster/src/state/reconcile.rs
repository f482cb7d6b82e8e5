//! Membership view reconciliation

use super::{notifier::ClusterEvent, states::States, tables::ClusterState};
use crate::identity::{self, NodeType};
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Node managers whose status changed because of a view
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ViewChanges {
    /// Hosts newly marked `Running`
    pub joined: Vec<String>,
    /// Hosts that were `Running` and are no longer in the view
    pub lost: Vec<String>,
}

impl ClusterState {
    /// Bring the node table in line with a membership view.
    ///
    /// Node managers present in the view are marked `Running`; ones first
    /// seen here are tracked even though nobody configured them. Node
    /// managers that were `Running` and are missing go `Inactive`, and so do
    /// their `Running` services. Finishes with a `ViewUpdated` event.
    pub fn reconcile_view(&self, view: &[String], forced: bool) -> ViewChanges {
        let mut changes = ViewChanges::default();
        let mut present = HashSet::new();

        for address in view {
            let Some(member) = identity::decode(address) else {
                continue;
            };

            match member.node_type {
                NodeType::NodeManager => {
                    let existing = self.node(&member.host);
                    if existing.is_none() {
                        warn!(
                            "Node manager {} on unconfigured host {}, tracking it",
                            address, member.host
                        );
                    }
                    if existing.map(|n| n.last_known_state) != Some(States::Running) {
                        if let Err(e) = self.update_node_state(&member.host, States::Running) {
                            warn!("Failed to publish node {} as running: {}", member.host, e);
                        }
                        changes.joined.push(member.host.clone());
                    }
                    present.insert(member.host);
                }
                other => debug!("View member {} is a {}", address, other),
            }
        }

        let lost: Vec<String> = self
            .nodes()
            .into_iter()
            .filter(|n| n.is_running() && !present.contains(&n.hostname))
            .map(|n| n.hostname)
            .collect();

        for host in lost {
            info!("Node manager on {} left the view", host);
            if let Err(e) = self.update_node_state(&host, States::Inactive) {
                warn!("Failed to publish node {} as inactive: {}", host, e);
            }

            for service in self
                .services_on_host(&host)
                .into_iter()
                .filter(|s| s.last_known_state == States::Running)
            {
                let fqn = service.fully_qualified_name().to_string();
                if let Err(e) = self.update_service_state(service, States::Inactive) {
                    warn!("[{}] Failed to publish as inactive: {}", fqn, e);
                }
            }
            changes.lost.push(host);
        }

        self.notify(ClusterEvent::ViewUpdated { forced });
        changes
    }
}

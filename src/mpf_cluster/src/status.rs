//! Read-only status snapshot for status pages and logs

use crate::{
    channel::GroupChannel,
    state::{ClusterState, NodeDescriptor, ServiceDescriptor, States},
};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub local_address: Option<String>,
    pub members: Vec<String>,
    pub nodes: Vec<NodeDescriptor>,
    pub services: Vec<ServiceDescriptor>,
}

impl StatusSnapshot {
    pub fn capture(channel: &GroupChannel, state: &ClusterState) -> Self {
        Self {
            local_address: channel.local_address(),
            members: channel.view().unwrap_or_default(),
            nodes: state.nodes(),
            services: state.services(),
        }
    }

    /// Number of services per state
    pub fn service_counts(&self) -> BTreeMap<States, usize> {
        let mut counts = BTreeMap::new();
        for service in &self.services {
            *counts.entry(service.last_known_state).or_insert(0) += 1;
        }
        counts
    }

    /// One-line summary, e.g. `3 members, 2 nodes, Running=4 Inactive=1`
    pub fn summary(&self) -> String {
        let counts = self
            .service_counts()
            .into_iter()
            .map(|(state, n)| format!("{}={}", state, n))
            .collect::<Vec<_>>()
            .join(" ");
        format!(
            "{} members, {} nodes, {}",
            self.members.len(),
            self.nodes.len(),
            if counts.is_empty() { "no services".to_string() } else { counts }
        )
    }
}

//! Cluster change events
//!
//! Table transitions are published as tagged events on a single queue. One
//! subscriber drains it, so events for an entity are observed one at a time
//! and in the order the tables applied them.

use super::{
    descriptors::{NodeDescriptor, ServiceDescriptor},
    states::States,
};
use serde::Serialize;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Events emitted when a table entry changes state
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClusterEvent {
    /// A service reached `Running`
    NewService { service: ServiceDescriptor },
    /// A service went `Inactive` or `InactiveNoStart`
    ServiceDown { service: ServiceDescriptor },
    /// A service reached `DeleteInactive` and left the table
    ServiceReadyToRemove { service: ServiceDescriptor },
    /// A node manager reached `Running`
    NewManager { node: NodeDescriptor },
    /// A node manager went inactive or was deleted
    ManagerDown { node: NodeDescriptor },
    /// A membership view was reconciled
    ViewUpdated {
        /// True for the reconciliation run right after connecting
        forced: bool,
    },
}

impl ClusterEvent {
    /// Event for a service entering `state`, if that state is announced.
    pub fn for_service(service: &ServiceDescriptor, state: States) -> Option<Self> {
        match state {
            States::Running => Some(ClusterEvent::NewService {
                service: service.clone(),
            }),
            States::Inactive | States::InactiveNoStart => Some(ClusterEvent::ServiceDown {
                service: service.clone(),
            }),
            States::DeleteInactive => Some(ClusterEvent::ServiceReadyToRemove {
                service: service.clone(),
            }),
            _ => None,
        }
    }

    /// Event for a node manager entering `state`, if that state is announced.
    pub fn for_node(node: &NodeDescriptor, state: States) -> Option<Self> {
        match state {
            States::Running => Some(ClusterEvent::NewManager { node: node.clone() }),
            States::Inactive | States::InactiveNoStart | States::DeleteInactive => {
                Some(ClusterEvent::ManagerDown { node: node.clone() })
            }
            _ => None,
        }
    }
}

/// Single-subscriber event queue
#[derive(Default)]
pub struct Notifier {
    tx: Mutex<Option<mpsc::UnboundedSender<ClusterEvent>>>,
}

impl Notifier {
    /// Register the subscriber, replacing any previous one.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ClusterEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.tx.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
        rx
    }

    pub fn notify(&self, event: ClusterEvent) {
        let guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = guard.as_ref() {
            // a dropped subscriber just means nobody is listening any more
            tx.send(event).ok();
        }
    }
}

//! Replicated cluster state
//!
//! - [`states`]: the shared lifecycle enum and the out-of-order guard
//! - [`descriptors`]: node and service descriptors
//! - [`tables`]: the lock-guarded service/node tables with mutate-and-publish
//! - [`reconcile`]: membership view reconciliation
//! - [`notifier`]: tagged change events for a single subscriber

pub mod descriptors;
pub mod notifier;
pub mod reconcile;
pub mod states;
pub mod tables;

pub use descriptors::{
    EnvVar, LauncherKind, NodeDescriptor, ServiceDefinition, ServiceDescriptor,
};
pub use notifier::ClusterEvent;
pub use reconcile::ViewChanges;
pub use states::{is_stale_update, States};
pub use tables::{ClusterState, UpdateOutcome};

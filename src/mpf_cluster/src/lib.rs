//! Cluster process orchestration
//!
//! A master keeps the desired layout of services across hosts; one node
//! manager per host supervises the local service processes. Both sides share
//! replicated node and service tables over a group channel.
//!
//! - [`identity`]: member address encoding
//! - [`channel`]: group channel, wire messages, in-process substrate
//! - [`state`]: lifecycle states, replicated tables, view reconciliation
//! - [`launcher`]: per-service process supervision
//! - [`child`]: node manager
//! - [`master`]: master node and cluster configuration
//! - [`process`]: orphan cleanup and process groups
//! - [`status`]: read-only status snapshot

pub mod channel;
pub mod child;
pub mod identity;
pub mod launcher;
pub mod master;
pub mod process;
pub mod state;
pub mod status;
pub mod util;

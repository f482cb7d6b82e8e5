//! Member identity codec
//!
//! Every member joins the substrate under a logical address of the form
//! `NodeType:host:description`. The address is the only thing a peer sees in
//! a membership view, so decoding it is how roles and hosts are discovered.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

/// Role of a cluster member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    /// Per-host agent supervising local services
    NodeManager,
    /// The coordinator holding the desired configuration
    MasterNode,
    /// Passive observer (status consumers, streaming receivers)
    ReceiverNode,
}

impl NodeType {
    pub const ALL: [NodeType; 3] = [
        NodeType::NodeManager,
        NodeType::MasterNode,
        NodeType::ReceiverNode,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::NodeManager => "NodeManager",
            NodeType::MasterNode => "MasterNode",
            NodeType::ReceiverNode => "ReceiverNode",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|ty| ty.as_str() == name)
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded member address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub node_type: NodeType,
    pub host: String,
    pub description: String,
}

/// Build the logical address a member joins under.
pub fn encode(node_type: NodeType, host: &str, description: &str) -> String {
    format!("{}:{}:{}", node_type, host, description)
}

/// Decode a logical address.
///
/// The description is everything after the second colon and may itself
/// contain colons. Unknown node types and addresses without three fields are
/// logged and yield `None`.
pub fn decode(address: &str) -> Option<Identity> {
    let mut fields = address.splitn(3, ':');
    let (Some(type_name), Some(host), Some(description)) =
        (fields.next(), fields.next(), fields.next())
    else {
        warn!("Address '{}' does not match NodeType:host:description", address);
        return None;
    };

    if type_name.is_empty() || host.is_empty() {
        warn!("Address '{}' does not match NodeType:host:description", address);
        return None;
    }

    let Some(node_type) = NodeType::from_name(type_name) else {
        warn!("Address '{}' has unknown node type '{}'", address, type_name);
        return None;
    };

    Some(Identity {
        node_type,
        host: host.to_string(),
        description: description.to_string(),
    })
}

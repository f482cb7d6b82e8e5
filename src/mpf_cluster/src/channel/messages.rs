//! Wire messages exchanged between members

use crate::state::descriptors::{NodeDescriptor, ServiceDescriptor};
use serde::{Deserialize, Serialize};

/// Kind of streaming-job control message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamingJobKind {
    Launch,
    Stop,
    Exit,
}

/// Streaming-job control or exit message. The payload is opaque here and is
/// forwarded to the streaming-job subsystem untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamingJobMessage {
    pub kind: StreamingJobKind,
    pub job_id: u64,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClusterMessage {
    ServiceStatusUpdate {
        service: ServiceDescriptor,
    },
    NodeStatusUpdate {
        hostname: String,
        node: NodeDescriptor,
    },
    StreamingJob(StreamingJobMessage),
}

impl ClusterMessage {
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ClusterMessage::ServiceStatusUpdate { .. } => "ServiceStatusUpdate",
            ClusterMessage::NodeStatusUpdate { .. } => "NodeStatusUpdate",
            ClusterMessage::StreamingJob(_) => "StreamingJob",
        }
    }
}

//! Peer RPC boundary of the consensus node

use super::message::{AppendRequest, AppendResponse, Heartbeat, VoteRequest, VoteResponse};
use crate::common::Result;
use async_trait::async_trait;

/// Outbound RPCs from one node to its peers
///
/// Implementations carry the sender's identity; `to` names the receiver.
#[async_trait]
pub trait RaftTransport: Send + Sync {
    async fn request_vote(&self, to: &str, req: VoteRequest) -> Result<VoteResponse>;

    async fn append_entries(&self, to: &str, req: AppendRequest) -> Result<AppendResponse>;

    /// Fire-and-forget liveness ping
    async fn heartbeat(&self, to: &str, heartbeat: Heartbeat);
}

//! The replication network interface.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::raft::{AppendEntriesReply, AppendEntriesRequest};
use crate::replication::ResourceUnits;
use crate::{AppData, NodeId};

/// Per-call options for an outbound RPC.
///
/// The resource units handle rides along with the call so that outbound memory
/// accounting is held for as long as the request is in flight, independent of the
/// replication round that issued it. Only memory-accounting units travel here; the
/// round's dispatch units are returned at the dispatch barrier and never attach to
/// an RPC.
#[derive(Clone)]
pub struct RpcOptions {
    /// How long the transport may spend on this call.
    pub timeout: Duration,
    /// Memory-accounting units held until the call resolves.
    pub resource_units: Option<Arc<ResourceUnits>>,
}

impl RpcOptions {
    /// Create options with the given timeout and no attached units.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            resource_units: None,
        }
    }

    /// Attach a resource units handle to the call.
    pub fn with_resource_units(mut self, units: Option<Arc<ResourceUnits>>) -> Self {
        self.resource_units = units;
        self
    }
}

/// A trait defining the interface for the replication transport between cluster members.
///
/// Implementations own connection management, encoding and retry-free delivery; the
/// pipeline treats a transport error, a timeout and a malformed reply identically, as a
/// failed dispatch for that peer.
#[async_trait]
pub trait RaftNetwork<D>: Send + Sync + 'static
where
    D: AppData,
{
    /// Send an AppendEntries RPC to the target node (§5).
    async fn append_entries(
        &self,
        target: NodeId,
        rpc: AppendEntriesRequest<D>,
        opts: RpcOptions,
    ) -> Result<AppendEntriesReply>;
}

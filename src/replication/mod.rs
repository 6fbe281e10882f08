//! The single-round replication pipeline.
//!
//! One [`ReplicationRound`] drives one batch of log entries from "accepted by the
//! leader" to "committed by a majority" (or a definitive failure). The caller awaits
//! two things from it: [`ReplicationRound::apply`], which resolves once the batch is
//! appended locally and every per-peer request has been scheduled, and
//! [`ReplicationRound::wait_for_majority`], which resolves on commit, truncation or
//! shutdown. `wait_for_shutdown` must be awaited before the round is dropped.

mod round;

use std::sync::Arc;

use tokio::sync::OwnedSemaphorePermit;

pub use round::ReplicationRound;

/// Memory-accounting units riding outbound RPCs.
///
/// A handle to these is attached to every AppendEntries call a round issues, so the
/// accounting covers the full transmission: the permits return to their pool only
/// when the last in-flight RPC resolves and drops its handle.
#[derive(Debug)]
pub struct ResourceUnits {
    permits: Vec<OwnedSemaphorePermit>,
}

impl ResourceUnits {
    /// Bundle the given permits for attachment to a round's RPCs.
    pub fn new(permits: Vec<OwnedSemaphorePermit>) -> Self {
        Self { permits }
    }

    /// The number of permits carried.
    pub fn count(&self) -> usize {
        self.permits.len()
    }
}

/// Back-pressure tokens carried through one replication round.
///
/// The caller draws these from its replication lock and hands them to
/// [`ReplicationRound::apply`]. The round returns them at the dispatch barrier, once
/// every per-peer request has been *issued*; holding them until the replies land
/// would serialise rounds on the slowest follower.
///
/// Memory accounting for the outbound payload follows a different lifetime: attach a
/// [`ResourceUnits`] handle via [`ReplicateUnits::with_resource_units`] and the round
/// shares it with every RPC it issues, keeping those permits alive until the last
/// reply lands. The dispatch units themselves never travel with an RPC.
#[derive(Debug)]
pub struct ReplicateUnits {
    permits: Vec<OwnedSemaphorePermit>,
    resource_units: Option<Arc<ResourceUnits>>,
}

impl ReplicateUnits {
    /// Bundle the given permits for one round; they are released at the dispatch barrier.
    pub fn new(permits: Vec<OwnedSemaphorePermit>) -> Self {
        Self {
            permits,
            resource_units: None,
        }
    }

    /// A bundle carrying no permits.
    pub fn empty() -> Self {
        Self {
            permits: Vec::new(),
            resource_units: None,
        }
    }

    /// Attach memory-accounting units that ride the round's RPCs.
    pub fn with_resource_units(mut self, resource_units: Arc<ResourceUnits>) -> Self {
        self.resource_units = Some(resource_units);
        self
    }

    /// The number of dispatch permits carried.
    pub fn count(&self) -> usize {
        self.permits.len()
    }

    pub(crate) fn resource_units(&self) -> Option<Arc<ResourceUnits>> {
        self.resource_units.clone()
    }
}

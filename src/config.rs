//! Replication runtime configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default timeout for a single replicated AppendEntries RPC, in milliseconds.
pub const DEFAULT_REPLICATE_APPEND_TIMEOUT: u64 = 3000;
/// Default heartbeat interval.
pub const DEFAULT_HEARTBEAT_INTERVAL: u64 = 50;
/// Default number of in-flight AppendEntries requests allowed per follower.
pub const DEFAULT_MAX_INFLIGHT_APPENDS_PER_FOLLOWER: usize = 16;
/// Default size of the outbound replication memory pool (in bytes).
pub const DEFAULT_REPLICATE_REQUEST_MEMORY_LIMIT: usize = 64 * 1024 * 1024;

/// The runtime configuration for the leader-side replication pipeline.
///
/// The default values should generally work well for clusters running with nodes in
/// multiple datacenter availability zones with low latency between zones. These values
/// should typically be made configurable from the perspective of the application which
/// is being built on top of this crate.
///
/// The single most load-bearing value here is `replicate_append_timeout`: it bounds every
/// outbound AppendEntries RPC, and it is also the liveness window used to decide whether
/// a follower is healthy enough to receive a direct append at all. A follower which has
/// not answered anything within this window is served heartbeats only, until recovery
/// catches it up.
#[derive(Debug, Serialize, Deserialize)]
pub struct Config {
    /// The application specific name of this cluster.
    ///
    /// This does not influence the replication protocol in any way, but is useful for
    /// observability.
    pub cluster_name: String,
    /// The timeout for a single replicated AppendEntries RPC, in milliseconds.
    ///
    /// This value doubles as the follower liveness window: a follower whose last reply
    /// is older than this is skipped for direct appends until it answers again.
    pub replicate_append_timeout: u64,
    /// The interval in milliseconds at which the leader sends heartbeats to followers.
    ///
    /// Heartbeat scheduling itself lives outside this crate; the value is validated here
    /// because a heartbeat interval that exceeds the replicate timeout would starve the
    /// liveness accounting the skip policy depends on.
    pub heartbeat_interval: u64,
    /// The maximum number of in-flight AppendEntries requests per follower.
    ///
    /// Each follower has an admission semaphore of this capacity; a replication round
    /// waits for a slot before issuing the RPC, so a slow follower back-pressures the
    /// pipeline instead of accumulating an unbounded request queue.
    pub max_inflight_appends_per_follower: usize,
    /// The size in bytes of the memory pool from which replication requests draw their
    /// back-pressure units.
    ///
    /// The pipeline only carries the units; the accounting granularity is up to the caller.
    pub replicate_request_memory_limit: usize,
}

impl Config {
    /// Start the builder process for a new `Config` instance. Call `validate` when done.
    pub fn build(cluster_name: String) -> ConfigBuilder {
        ConfigBuilder {
            cluster_name,
            replicate_append_timeout: None,
            heartbeat_interval: None,
            max_inflight_appends_per_follower: None,
            replicate_request_memory_limit: None,
        }
    }

    /// The replicate append timeout as a `Duration`.
    pub fn replicate_append_timeout(&self) -> Duration {
        Duration::from_millis(self.replicate_append_timeout)
    }
}

/// A configuration builder to ensure that runtime config is valid.
#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigBuilder {
    /// The application specific name of this cluster.
    pub cluster_name: String,
    /// The timeout for a single replicated AppendEntries RPC, in milliseconds.
    pub replicate_append_timeout: Option<u64>,
    /// The heartbeat interval, in milliseconds.
    pub heartbeat_interval: Option<u64>,
    /// The maximum number of in-flight AppendEntries requests per follower.
    pub max_inflight_appends_per_follower: Option<usize>,
    /// The size in bytes of the outbound replication memory pool.
    pub replicate_request_memory_limit: Option<usize>,
}

impl ConfigBuilder {
    /// Set the desired value for `replicate_append_timeout`.
    pub fn replicate_append_timeout(mut self, val: u64) -> Self {
        self.replicate_append_timeout = Some(val);
        self
    }

    /// Set the desired value for `heartbeat_interval`.
    pub fn heartbeat_interval(mut self, val: u64) -> Self {
        self.heartbeat_interval = Some(val);
        self
    }

    /// Set the desired value for `max_inflight_appends_per_follower`.
    pub fn max_inflight_appends_per_follower(mut self, val: usize) -> Self {
        self.max_inflight_appends_per_follower = Some(val);
        self
    }

    /// Set the desired value for `replicate_request_memory_limit`.
    pub fn replicate_request_memory_limit(mut self, val: usize) -> Self {
        self.replicate_request_memory_limit = Some(val);
        self
    }

    /// Validate the state of this builder and produce a new `Config` instance if valid.
    pub fn validate(self) -> Result<Config, ConfigError> {
        let replicate_append_timeout = self.replicate_append_timeout.unwrap_or(DEFAULT_REPLICATE_APPEND_TIMEOUT);
        if replicate_append_timeout == 0 {
            return Err(ConfigError::ReplicateAppendTimeoutTooSmall);
        }
        let heartbeat_interval = self.heartbeat_interval.unwrap_or(DEFAULT_HEARTBEAT_INTERVAL);
        if heartbeat_interval >= replicate_append_timeout {
            return Err(ConfigError::HeartbeatIntervalNotLessThanReplicateTimeout);
        }
        let max_inflight_appends_per_follower =
            self.max_inflight_appends_per_follower.unwrap_or(DEFAULT_MAX_INFLIGHT_APPENDS_PER_FOLLOWER);
        if max_inflight_appends_per_follower == 0 {
            return Err(ConfigError::MaxInflightAppendsTooSmall);
        }
        let replicate_request_memory_limit =
            self.replicate_request_memory_limit.unwrap_or(DEFAULT_REPLICATE_REQUEST_MEMORY_LIMIT);
        Ok(Config {
            cluster_name: self.cluster_name,
            replicate_append_timeout,
            heartbeat_interval,
            max_inflight_appends_per_follower,
            replicate_request_memory_limit,
        })
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////
// Unit Tests ////////////////////////////////////////////////////////////////////////////////////

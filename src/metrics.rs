//! Replication metrics for observability.
//!
//! Applications may use this data in whatever way is needed. The obvious use case is to
//! expose the counters to a metrics collection system like Prometheus; the crate itself
//! stays backend-free and only counts.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// Counters describing the replication pipeline's activity on one group.
///
/// All counters are monotonic and relaxed: they feed dashboards and tests, not
/// control flow.
#[derive(Debug, Default)]
pub struct Probe {
    rounds_started: AtomicU64,
    rounds_done: AtomicU64,
    leader_append_failures: AtomicU64,
    replicate_request_errors: AtomicU64,
}

impl Probe {
    /// A replication round began dispatching.
    pub(crate) fn round_started(&self) {
        self.rounds_started.fetch_add(1, Ordering::Relaxed);
    }

    /// A replication round resolved, successfully or not.
    pub(crate) fn round_done(&self) {
        self.rounds_done.fetch_add(1, Ordering::Relaxed);
    }

    /// The leader's own append failed.
    pub(crate) fn leader_append_error(&self) {
        self.leader_append_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// A per-peer replication request failed to produce a usable reply.
    pub(crate) fn replicate_request_error(&self) {
        self.replicate_request_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of rounds that began dispatching.
    pub fn rounds_started_count(&self) -> u64 {
        self.rounds_started.load(Ordering::Relaxed)
    }

    /// Number of rounds that resolved.
    pub fn rounds_done_count(&self) -> u64 {
        self.rounds_done.load(Ordering::Relaxed)
    }

    /// Number of failed leader appends.
    pub fn leader_append_failure_count(&self) -> u64 {
        self.leader_append_failures.load(Ordering::Relaxed)
    }

    /// Number of failed per-peer replication requests.
    pub fn replicate_request_error_count(&self) -> u64 {
        self.replicate_request_errors.load(Ordering::Relaxed)
    }
}

//! The leader log storage interface and data types.

use anyhow::Result;
use async_trait::async_trait;

use crate::raft::EntryBatch;
use crate::AppData;

/// The outcome of appending one batch to the leader's log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogAppendResult {
    /// The offset of the first entry written by the append.
    pub base_offset: u64,
    /// The offset of the last entry written by the append.
    pub last_offset: u64,
    /// The term of the last entry written by the append.
    pub last_term: u64,
}

/// A trait defining the interface to the leader's local log.
///
/// Only the operations the replication pipeline needs are present: appending a batch,
/// flushing, and reading the term of a stored entry. Log truncation, compaction and
/// snapshotting belong to the surrounding storage engine.
#[async_trait]
pub trait RaftLog<D>: Send + Sync + 'static
where
    D: AppData,
{
    /// Append a batch of entries to the log.
    ///
    /// The entries carry their own log ids; the log must reject a batch that does not
    /// attach to its current end. Appended entries are readable immediately but not
    /// durable until `flush` returns.
    async fn append(&self, batch: EntryBatch<D>) -> Result<LogAppendResult>;

    /// Flush all appended entries to durable storage.
    ///
    /// Returns the last flushed offset.
    async fn flush(&self) -> Result<u64>;

    /// The term of the entry at `offset`, or `None` if no such entry exists
    /// (never written, or truncated away by a newer leader).
    fn term_of(&self, offset: u64) -> Option<u64>;
}

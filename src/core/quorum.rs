//! Quorum arithmetic over replication offsets.

/// The greatest offset that at least `majority` of the given offsets have reached.
///
/// Returns `None` when fewer than `majority` offsets are present at all.
pub(crate) fn quorum_offset(offsets: &[u64], majority: usize) -> Option<u64> {
    if majority == 0 || offsets.len() < majority {
        return None;
    }
    let mut sorted = offsets.to_vec();
    sorted.sort_unstable_by(|a, b| b.cmp(a));
    Some(sorted[majority - 1])
}

//! Replicated log entries.

use bytes::Bytes;

/// A single entry in a channel's replicated log.
///
/// Indices are strictly monotonically increasing per channel and assigned by
/// the leader at propose time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    pub index: u64,
    pub term: u32,
    pub data: Bytes,
}

impl LogEntry {
    pub fn new(index: u64, term: u32, data: Bytes) -> Self {
        Self { index, term, data }
    }
}

/// True when `logs` starts at `first` and indices are gap-free.
pub(crate) fn is_contiguous(logs: &[LogEntry], first: u64) -> bool {
    logs.iter()
        .enumerate()
        .all(|(i, log)| log.index == first + i as u64)
}

pub(crate) fn batch_bytes(logs: &[LogEntry]) -> usize {
    logs.iter().map(|log| log.data.len()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: u64) -> LogEntry {
        LogEntry::new(index, 1, Bytes::from_static(b"x"))
    }

    #[test]
    fn contiguity_detects_gaps() {
        assert!(is_contiguous(&[entry(3), entry(4), entry(5)], 3));
        assert!(!is_contiguous(&[entry(3), entry(5)], 3));
        assert!(!is_contiguous(&[entry(4)], 3));
        assert!(is_contiguous(&[], 7));
    }
}

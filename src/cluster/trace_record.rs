//! Per-index span bookkeeping for distributed tracing.
//!
//! Purely observational: the record maps log-index ranges to span handles so
//! that append, commit and sync events can be attributed to the propose that
//! caused them, including across the wire.

use std::sync::Mutex;

use super::key::{ChannelKey, NodeId};

/// Opaque span identity as carried on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpanHandle {
    pub trace_id: [u8; 16],
    pub span_id: [u8; 8],
}

impl SpanHandle {
    pub const NONE: SpanHandle = SpanHandle {
        trace_id: [0; 16],
        span_id: [0; 8],
    };

    pub fn is_none(&self) -> bool {
        *self == SpanHandle::NONE
    }
}

/// Observer for the tracing lifecycle of a channel's log ranges.
///
/// The default implementation records nothing, keeping the core testable
/// without a tracer.
pub trait TraceObserver: Send + Sync {
    fn start_span(
        &self,
        _name: &'static str,
        _key: &ChannelKey,
        _first_index: u64,
        _last_index: u64,
    ) -> SpanHandle {
        SpanHandle::NONE
    }

    fn end_span(&self, _handle: SpanHandle) {}
}

#[derive(Default)]
pub struct NoopTraceObserver;

impl TraceObserver for NoopTraceObserver {}

#[derive(Clone, Copy)]
struct SpanRange {
    first: u64,
    last: u64,
    handle: SpanHandle,
}

struct SyncSpan {
    from: NodeId,
    start_index: u64,
    handle: SpanHandle,
}

#[derive(Default)]
struct Inner {
    propose: Vec<SpanRange>,
    commit: Vec<SpanRange>,
    sync: Vec<SyncSpan>,
}

/// Span maps for the propose, commit and sync phases of one channel.
#[derive(Default)]
pub(crate) struct TraceRecord {
    inner: Mutex<Inner>,
}

fn overlaps(range: &SpanRange, first: u64, last: u64) -> bool {
    range.first <= last && range.last >= first
}

impl TraceRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_propose_range(&self, first: u64, last: u64, handle: SpanHandle) {
        if handle.is_none() {
            return;
        }
        let mut inner = self.inner.lock().expect("trace record lock poisoned");
        inner.propose.push(SpanRange {
            first,
            last,
            handle,
        });
    }

    /// Handles of propose spans overlapping `[first, last]`.
    pub fn propose_in_range(&self, first: u64, last: u64) -> Vec<SpanHandle> {
        let inner = self.inner.lock().expect("trace record lock poisoned");
        inner
            .propose
            .iter()
            .filter(|range| overlaps(range, first, last))
            .map(|range| range.handle)
            .collect()
    }

    pub fn remove_propose_range(&self, first: u64, last: u64) {
        let mut inner = self.inner.lock().expect("trace record lock poisoned");
        inner.propose.retain(|range| !overlaps(range, first, last));
    }

    pub fn add_commit_range(&self, first: u64, last: u64, handle: SpanHandle) {
        if handle.is_none() {
            return;
        }
        let mut inner = self.inner.lock().expect("trace record lock poisoned");
        inner.commit.push(SpanRange {
            first,
            last,
            handle,
        });
    }

    /// Removes and returns commit spans overlapping `[first, last]` so the
    /// caller can end each one at the moment the range applies.
    pub fn take_commit_in_range(&self, first: u64, last: u64) -> Vec<SpanHandle> {
        let mut inner = self.inner.lock().expect("trace record lock poisoned");
        let mut taken = Vec::new();
        inner.commit.retain(|range| {
            if overlaps(range, first, last) {
                taken.push(range.handle);
                false
            } else {
                true
            }
        });
        taken
    }

    pub fn add_sync_span(&self, from: NodeId, start_index: u64, handle: SpanHandle) {
        if handle.is_none() {
            return;
        }
        let mut inner = self.inner.lock().expect("trace record lock poisoned");
        inner.sync.push(SyncSpan {
            from,
            start_index,
            handle,
        });
    }

    /// Removes and returns sync spans from `from` whose start index is at or
    /// before `index` (the follower has caught up past them).
    pub fn take_sync_spans(&self, from: NodeId, index: u64) -> Vec<SpanHandle> {
        let mut inner = self.inner.lock().expect("trace record lock poisoned");
        let mut taken = Vec::new();
        inner.sync.retain(|span| {
            if span.from == from && span.start_index <= index {
                taken.push(span.handle);
                false
            } else {
                true
            }
        });
        taken
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(seed: u8) -> SpanHandle {
        SpanHandle {
            trace_id: [seed; 16],
            span_id: [seed; 8],
        }
    }

    #[test]
    fn propose_ranges_match_by_overlap() {
        let record = TraceRecord::new();
        record.add_propose_range(3, 5, handle(1));
        record.add_propose_range(8, 9, handle(2));

        assert_eq!(record.propose_in_range(5, 8).len(), 2);
        assert_eq!(record.propose_in_range(6, 7).len(), 0);

        record.remove_propose_range(3, 5);
        assert_eq!(record.propose_in_range(1, 100), vec![handle(2)]);
    }

    #[test]
    fn commit_spans_are_taken_once() {
        let record = TraceRecord::new();
        record.add_commit_range(1, 4, handle(3));
        assert_eq!(record.take_commit_in_range(2, 2), vec![handle(3)]);
        assert!(record.take_commit_in_range(2, 2).is_empty());
    }

    #[test]
    fn none_handles_are_not_recorded() {
        let record = TraceRecord::new();
        record.add_propose_range(1, 1, SpanHandle::NONE);
        assert!(record.propose_in_range(1, 1).is_empty());
    }

    #[test]
    fn sync_spans_key_on_origin_and_index() {
        let record = TraceRecord::new();
        record.add_sync_span(2, 10, handle(4));
        record.add_sync_span(3, 10, handle(5));
        assert_eq!(record.take_sync_spans(2, 12), vec![handle(4)]);
        assert_eq!(record.take_sync_spans(3, 9), Vec::<SpanHandle>::new());
    }
}

//! FIFO reorder buffer pairing asynchronous storage completions with
//! in-order replica resumption.

use std::collections::VecDeque;

use super::message::ReplicaMessage;

struct StoreEntry {
    message: ReplicaMessage,
    index: u64,
    stored: bool,
}

/// Queue of pending local-storage responses.
///
/// Entries are enqueued when the storage request is issued and flipped to
/// `stored` when it completes; only the head may be popped, and only once
/// stored. Storage writes may complete out of order, the replica still sees
/// responses strictly in issue order.
#[derive(Default)]
pub struct LocalStoreQueue {
    entries: VecDeque<StoreEntry>,
}

impl LocalStoreQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a pending response keyed by `index`.
    pub fn add(&mut self, message: ReplicaMessage, index: u64) {
        self.entries.push_back(StoreEntry {
            message,
            index,
            stored: false,
        });
    }

    /// Marks the first not-yet-stored entry matching `index` as stored.
    /// Returns whether one was found; the caller treats `false` as a logic
    /// error.
    pub fn set_stored(&mut self, index: u64) -> bool {
        for entry in self.entries.iter_mut() {
            if entry.index == index && !entry.stored {
                entry.stored = true;
                return true;
            }
        }
        false
    }

    pub fn first_is_stored(&self) -> bool {
        self.entries.front().map(|entry| entry.stored).unwrap_or(false)
    }

    /// Pops the head, which must be stored.
    pub fn remove_first(&mut self) -> Option<ReplicaMessage> {
        if !self.first_is_stored() {
            return None;
        }
        self.entries.pop_front().map(|entry| entry.message)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resp(index: u64) -> ReplicaMessage {
        ReplicaMessage::StoreAppendResp { index }
    }

    #[test]
    fn out_of_order_completion_drains_in_order() {
        let mut queue = LocalStoreQueue::new();
        queue.add(resp(1), 1);
        queue.add(resp(2), 2);

        // Second write finishes first; the head stays blocked.
        assert!(queue.set_stored(2));
        assert!(!queue.first_is_stored());
        assert!(queue.remove_first().is_none());

        assert!(queue.set_stored(1));
        assert_eq!(queue.remove_first(), Some(resp(1)));
        assert_eq!(queue.remove_first(), Some(resp(2)));
        assert!(queue.is_empty());
    }

    #[test]
    fn set_stored_on_unknown_index_reports_miss() {
        let mut queue = LocalStoreQueue::new();
        queue.add(resp(4), 4);
        assert!(!queue.set_stored(9));
    }

    #[test]
    fn duplicate_indices_resolve_front_to_back() {
        let mut queue = LocalStoreQueue::new();
        queue.add(resp(3), 3);
        queue.add(resp(3), 3);
        assert!(queue.set_stored(3));
        assert!(queue.first_is_stored());
        assert!(queue.set_stored(3));
        assert_eq!(queue.len(), 2);
        queue.remove_first();
        assert!(queue.first_is_stored());
    }
}

//! Index-keyed signal table unblocking proposers once their index commits.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crossbeam::channel::{Receiver, Sender, bounded};

use super::error::ClusterError;

/// What a waiter receives, exactly once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitSignal {
    /// The committed index reached the waited index.
    Committed,
    /// The channel was destroyed before the index committed.
    Stopped,
}

#[derive(Default)]
struct Inner {
    waiters: BTreeMap<u64, Vec<Sender<CommitSignal>>>,
    destroyed: bool,
}

/// Registers waiters by target log index and signals them when the channel's
/// committed index advances past that index.
///
/// Signalling happens outside any channel lock and never blocks: the signal
/// channels are buffered and a receiver dropped by a timed-out proposer just
/// swallows the send.
#[derive(Default)]
pub struct CommitWait {
    inner: Mutex<Inner>,
}

impl CommitWait {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a waiter for `index`. Multiple waiters per index are fine.
    pub fn add_wait_index(&self, index: u64) -> Result<Receiver<CommitSignal>, ClusterError> {
        let mut inner = self.inner.lock().expect("commit wait lock poisoned");
        if inner.destroyed {
            return Err(ClusterError::Stopped);
        }
        let (tx, rx) = bounded(1);
        inner.waiters.entry(index).or_default().push(tx);
        Ok(rx)
    }

    /// Fires and removes every waiter whose index is `<= committed_index`.
    pub fn commit_index(&self, committed_index: u64) {
        let fired = {
            let mut inner = self.inner.lock().expect("commit wait lock poisoned");
            let keep = inner.waiters.split_off(&(committed_index + 1));
            std::mem::replace(&mut inner.waiters, keep)
        };
        for (_, senders) in fired {
            for tx in senders {
                let _ = tx.try_send(CommitSignal::Committed);
            }
        }
    }

    /// Fires every remaining waiter with `Stopped` and rejects future
    /// registrations. Idempotent.
    pub fn destroy(&self) {
        let fired = {
            let mut inner = self.inner.lock().expect("commit wait lock poisoned");
            inner.destroyed = true;
            std::mem::take(&mut inner.waiters)
        };
        for (_, senders) in fired {
            for tx in senders {
                let _ = tx.try_send(CommitSignal::Stopped);
            }
        }
    }

    #[cfg(test)]
    fn waiter_count(&self) -> usize {
        let inner = self.inner.lock().expect("commit wait lock poisoned");
        inner.waiters.values().map(Vec::len).sum()
    }
}

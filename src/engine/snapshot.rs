//! Snapshots
//!
//! A snapshot pins a sequence number. Compactions keep every record a live
//! snapshot can still see, so the engine tracks the oldest one.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};

use crate::key::SequenceNumber;

struct SnapshotInner {
    sequence: SequenceNumber,
}

/// Read view fixed at a sequence number
///
/// Clones share one registration. The snapshot stays live until
/// [`Engine::release_snapshot`](super::Engine::release_snapshot) is called
/// or the last clone is dropped.
#[derive(Clone)]
pub struct Snapshot {
    inner: Arc<SnapshotInner>,
}

impl Snapshot {
    pub fn sequence(&self) -> SequenceNumber {
        self.inner.sequence
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot").field("sequence", &self.inner.sequence).finish()
    }
}

/// Live snapshots in creation order, so sequences never decrease front to back
#[derive(Default)]
pub(crate) struct SnapshotList {
    entries: VecDeque<Weak<SnapshotInner>>,
}

impl SnapshotList {
    pub fn create(&mut self, sequence: SequenceNumber) -> Snapshot {
        let inner = Arc::new(SnapshotInner { sequence });
        self.entries.push_back(Arc::downgrade(&inner));
        Snapshot { inner }
    }

    pub fn release(&mut self, snapshot: &Snapshot) {
        let target = Arc::downgrade(&snapshot.inner);
        self.entries.retain(|entry| !Weak::ptr_eq(entry, &target) && entry.strong_count() > 0);
    }

    /// Sequence of the oldest live snapshot
    pub fn oldest(&mut self) -> Option<SequenceNumber> {
        while let Some(front) = self.entries.front() {
            match front.upgrade() {
                Some(inner) => return Some(inner.sequence),
                None => {
                    self.entries.pop_front();
                }
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|entry| entry.strong_count() > 0).count()
    }
}

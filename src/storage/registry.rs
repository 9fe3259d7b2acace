use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use tracing::{debug, trace};

use crate::errors::{Error, Result};
use crate::types::{BucketId, RecorderId, StorageId};

/// Shared handle to one backing allocation.
pub type BufferRef = Rc<RefCell<Vec<f32>>>;

struct Bucket {
    root: StorageId,
    members: HashSet<StorageId>,
    /// Owning reference, dropped exactly once when the member set empties.
    buffer: BufferRef,
}

struct Recorder {
    id: RecorderId,
    captured: HashSet<StorageId>,
}

/// Snapshot of every storage registered while a recorder was active.
pub struct Recording {
    storages: Vec<StorageId>,
}

impl Recording {
    pub fn len(&self) -> usize {
        self.storages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storages.is_empty()
    }
}

/// Bookkeeping for every live storage: which bucket (allocation) it belongs
/// to, and which recording scopes captured it. The registry decides when a
/// bucket's allocation is logically released; the `Rc` inside keeps stray
/// handles memory-safe regardless.
#[derive(Default)]
pub struct Registry {
    entries: HashMap<StorageId, BucketId>,
    buckets: HashMap<BucketId, Bucket>,
    recorders: Vec<Recorder>,
    next_storage: u64,
    next_bucket: u64,
    next_recorder: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fresh allocation as the root of a new bucket.
    pub fn register_root(&mut self, buffer: BufferRef) -> StorageId {
        let sid = StorageId(self.next_storage);
        self.next_storage += 1;
        let bid = BucketId(self.next_bucket);
        self.next_bucket += 1;
        self.buckets.insert(
            bid,
            Bucket {
                root: sid,
                members: HashSet::from([sid]),
                buffer,
            },
        );
        self.entries.insert(sid, bid);
        self.capture(sid);
        trace!(?sid, ?bid, "registered root storage");
        sid
    }

    /// Registers a view sharing its parent's allocation.
    pub fn register_child(&mut self, parent: StorageId) -> Result<StorageId> {
        let bid = *self
            .entries
            .get(&parent)
            .ok_or(Error::ParentNotRegistered)?;
        let sid = StorageId(self.next_storage);
        self.next_storage += 1;
        let bucket = self
            .buckets
            .get_mut(&bid)
            .ok_or(Error::ParentNotRegistered)?;
        bucket.members.insert(sid);
        self.entries.insert(sid, bid);
        self.capture(sid);
        trace!(?sid, ?bid, ?parent, "registered view storage");
        Ok(sid)
    }

    /// Removes a storage from its bucket; an emptied bucket releases its
    /// allocation.
    pub fn deregister(&mut self, id: StorageId) -> Result<()> {
        let bid = self.entries.remove(&id).ok_or(Error::HandleUninitialized)?;
        for rec in self.recorders.iter_mut() {
            rec.captured.remove(&id);
        }
        let bucket = self.buckets.get_mut(&bid).ok_or(Error::HandleUninitialized)?;
        bucket.members.remove(&id);
        if bucket.members.is_empty() {
            let bucket = self
                .buckets
                .remove(&bid)
                .ok_or(Error::HandleUninitialized)?;
            debug!(?bid, root = ?bucket.root, "bucket emptied, releasing allocation");
            drop(bucket.buffer);
        }
        Ok(())
    }

    pub fn is_registered(&self, id: StorageId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn live_count(&self) -> usize {
        self.entries.len()
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Opens a recording scope; every registration until the matching stop
    /// is captured. Scopes nest and must be stopped innermost-first.
    pub fn start_recording(&mut self) -> RecorderId {
        let id = RecorderId(self.next_recorder);
        self.next_recorder += 1;
        self.recorders.push(Recorder {
            id,
            captured: HashSet::new(),
        });
        trace!(?id, "recording started");
        id
    }

    pub fn stop_recording(&mut self, id: RecorderId) -> Result<Recording> {
        match self.recorders.last() {
            Some(top) if top.id == id => {}
            _ => return Err(Error::RecordNotFound),
        }
        let rec = self.recorders.pop().ok_or(Error::RecordNotFound)?;
        let mut storages: Vec<StorageId> = rec.captured.into_iter().collect();
        storages.sort_by_key(|s| s.0);
        trace!(?id, captured = storages.len(), "recording stopped");
        Ok(Recording { storages })
    }

    /// Deregisters everything a recording captured. Storages already gone
    /// by other means are skipped.
    pub fn free_recorded(&mut self, recording: Recording) -> Result<()> {
        for sid in recording.storages {
            if self.entries.contains_key(&sid) {
                self.deregister(sid)?;
            }
        }
        Ok(())
    }

    /// Final accounting check; fails while any storage is still tracked.
    pub fn teardown(&mut self) -> Result<()> {
        if !self.entries.is_empty() {
            return Err(Error::RegistryNotEmpty {
                live: self.entries.len(),
            });
        }
        self.buckets.clear();
        self.recorders.clear();
        Ok(())
    }

    /// Drops all bookkeeping unconditionally; used by process teardown.
    pub fn clear(&mut self) {
        let live = self.entries.len();
        if live > 0 {
            debug!(live, "registry cleared with live storages");
        }
        self.entries.clear();
        self.buckets.clear();
        self.recorders.clear();
    }

    fn capture(&mut self, sid: StorageId) {
        for rec in self.recorders.iter_mut() {
            rec.captured.insert(sid);
        }
    }
}

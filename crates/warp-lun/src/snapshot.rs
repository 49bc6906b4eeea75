//! Snapshot contexts
//!
//! Every write-class image request pins the snapshot context that was
//! current when it was built. The context lives in the image header behind a
//! read/write lock; writers take a reference under the read lock and carry it
//! for the lifetime of the request. Taking a snapshot swaps in a new context
//! under the write lock, so requests already in flight keep the one they
//! pinned.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use tracing::debug;

/// Immutable snapshot context: sequence number plus existing snapshot ids,
/// newest first
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SnapContext {
    /// Sequence number (id of the newest snapshot, 0 when none exist)
    pub seq: u64,
    /// Snapshot ids, newest first
    pub snaps: Vec<u64>,
}

impl SnapContext {
    /// Create a snapshot context
    pub fn new(seq: u64, snaps: Vec<u64>) -> Self {
        Self { seq, snaps }
    }
}

/// Owned reference to a snapshot context.
///
/// Dropping it releases the reference. Not `Clone`: each
/// request takes its own reference through [`ImageHeader::acquire`].
#[derive(Debug)]
pub struct SnapshotRef(Arc<SnapContext>);

impl SnapshotRef {
    /// Sequence number of the pinned context
    pub fn seq(&self) -> u64 {
        self.0.seq
    }

    /// The pinned context
    pub fn context(&self) -> &SnapContext {
        &self.0
    }

    /// Number of live references to the pinned context, including the
    /// header's own while it is still current
    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

/// Snapshot information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    /// Snapshot id
    pub id: u64,
    /// Snapshot name
    pub name: String,
    /// Creation timestamp (unix epoch seconds)
    pub created_at: u64,
}

#[derive(Debug, Default)]
struct HeaderState {
    snapc: Arc<SnapContext>,
    snapshots: Vec<SnapshotInfo>,
}

/// Image header: the current snapshot context and the snapshot list
#[derive(Debug, Default)]
pub struct ImageHeader {
    state: RwLock<HeaderState>,
}

impl ImageHeader {
    /// Create a header with an empty snapshot context
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a reference to the current snapshot context.
    ///
    /// The reference is taken while the read lock is held and the lock is
    /// released before returning.
    pub fn acquire(&self) -> SnapshotRef {
        let state = self.state.read();
        SnapshotRef(Arc::clone(&state.snapc))
    }

    /// Sequence number of the current context
    pub fn current_seq(&self) -> u64 {
        self.state.read().snapc.seq
    }

    /// Create a snapshot and make the new context current. Returns the id.
    pub fn create_snapshot(&self, name: impl Into<String>) -> u64 {
        let name = name.into();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let mut state = self.state.write();
        let id = state.snapc.seq + 1;
        let mut snaps = Vec::with_capacity(state.snapc.snaps.len() + 1);
        snaps.push(id);
        snaps.extend_from_slice(&state.snapc.snaps);
        state.snapc = Arc::new(SnapContext::new(id, snaps));
        state.snapshots.push(SnapshotInfo {
            id,
            name: name.clone(),
            created_at: now,
        });
        debug!("Created snapshot {} ({}), seq now {}", name, id, id);
        id
    }

    /// List snapshots, oldest first
    pub fn list_snapshots(&self) -> Vec<SnapshotInfo> {
        self.state.read().snapshots.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release_refcount() {
        let header = ImageHeader::new();
        let a = header.acquire();
        assert_eq!(a.refcount(), 2);

        let b = header.acquire();
        assert_eq!(a.refcount(), 3);

        drop(b);
        assert_eq!(a.refcount(), 2);
        assert_eq!(a.seq(), 0);
    }

    #[test]
    fn test_snapshot_advances_context() {
        let header = ImageHeader::new();
        let before = header.acquire();

        let id = header.create_snapshot("snap-1");
        assert_eq!(id, 1);
        assert_eq!(header.current_seq(), 1);

        // The old reference keeps its context and is now the only owner
        assert_eq!(before.seq(), 0);
        assert_eq!(before.refcount(), 1);

        let after = header.acquire();
        assert_eq!(after.seq(), 1);
        assert_eq!(after.context().snaps, vec![1]);

        header.create_snapshot("snap-2");
        let latest = header.acquire();
        assert_eq!(latest.context().snaps, vec![2, 1]);

        let names: Vec<_> = header
            .list_snapshots()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["snap-1", "snap-2"]);
    }
}

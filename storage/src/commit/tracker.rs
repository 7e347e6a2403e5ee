//! Tracks the page's head set and every commit currently live in memory.

use super::CommitId;
use crate::object::ObjectIdentifier;
use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex, Weak},
};

struct LiveEntry {
    // Number of in-memory Commit instances with this id.
    count: usize,
    root: ObjectIdentifier,
    parent_roots: Vec<ObjectIdentifier>,
    synced: bool,
}

struct TrackerState {
    // Heads ordered by (timestamp, id) for deterministic selection.
    heads: BTreeSet<(u64, CommitId)>,
    live: HashMap<CommitId, LiveEntry>,
}

/// Tracks which commits are heads and which are live (referenced in memory).
///
/// Commit objects register on construction and unregister on drop, so the live set is
/// exactly the commits reachable from heads held by the store, open journals, and any
/// caller still holding an [Arc]. Holding a commit live also holds its root identifier
/// live, which is what shields roots from garbage collection.
#[derive(Clone)]
pub struct LiveCommitTracker {
    state: Arc<Mutex<TrackerState>>,
}

impl LiveCommitTracker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(TrackerState {
                heads: BTreeSet::new(),
                live: HashMap::new(),
            })),
        }
    }

    /// Register a live commit instance. The returned guard unregisters on drop.
    pub(crate) fn register(
        &self,
        id: CommitId,
        root: ObjectIdentifier,
        parent_roots: Vec<ObjectIdentifier>,
        synced: bool,
    ) -> Registration {
        let mut state = self.state.lock().unwrap();
        match state.live.get_mut(&id) {
            Some(entry) => entry.count += 1,
            None => {
                state.live.insert(
                    id,
                    LiveEntry {
                        count: 1,
                        root,
                        parent_roots,
                        synced,
                    },
                );
            }
        }
        Registration {
            state: Arc::downgrade(&self.state),
            id,
        }
    }

    /// Record that a live commit became synced.
    pub fn mark_synced(&self, id: &CommitId) {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.live.get_mut(id) {
            entry.synced = true;
            entry.parent_roots.clear();
        }
    }

    /// Add `(timestamp, id)` pairs to the head set.
    pub fn add_heads(&self, heads: impl IntoIterator<Item = (u64, CommitId)>) {
        let mut state = self.state.lock().unwrap();
        for head in heads {
            state.heads.insert(head);
        }
    }

    /// Remove commits from the head set.
    pub fn remove_heads(&self, ids: &[CommitId]) {
        let mut state = self.state.lock().unwrap();
        state.heads.retain(|(_, id)| !ids.contains(id));
    }

    /// Current heads, ordered by (timestamp, id).
    pub fn heads(&self) -> Vec<CommitId> {
        self.state
            .lock()
            .unwrap()
            .heads
            .iter()
            .map(|(_, id)| *id)
            .collect()
    }

    /// Number of current heads.
    pub fn head_count(&self) -> usize {
        self.state.lock().unwrap().heads.len()
    }

    /// Ids of all live commits.
    pub fn live_commits(&self) -> Vec<CommitId> {
        self.state.lock().unwrap().live.keys().copied().collect()
    }

    /// Whether a commit is live.
    pub fn is_live(&self, id: &CommitId) -> bool {
        self.state.lock().unwrap().live.contains_key(id)
    }

    /// Root identifiers of every live commit, plus the parents' roots of live commits
    /// that are not yet synced (sync may still need them to compute diffs).
    pub fn live_root_identifiers(&self) -> Vec<ObjectIdentifier> {
        let state = self.state.lock().unwrap();
        let mut roots = BTreeSet::new();
        for entry in state.live.values() {
            roots.insert(entry.root.clone());
            if !entry.synced {
                for root in &entry.parent_roots {
                    roots.insert(root.clone());
                }
            }
        }
        roots.into_iter().collect()
    }
}

impl Default for LiveCommitTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard that removes one live reference for a commit when dropped.
pub(crate) struct Registration {
    state: Weak<Mutex<TrackerState>>,
    id: CommitId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let Some(state) = self.state.upgrade() else {
            return;
        };
        let mut state = state.lock().unwrap();
        let Some(entry) = state.live.get_mut(&self.id) else {
            return;
        };
        entry.count -= 1;
        if entry.count == 0 {
            state.live.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        commit::CommitFactory,
        object::{ObjectDigest, ObjectIdentifierFactory},
    };

    #[test]
    fn test_live_follows_commit_lifetime() {
        let tracker = LiveCommitTracker::new();
        let commits = CommitFactory::new(tracker.clone());
        let objects = ObjectIdentifierFactory::new();

        let root_id = objects.make_identifier(0, ObjectDigest::for_content(b"root"));
        let commit = commits.root(root_id.clone());
        assert!(tracker.is_live(commit.id()));

        // A second instance of the same commit keeps it live after the first drops.
        let again = commits
            .from_storage_bytes(
                *commit.id(),
                &commit.storage_bytes(),
                &objects,
                Vec::new(),
                true,
            )
            .unwrap();
        let id = *commit.id();
        drop(commit);
        assert!(tracker.is_live(&id));
        drop(again);
        assert!(!tracker.is_live(&id));
    }

    #[test]
    fn test_heads_ordering() {
        let tracker = LiveCommitTracker::new();
        let a = CommitId::from([1u8; 32]);
        let b = CommitId::from([2u8; 32]);
        let c = CommitId::from([3u8; 32]);

        tracker.add_heads([(5, c), (5, b), (1, a)]);
        assert_eq!(tracker.heads(), vec![a, b, c]);

        tracker.remove_heads(&[b]);
        assert_eq!(tracker.heads(), vec![a, c]);
    }

    #[test]
    fn test_live_roots_include_unsynced_parents() {
        let tracker = LiveCommitTracker::new();
        let commits = CommitFactory::new(tracker.clone());
        let objects = ObjectIdentifierFactory::new();

        let base_root = objects.make_identifier(0, ObjectDigest::for_content(b"base"));
        let base = commits.root(base_root.clone());
        let child_root = objects.make_identifier(0, ObjectDigest::for_content(b"child"));
        let child = commits.from_content_and_parents(1, vec![base.clone()], child_root.clone());
        drop(base);

        // The unsynced child keeps its parent's root derivable even though the parent
        // commit itself is no longer live.
        let roots = tracker.live_root_identifiers();
        assert!(roots.contains(&base_root));
        assert!(roots.contains(&child_root));

        tracker.mark_synced(child.id());
        let roots = tracker.live_root_identifiers();
        assert!(!roots.contains(&base_root));
        assert!(roots.contains(&child_root));
    }
}

//! Mutable staging for the next commit.

use crate::{
    commit::Commit,
    object::{ObjectIdentifier, Priority},
};
use std::{collections::BTreeMap, sync::Arc};

/// A staged change for one key.
#[derive(Debug, Clone)]
pub(crate) enum JournalChange {
    Put {
        value: ObjectIdentifier,
        priority: Priority,
    },
    Delete,
}

/// A staging buffer of upserts and deletions scoped to one (simple) or two (merge)
/// parent commits.
///
/// Journals are independent: any number can be open on the same page. Committing goes
/// through the page store, which serializes tree rebuilds. The journal holds its parent
/// commits alive until it is committed or dropped, so their roots cannot be collected
/// out from under a pending commit.
pub struct Journal {
    parents: Vec<Arc<Commit>>,
    changes: BTreeMap<Vec<u8>, JournalChange>,
}

impl Journal {
    pub(crate) fn new(parents: Vec<Arc<Commit>>) -> Self {
        assert!(!parents.is_empty() && parents.len() <= 2);
        Self {
            parents,
            changes: BTreeMap::new(),
        }
    }

    /// Stage an upsert. A later change to the same key wins.
    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: ObjectIdentifier, priority: Priority) {
        self.changes
            .insert(key.into(), JournalChange::Put { value, priority });
    }

    /// Stage a deletion.
    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.changes.insert(key.into(), JournalChange::Delete);
    }

    /// Whether this journal merges two parents.
    pub fn is_merge(&self) -> bool {
        self.parents.len() == 2
    }

    pub(crate) fn parents(&self) -> &[Arc<Commit>] {
        &self.parents
    }

    pub(crate) fn changes(&self) -> &BTreeMap<Vec<u8>, JournalChange> {
        &self.changes
    }

    pub(crate) fn into_parts(self) -> (Vec<Arc<Commit>>, BTreeMap<Vec<u8>, JournalChange>) {
        (self.parents, self.changes)
    }
}

//! Content-addressed page storage: object store, commit graph, and garbage collection.
//!
//! A page is a keyed set of content-addressed objects organized as a commit DAG. Local
//! mutations are staged in a [journal::Journal] and become immutable [commit::Commit]s;
//! remote mutations arrive as commit batches from a cloud synchronizer. Objects are
//! reference-counted by an [object::ObjectIdentifierFactory] and collected once nothing
//! on disk or in memory points at them. A background [pruner::CommitPruner] deletes
//! commits strictly dominated by the common ancestor of everything still live.
//!
//! All components are generic over a `commonware-runtime` context, so the entire engine
//! runs (and is tested) on the deterministic runtime with a single-threaded cooperative
//! scheduler.

pub mod commit;
pub mod db;
pub mod encryption;
pub mod journal;
pub mod object;
pub mod page;
pub mod pruner;
pub mod tree;

pub use commit::{
    compute_commit_id, ChangeSource, Commit, CommitFactory, CommitId, LiveCommitTracker,
};
pub use journal::Journal;
pub use object::{
    ObjectDigest, ObjectIdentifier, ObjectIdentifierFactory, Priority, MAX_INLINE_SIZE,
};
pub use page::{
    CommitEvent, CommitIdAndBytes, Config, GcOutcome, GcPolicy, ObjectLocation, PageStorage,
    PageSyncDelegate,
};
pub use pruner::CommitPruningPolicy;
pub use tree::{ChangeOperation, Entry, EntryChange, TreeDiff};

use thiserror::Error;

/// Errors that can occur when interacting with a page store.
#[derive(Error, Debug)]
pub enum Error {
    #[error("db error: {0}")]
    Db(#[from] db::Error),
    #[error("codec error: {0}")]
    Codec(#[from] commonware_codec::Error),
    #[error("encryption error: {0}")]
    Encryption(String),
    #[error("commit missing: {0}")]
    CommitNotFound(CommitId),
    #[error("parent commit missing: {0}")]
    ParentNotFound(CommitId),
    #[error("object missing: {0}")]
    ObjectNotFound(ObjectDigest),
    #[error("data integrity: {0}")]
    DataIntegrity(String),
    #[error("network fetch failed: {0}")]
    Network(String),
    #[error("diff retrieval not supported")]
    DiffNotSupported,
    #[error("journal already committed")]
    JournalCommitted,
    #[error("no sync delegate registered")]
    NoSyncDelegate,
}

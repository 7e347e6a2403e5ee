//! Cloud synchronization for the page store.
//!
//! [PageSync] composes two state machines over one page: an upload direction pushing
//! unsynced local commits and objects to the cloud, and a download direction applying
//! remote commits, diffs, and objects locally. Both run as mailbox actors on the
//! runtime context; the coordinator arbitrates their interaction (upload holds while
//! a download backlog is in progress), merges their states for watchers, and tears
//! sync down on unrecoverable errors.

pub mod backoff;
mod batch;
pub mod cloud;
pub mod diff;
mod download;
pub mod mocks;
mod page_sync;
pub mod state;
mod upload;

pub use cloud::{
    CloudError, CommitPack, DiffEntry, DiffOperation, DiffPack, PageCloud, PositionToken,
    RemoteCommit, WatcherEvent,
};
pub use page_sync::PageSync;
pub use state::{DownloadSyncState, SyncState, UploadSyncState};

use thiserror::Error;

/// Sync-metadata key under which the cloud position token is persisted.
pub const POSITION_TOKEN_KEY: &[u8] = b"timestamp";

/// Errors surfaced by the synchronizer.
#[derive(Error, Debug)]
pub enum Error {
    #[error("storage error: {0}")]
    Storage(#[from] pagestore_storage::Error),
    #[error("cloud error: {0}")]
    Cloud(#[from] CloudError),
    #[error("ambiguous diff: unresolved operations for one entry id")]
    AmbiguousDiff,
}

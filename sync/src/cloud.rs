//! The cloud RPC surface the synchronizer talks to.
//!
//! The wire protocol itself is opaque; this trait is the narrow contract the state
//! machines rely on. Push notifications arrive over the channel returned by
//! [PageCloud::set_watcher].

use bytes::Bytes;
use futures::channel::mpsc;
use std::future::Future;
use thiserror::Error;

/// Errors surfaced by cloud calls.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CloudError {
    #[error("network error")]
    Network,
    #[error("authentication error")]
    Auth,
    #[error("not found")]
    NotFound,
    #[error("malformed payload")]
    Parse,
    #[error("operation not supported")]
    NotSupported,
    #[error("internal error")]
    Internal,
}

impl CloudError {
    /// Whether the error is worth retrying with backoff. Everything else is permanent
    /// for the current sync session.
    pub fn is_temporary(&self) -> bool {
        matches!(self, Self::Network | Self::Auth)
    }
}

/// Opaque cursor into the cloud commit log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionToken(pub Bytes);

/// A commit as the cloud sees it: encoded id plus encrypted storage bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommit {
    pub id: Vec<u8>,
    pub data: Bytes,
}

/// An ordered batch of remote commits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitPack {
    pub commits: Vec<RemoteCommit>,
}

/// Which side of a diff a change is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DiffOperation {
    Deletion,
    Insertion,
}

/// One change inside a cloud diff, keyed by an opaque, non-secret entry id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffEntry {
    pub entry_id: Vec<u8>,
    pub operation: DiffOperation,
    pub key: Vec<u8>,
    /// Encrypted entry payload (value identifier and priority).
    pub payload: Bytes,
}

/// A diff against one of the bases offered by the caller.
#[derive(Debug, Clone, Default)]
pub struct DiffPack {
    /// The remote-encoded id of the base commit the diff applies to.
    pub base: Vec<u8>,
    pub entries: Vec<DiffEntry>,
}

/// Push notifications delivered to a registered watcher.
#[derive(Debug)]
pub enum WatcherEvent {
    NewCommits {
        pack: CommitPack,
        token: PositionToken,
    },
    Error(CloudError),
}

/// The cloud service for one page.
pub trait PageCloud: Clone + Send + Sync + 'static {
    /// Upload a batch of commits.
    fn add_commits(
        &self,
        pack: CommitPack,
    ) -> impl Future<Output = Result<(), CloudError>> + Send;

    /// Fetch all commits after `token` (all commits when `None`), plus the new cursor.
    /// `None` commits means the log holds nothing new.
    fn get_commits(
        &self,
        token: Option<PositionToken>,
    ) -> impl Future<Output = Result<(Option<CommitPack>, PositionToken), CloudError>> + Send;

    /// Upload an object under its obfuscated name.
    fn add_object(
        &self,
        name: Vec<u8>,
        data: Bytes,
    ) -> impl Future<Output = Result<(), CloudError>> + Send;

    /// Fetch an object by its obfuscated name.
    fn get_object(&self, name: Vec<u8>)
        -> impl Future<Output = Result<Bytes, CloudError>> + Send;

    /// Register for push notifications of commits after `token`.
    fn set_watcher(
        &self,
        token: Option<PositionToken>,
    ) -> impl Future<Output = Result<mpsc::UnboundedReceiver<WatcherEvent>, CloudError>> + Send;

    /// Fetch a diff reconstructing `id` from one of `bases` (all remote-encoded ids).
    fn get_diff(
        &self,
        id: Vec<u8>,
        bases: Vec<Vec<u8>>,
    ) -> impl Future<Output = Result<DiffPack, CloudError>> + Send;

    /// Merge causal metadata with the cloud, returning the merged clock.
    fn update_clock(&self, clock: Bytes)
        -> impl Future<Output = Result<Bytes, CloudError>> + Send;
}

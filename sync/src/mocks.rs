//! In-memory cloud for tests: inspectable state, manual push, and failure injection.

use crate::cloud::{
    CloudError, CommitPack, DiffPack, PageCloud, PositionToken, RemoteCommit, WatcherEvent,
};
use bytes::Bytes;
use futures::channel::mpsc;
use pagestore_storage::{encryption::EncryptionService, Commit, Error as StorageError};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

#[derive(Default)]
struct Failures {
    add_commits: Vec<CloudError>,
    get_commits: Vec<CloudError>,
    add_object: Vec<CloudError>,
    get_object: Vec<CloudError>,
    set_watcher: Vec<CloudError>,
    get_diff: Vec<CloudError>,
    update_clock: Vec<CloudError>,
}

fn take_failure(queue: &mut Vec<CloudError>) -> Option<CloudError> {
    if queue.is_empty() {
        None
    } else {
        Some(queue.remove(0))
    }
}

#[derive(Default)]
struct CloudState {
    commits: Vec<RemoteCommit>,
    objects: HashMap<Vec<u8>, Bytes>,
    diffs: HashMap<Vec<u8>, DiffPack>,
    watchers: Vec<mpsc::UnboundedSender<WatcherEvent>>,
    clock: Bytes,
    failures: Failures,
}

/// An in-memory [PageCloud].
///
/// Cheap to clone; all clones share state, so a test can hand one clone to the
/// synchronizer and keep another for inspection and push injection.
#[derive(Clone, Default)]
pub struct TestPageCloud {
    state: Arc<Mutex<CloudState>>,
}

fn token_of(position: usize) -> PositionToken {
    PositionToken(Bytes::copy_from_slice(&(position as u64).to_be_bytes()))
}

fn position_of(token: Option<PositionToken>) -> usize {
    let Some(token) = token else {
        return 0;
    };
    let Ok(bytes) = <[u8; 8]>::try_from(token.0.as_ref()) else {
        return 0;
    };
    u64::from_be_bytes(bytes) as usize
}

impl TestPageCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commits the cloud has accepted, in arrival order.
    pub fn received_commits(&self) -> Vec<RemoteCommit> {
        self.state.lock().unwrap().commits.clone()
    }

    /// Number of objects the cloud holds.
    pub fn object_count(&self) -> usize {
        self.state.lock().unwrap().objects.len()
    }

    /// The last clock uploaded.
    pub fn last_clock(&self) -> Bytes {
        self.state.lock().unwrap().clock.clone()
    }

    /// Append commits as if another device uploaded them, notifying watchers.
    pub fn push_commits(&self, commits: Vec<RemoteCommit>) {
        let mut state = self.state.lock().unwrap();
        state.commits.extend(commits.iter().cloned());
        let token = token_of(state.commits.len());
        let pack = CommitPack { commits };
        state.watchers.retain(|watcher| {
            watcher
                .unbounded_send(WatcherEvent::NewCommits {
                    pack: pack.clone(),
                    token: token.clone(),
                })
                .is_ok()
        });
    }

    /// Store an object directly, bypassing upload.
    pub fn seed_object(&self, name: Vec<u8>, data: Bytes) {
        self.state.lock().unwrap().objects.insert(name, data);
    }

    /// Serve `pack` for diff requests against `id`.
    pub fn set_diff(&self, id: Vec<u8>, pack: DiffPack) {
        self.state.lock().unwrap().diffs.insert(id, pack);
    }

    /// Push an error to all registered watchers.
    pub fn fail_watchers(&self, err: CloudError) {
        let mut state = self.state.lock().unwrap();
        for watcher in state.watchers.drain(..) {
            let _ = watcher.unbounded_send(WatcherEvent::Error(err.clone()));
        }
    }

    pub fn fail_next_add_commits(&self, errors: Vec<CloudError>) {
        self.state.lock().unwrap().failures.add_commits = errors;
    }

    pub fn fail_next_get_commits(&self, errors: Vec<CloudError>) {
        self.state.lock().unwrap().failures.get_commits = errors;
    }

    pub fn fail_next_add_object(&self, errors: Vec<CloudError>) {
        self.state.lock().unwrap().failures.add_object = errors;
    }

    pub fn fail_next_get_object(&self, errors: Vec<CloudError>) {
        self.state.lock().unwrap().failures.get_object = errors;
    }

    pub fn fail_next_set_watcher(&self, errors: Vec<CloudError>) {
        self.state.lock().unwrap().failures.set_watcher = errors;
    }

    pub fn fail_next_update_clock(&self, errors: Vec<CloudError>) {
        self.state.lock().unwrap().failures.update_clock = errors;
    }
}

impl PageCloud for TestPageCloud {
    async fn add_commits(&self, pack: CommitPack) -> Result<(), CloudError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = take_failure(&mut state.failures.add_commits) {
            return Err(err);
        }
        state.commits.extend(pack.commits.iter().cloned());
        let token = token_of(state.commits.len());
        state.watchers.retain(|watcher| {
            watcher
                .unbounded_send(WatcherEvent::NewCommits {
                    pack: pack.clone(),
                    token: token.clone(),
                })
                .is_ok()
        });
        Ok(())
    }

    async fn get_commits(
        &self,
        token: Option<PositionToken>,
    ) -> Result<(Option<CommitPack>, PositionToken), CloudError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = take_failure(&mut state.failures.get_commits) {
            return Err(err);
        }
        let position = position_of(token).min(state.commits.len());
        let next = token_of(state.commits.len());
        if position == state.commits.len() {
            return Ok((None, next));
        }
        let pack = CommitPack {
            commits: state.commits[position..].to_vec(),
        };
        Ok((Some(pack), next))
    }

    async fn add_object(&self, name: Vec<u8>, data: Bytes) -> Result<(), CloudError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = take_failure(&mut state.failures.add_object) {
            return Err(err);
        }
        state.objects.insert(name, data);
        Ok(())
    }

    async fn get_object(&self, name: Vec<u8>) -> Result<Bytes, CloudError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = take_failure(&mut state.failures.get_object) {
            return Err(err);
        }
        state.objects.get(&name).cloned().ok_or(CloudError::NotFound)
    }

    async fn set_watcher(
        &self,
        token: Option<PositionToken>,
    ) -> Result<mpsc::UnboundedReceiver<WatcherEvent>, CloudError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = take_failure(&mut state.failures.set_watcher) {
            return Err(err);
        }
        let (tx, rx) = mpsc::unbounded();
        let position = position_of(token).min(state.commits.len());
        if position < state.commits.len() {
            // Deliver what the watcher missed between its token and now.
            let pack = CommitPack {
                commits: state.commits[position..].to_vec(),
            };
            let _ = tx.unbounded_send(WatcherEvent::NewCommits {
                pack,
                token: token_of(state.commits.len()),
            });
        }
        state.watchers.push(tx);
        Ok(rx)
    }

    async fn get_diff(&self, id: Vec<u8>, bases: Vec<Vec<u8>>) -> Result<DiffPack, CloudError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = take_failure(&mut state.failures.get_diff) {
            return Err(err);
        }
        // A cloud with no diff prepared for this commit behaves as if diffs were
        // unsupported, which exercises the whole-object fallback.
        let pack = state
            .diffs
            .get(&id)
            .cloned()
            .ok_or(CloudError::NotSupported)?;
        if !bases.contains(&pack.base) {
            return Err(CloudError::NotFound);
        }
        Ok(pack)
    }

    async fn update_clock(&self, clock: Bytes) -> Result<Bytes, CloudError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = take_failure(&mut state.failures.update_clock) {
            return Err(err);
        }
        state.clock = clock.clone();
        Ok(clock)
    }
}

/// Build the remote representation of a local commit.
pub async fn to_remote_commit<S: EncryptionService>(
    encryption: &S,
    commit: &Commit,
) -> Result<RemoteCommit, StorageError> {
    let id = encryption.encode_commit_id(commit.id()).await?;
    let data = encryption
        .encrypt_commit(commit.storage_bytes().into())
        .await?;
    Ok(RemoteCommit { id, data })
}

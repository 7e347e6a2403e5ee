//! Single-flight batch transfer in each direction.

use crate::{
    cloud::{CloudError, CommitPack, PageCloud, PositionToken, RemoteCommit},
    POSITION_TOKEN_KEY,
};
use commonware_runtime::{Clock, Metrics, Spawner};
use pagestore_storage::{
    compute_commit_id, db::Db, encryption::EncryptionService, ChangeSource, Commit,
    CommitIdAndBytes, ObjectLocation, PageStorage,
};
use std::sync::Arc;
use tracing::debug;

/// How a batch failed: temporary errors are retried with backoff, permanent errors
/// stop the owning direction.
#[derive(Debug)]
pub(crate) enum BatchError {
    Temporary(CloudError),
    Permanent(String),
}

impl BatchError {
    fn cloud(err: CloudError) -> Self {
        if err.is_temporary() {
            Self::Temporary(err)
        } else {
            Self::Permanent(err.to_string())
        }
    }

    fn local(err: pagestore_storage::Error) -> Self {
        // Local storage failures are never retried: they indicate corruption or a
        // broken engine, not a flaky link.
        Self::Permanent(err.to_string())
    }
}

/// Upload every unsynced piece, then `commits`, marking both synced as they land.
///
/// Objects go first so the cloud never advertises a commit whose tree bytes it cannot
/// serve.
pub(crate) async fn upload_batch<E, D, S, C>(
    storage: Arc<PageStorage<E, D, S>>,
    cloud: C,
    commits: Vec<Arc<Commit>>,
) -> Result<(), BatchError>
where
    E: Clock + Spawner + Metrics,
    D: Db,
    S: EncryptionService,
    C: PageCloud,
{
    let encryption = storage.encryption().clone();

    let pieces = storage
        .get_unsynced_pieces()
        .await
        .map_err(BatchError::local)?;
    for piece in pieces {
        let bytes = storage
            .get_object(&piece, ObjectLocation::Local)
            .await
            .map_err(BatchError::local)?;
        let name = encryption
            .get_object_name(piece.digest())
            .await
            .map_err(BatchError::local)?;
        let encrypted = encryption
            .encrypt_object(piece.key_index(), bytes)
            .await
            .map_err(BatchError::local)?;
        cloud
            .add_object(name, encrypted)
            .await
            .map_err(BatchError::cloud)?;
        storage
            .mark_piece_synced(piece.digest())
            .await
            .map_err(BatchError::local)?;
    }

    let mut pack = CommitPack::default();
    for commit in &commits {
        let id = encryption
            .encode_commit_id(commit.id())
            .await
            .map_err(BatchError::local)?;
        let data = encryption
            .encrypt_commit(commit.storage_bytes().into())
            .await
            .map_err(BatchError::local)?;
        pack.commits.push(RemoteCommit { id, data });
    }
    let count = pack.commits.len();
    cloud.add_commits(pack).await.map_err(BatchError::cloud)?;
    for commit in &commits {
        storage
            .mark_commit_synced(commit.id())
            .await
            .map_err(BatchError::local)?;
    }
    debug!(commits = count, "batch uploaded");
    Ok(())
}

/// Verify and apply a batch of remote commits, then persist the advanced position
/// token. Returns how many commits were handed to storage.
///
/// Every commit's remote id must equal the remote encoding of its content hash; a
/// mismatch rejects the batch before anything reaches storage.
pub(crate) async fn download_batch<E, D, S>(
    storage: Arc<PageStorage<E, D, S>>,
    pack: CommitPack,
    token: PositionToken,
) -> Result<usize, BatchError>
where
    E: Clock + Spawner + Metrics,
    D: Db,
    S: EncryptionService,
{
    let encryption = storage.encryption().clone();
    let mut commits = Vec::with_capacity(pack.commits.len());
    for remote in pack.commits {
        let bytes = encryption
            .decrypt_commit(remote.data)
            .await
            .map_err(BatchError::local)?;
        let id = compute_commit_id(&bytes)
            .map_err(|err| BatchError::Permanent(format!("malformed remote commit: {err}")))?;
        let expected = encryption
            .encode_commit_id(&id)
            .await
            .map_err(BatchError::local)?;
        if expected != remote.id {
            return Err(BatchError::Permanent(
                "remote commit id does not match content".to_string(),
            ));
        }
        commits.push(CommitIdAndBytes { id, bytes });
    }
    let count = commits.len();
    if count > 0 {
        storage
            .add_commits_from_sync(commits, ChangeSource::Cloud)
            .await
            .map_err(BatchError::local)?;
    }
    storage
        .set_sync_metadata(POSITION_TOKEN_KEY, token.0)
        .await
        .map_err(BatchError::local)?;
    debug!(commits = count, "batch downloaded");
    Ok(count)
}

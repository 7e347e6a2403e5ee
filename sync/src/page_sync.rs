//! The synchronizer for one page: composes the upload and download directions.

use crate::{
    backoff::Backoff,
    cloud::PageCloud,
    download,
    state::{DownloadSyncState, SyncState, UploadSyncState},
    upload,
};
use bytes::Bytes;
use commonware_macros::select;
use commonware_runtime::{Clock, Metrics, Spawner};
use futures::{
    channel::{mpsc, oneshot},
    future::BoxFuture,
    StreamExt,
};
use pagestore_storage::{
    db::Db, encryption::EncryptionService, CommitId, Error as StorageError, ObjectIdentifier,
    PageStorage, PageSyncDelegate, TreeDiff,
};
use std::sync::{Arc, Mutex};
use tracing::debug;

type OnceCallback = Box<dyn FnOnce() + Send + 'static>;
type RepeatCallback = Box<dyn FnMut() + Send + 'static>;

/// Synchronizes one page with the cloud.
///
/// Downloading starts with [PageSync::start]; uploading additionally requires an
/// explicit [PageSync::enable_upload], so callers can defer it (e.g. until initial
/// conflict resolution completes). The coordinator arbitrates the two directions:
/// upload holds while download is not idle, the merged state feeds watchers with
/// consecutive duplicates suppressed, and a permanent error in either direction
/// unregisters the storage delegate and fires the unrecoverable-error callback
/// exactly once.
pub struct PageSync<E, D, S, C, B>
where
    E: Clock + Spawner + Metrics,
    D: Db,
    S: EncryptionService,
    C: PageCloud,
    B: Backoff,
{
    context: E,
    storage: Arc<PageStorage<E, D, S>>,
    cloud: C,
    download_backoff: Option<B>,
    upload_backoff: Option<B>,
    upload: Option<upload::Mailbox>,
    state: Arc<Mutex<SyncState>>,
    watchers: Arc<Mutex<Vec<mpsc::UnboundedSender<SyncState>>>>,
    on_backlog_downloaded: Option<OnceCallback>,
    on_paused: Option<RepeatCallback>,
    on_unrecoverable_error: Option<OnceCallback>,
    started: bool,
}

impl<E, D, S, C, B> PageSync<E, D, S, C, B>
where
    E: Clock + Spawner + Metrics,
    D: Db,
    S: EncryptionService,
    C: PageCloud,
    B: Backoff,
{
    pub fn new(
        context: E,
        storage: Arc<PageStorage<E, D, S>>,
        cloud: C,
        download_backoff: B,
        upload_backoff: B,
    ) -> Self {
        Self {
            context,
            storage,
            cloud,
            download_backoff: Some(download_backoff),
            upload_backoff: Some(upload_backoff),
            upload: None,
            state: Arc::new(Mutex::new(SyncState::new())),
            watchers: Arc::new(Mutex::new(Vec::new())),
            on_backlog_downloaded: None,
            on_paused: None,
            on_unrecoverable_error: None,
            started: false,
        }
    }

    /// Fire once when the download direction first leaves the backlog phase.
    /// Must be set before [Self::start].
    pub fn set_on_backlog_downloaded(&mut self, callback: impl FnOnce() + Send + 'static) {
        assert!(!self.started, "callbacks must be set before start");
        self.on_backlog_downloaded = Some(Box::new(callback));
    }

    /// Fire whenever the merged state transitions into paused.
    /// Must be set before [Self::start].
    pub fn set_on_paused(&mut self, callback: impl FnMut() + Send + 'static) {
        assert!(!self.started, "callbacks must be set before start");
        self.on_paused = Some(Box::new(callback));
    }

    /// Fire once if either direction fails permanently.
    /// Must be set before [Self::start].
    pub fn set_on_unrecoverable_error(&mut self, callback: impl FnOnce() + Send + 'static) {
        assert!(!self.started, "callbacks must be set before start");
        self.on_unrecoverable_error = Some(Box::new(callback));
    }

    /// Register a watcher for merged-state changes.
    pub fn register_state_watcher(&self) -> mpsc::UnboundedReceiver<SyncState> {
        let (tx, rx) = mpsc::unbounded();
        self.watchers.lock().unwrap().push(tx);
        rx
    }

    /// The current merged state.
    pub fn state(&self) -> SyncState {
        *self.state.lock().unwrap()
    }

    /// Whether both directions are paused (idle or waiting out a backoff).
    pub fn is_paused(&self) -> bool {
        self.state().is_paused()
    }

    /// Spawn both directions and begin downloading.
    pub async fn start(&mut self) {
        assert!(!self.started, "sync already started");
        self.started = true;

        let (upload_actor, upload_mailbox, upload_states) = upload::Actor::new(
            self.context.with_label("upload"),
            self.storage.clone(),
            self.cloud.clone(),
            self.upload_backoff.take().expect("backoff consumed"),
        );
        let (download_actor, download_mailbox, download_states) = download::Actor::new(
            self.context.with_label("download"),
            self.storage.clone(),
            self.cloud.clone(),
            self.download_backoff.take().expect("backoff consumed"),
        );
        upload_actor.start();
        download_actor.start();

        self.storage
            .set_sync_delegate(Some(Arc::new(SyncDelegate {
                upload: Some(upload_mailbox.clone()),
                download: download_mailbox.clone(),
            })));

        let coordinator = Coordinator {
            upload_states,
            download_states,
            upload: upload_mailbox.clone(),
            storage: self.storage.clone(),
            shared: self.state.clone(),
            watchers: self.watchers.clone(),
            on_backlog_downloaded: self.on_backlog_downloaded.take(),
            on_paused: self.on_paused.take(),
            on_unrecoverable_error: self.on_unrecoverable_error.take(),
        };
        self.context
            .with_label("coordinator")
            .spawn(|_| coordinator.run());

        let mut download = download_mailbox;
        download.start().await;
        self.upload = Some(upload_mailbox);
    }

    /// Allow the upload direction to run. May be called before or after [Self::start];
    /// before, it is a no-op (call again after starting).
    pub async fn enable_upload(&mut self) {
        if let Some(upload) = &mut self.upload {
            upload.enable().await;
        }
    }
}

/// The storage-facing lazy-fetch surface: requests route into the actors' mailboxes
/// and responses come back over oneshot channels, so a call outlives any borrow of
/// the synchronizer.
struct SyncDelegate {
    upload: Option<upload::Mailbox>,
    download: download::Mailbox,
}

impl PageSyncDelegate for SyncDelegate {
    fn get_object(
        &self,
        identifier: ObjectIdentifier,
    ) -> BoxFuture<'static, Result<Bytes, StorageError>> {
        let mut download = self.download.clone();
        Box::pin(async move {
            let (response, receiver) = oneshot::channel();
            download.get_object(identifier, response).await;
            receiver
                .await
                .map_err(|_| StorageError::Network("sync stopped".to_string()))?
        })
    }

    fn get_diff(
        &self,
        commit_id: CommitId,
        bases: Vec<CommitId>,
    ) -> BoxFuture<'static, Result<TreeDiff, StorageError>> {
        let mut download = self.download.clone();
        Box::pin(async move {
            let (response, receiver) = oneshot::channel();
            download.get_diff(commit_id, bases, response).await;
            receiver
                .await
                .map_err(|_| StorageError::Network("sync stopped".to_string()))?
        })
    }

    fn update_clock(&self, clock: Bytes) -> BoxFuture<'static, Result<Bytes, StorageError>> {
        let upload = self.upload.clone();
        Box::pin(async move {
            let Some(mut upload) = upload else {
                return Err(StorageError::Network("upload not available".to_string()));
            };
            let (response, receiver) = oneshot::channel();
            upload.update_clock(clock, response).await;
            match receiver.await {
                Ok(Ok(merged)) => Ok(merged),
                Ok(Err(err)) => Err(StorageError::Network(err.to_string())),
                Err(_) => Err(StorageError::Network("sync stopped".to_string())),
            }
        })
    }
}

#[cfg(test)]
pub(crate) fn delegate_for_tests(
    download: download::Mailbox,
) -> Arc<dyn PageSyncDelegate> {
    Arc::new(SyncDelegate {
        upload: None,
        download,
    })
}

/// Merges the two directions' states and runs the interaction rules.
struct Coordinator<E, D, S>
where
    E: Clock + Spawner + Metrics,
    D: Db,
    S: EncryptionService,
{
    upload_states: mpsc::UnboundedReceiver<UploadSyncState>,
    download_states: mpsc::UnboundedReceiver<DownloadSyncState>,
    upload: upload::Mailbox,
    storage: Arc<PageStorage<E, D, S>>,
    shared: Arc<Mutex<SyncState>>,
    watchers: Arc<Mutex<Vec<mpsc::UnboundedSender<SyncState>>>>,
    on_backlog_downloaded: Option<OnceCallback>,
    on_paused: Option<RepeatCallback>,
    on_unrecoverable_error: Option<OnceCallback>,
}

impl<E, D, S> Coordinator<E, D, S>
where
    E: Clock + Spawner + Metrics,
    D: Db,
    S: EncryptionService,
{
    async fn run(mut self) {
        let mut state = SyncState::new();
        let mut last_sent: Option<SyncState> = None;
        let mut was_paused = false;
        let mut backlog_fired = false;
        let mut error_fired = false;
        loop {
            enum Wake {
                Upload(Option<UploadSyncState>),
                Download(Option<DownloadSyncState>),
            }
            let wake;
            select! {
                next = self.download_states.next() => {
                    wake = Wake::Download(next);
                },
                next = self.upload_states.next() => {
                    wake = Wake::Upload(next);
                },
            }
            match wake {
                Wake::Download(None) | Wake::Upload(None) => return,
                Wake::Download(Some(next)) => {
                    let previous = state.download;
                    state.download = next;
                    if previous == DownloadSyncState::Backlog
                        && next != DownloadSyncState::Backlog
                        && !backlog_fired
                    {
                        backlog_fired = true;
                        if let Some(callback) = self.on_backlog_downloaded.take() {
                            callback();
                        }
                    }
                    let idle = next == DownloadSyncState::Idle;
                    if idle != (previous == DownloadSyncState::Idle) {
                        self.upload.set_download_idle(idle).await;
                    }
                }
                Wake::Upload(Some(next)) => {
                    state.upload = next;
                }
            }

            *self.shared.lock().unwrap() = state;
            if last_sent != Some(state) {
                debug!(%state, "sync state");
                last_sent = Some(state);
                self.watchers
                    .lock()
                    .unwrap()
                    .retain(|watcher| watcher.unbounded_send(state).is_ok());
            }
            if state.is_broken() && !error_fired {
                // The guard keeps a second failing direction (or a callback that
                // tears the synchronizer down) from re-running teardown.
                error_fired = true;
                self.storage.set_sync_delegate(None);
                if let Some(callback) = self.on_unrecoverable_error.take() {
                    callback();
                }
            }
            let paused = state.is_paused();
            if paused && !was_paused {
                if let Some(callback) = &mut self.on_paused {
                    callback();
                }
            }
            was_paused = paused;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backoff::Exponential,
        cloud::CloudError,
        mocks::TestPageCloud,
    };
    use commonware_runtime::{deterministic, Runner as _};
    use pagestore_storage::{
        db::memory::Memory, encryption::Plaintext, Config as StorageConfig, ObjectLocation,
        Priority,
    };
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    type TestStorage = PageStorage<deterministic::Context, Memory, Plaintext>;
    type TestSync = PageSync<deterministic::Context, Memory, Plaintext, TestPageCloud, Exponential>;

    async fn storage(context: &deterministic::Context, label: &str) -> Arc<TestStorage> {
        PageStorage::init(
            context.with_label(label),
            StorageConfig::default(),
            Memory::new(),
            Plaintext::new(),
        )
        .await
        .unwrap()
    }

    fn sync(
        context: &deterministic::Context,
        label: &str,
        storage: &Arc<TestStorage>,
        cloud: &TestPageCloud,
    ) -> TestSync {
        PageSync::new(
            context.with_label(label),
            storage.clone(),
            cloud.clone(),
            Exponential::new(Duration::from_millis(100), Duration::from_secs(1)),
            Exponential::new(Duration::from_millis(100), Duration::from_secs(1)),
        )
    }

    async fn commit_value(storage: &Arc<TestStorage>, key: &[u8], value: &[u8]) {
        let head = storage.heads()[0];
        let value = storage
            .add_object(Bytes::copy_from_slice(value))
            .await
            .unwrap();
        let mut journal = storage.start_commit(&head).await.unwrap();
        journal.put(key.to_vec(), value, Priority::Eager);
        storage.commit_journal(journal).await.unwrap().unwrap();
    }

    #[test]
    fn test_two_devices_converge() {
        let runner = deterministic::Runner::default();
        runner.start(|context| async move {
            let cloud = TestPageCloud::new();
            let storage_a = storage(&context, "storage_a").await;
            let storage_b = storage(&context, "storage_b").await;
            let mut sync_a = sync(&context, "sync_a", &storage_a, &cloud);
            let mut sync_b = sync(&context, "sync_b", &storage_b, &cloud);

            sync_a.start().await;
            sync_b.start().await;
            sync_a.enable_upload().await;
            context.sleep(Duration::from_millis(50)).await;

            commit_value(&storage_a, b"k", b"v").await;
            context.sleep(Duration::from_millis(100)).await;

            // The commit reached the cloud and device B applied it.
            assert_eq!(cloud.received_commits().len(), 1);
            assert_eq!(storage_a.heads(), storage_b.heads());
            assert!(storage_a.get_unsynced_commits().await.unwrap().is_empty());
        });
    }

    #[test]
    fn test_upload_requires_enable() {
        let runner = deterministic::Runner::default();
        runner.start(|context| async move {
            let cloud = TestPageCloud::new();
            let storage_a = storage(&context, "storage_a").await;
            let mut sync_a = sync(&context, "sync_a", &storage_a, &cloud);

            sync_a.start().await;
            commit_value(&storage_a, b"k", b"v").await;
            context.sleep(Duration::from_millis(100)).await;
            assert!(cloud.received_commits().is_empty());

            sync_a.enable_upload().await;
            context.sleep(Duration::from_millis(100)).await;
            assert_eq!(cloud.received_commits().len(), 1);
        });
    }

    #[test]
    fn test_backlog_callback_fires_once() {
        let runner = deterministic::Runner::default();
        runner.start(|context| async move {
            let cloud = TestPageCloud::new();
            let storage_a = storage(&context, "storage_a").await;
            let mut sync_a = sync(&context, "sync_a", &storage_a, &cloud);

            let fired = Arc::new(AtomicUsize::new(0));
            let counter = fired.clone();
            sync_a.set_on_backlog_downloaded(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            sync_a.start().await;
            context.sleep(Duration::from_millis(100)).await;
            assert_eq!(fired.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn test_paused_and_state_watcher() {
        let runner = deterministic::Runner::default();
        runner.start(|context| async move {
            let cloud = TestPageCloud::new();
            let storage_a = storage(&context, "storage_a").await;
            let mut sync_a = sync(&context, "sync_a", &storage_a, &cloud);

            let paused = Arc::new(AtomicUsize::new(0));
            let counter = paused.clone();
            sync_a.set_on_paused(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            let mut states = sync_a.register_state_watcher();
            sync_a.start().await;
            sync_a.enable_upload().await;
            context.sleep(Duration::from_millis(100)).await;

            assert!(sync_a.is_paused());
            assert!(paused.load(Ordering::SeqCst) >= 1);
            assert_eq!(sync_a.state().download, DownloadSyncState::Idle);
            assert_eq!(sync_a.state().upload, UploadSyncState::Idle);

            // No consecutive duplicates reached the watcher.
            let mut seen = Vec::new();
            while let Ok(Some(state)) = states.try_next() {
                seen.push(state);
            }
            for pair in seen.windows(2) {
                assert_ne!(pair[0], pair[1]);
            }
        });
    }

    #[test]
    fn test_unrecoverable_error_tears_down() {
        let runner = deterministic::Runner::default();
        runner.start(|context| async move {
            let cloud = TestPageCloud::new();
            let storage_a = storage(&context, "storage_a").await;
            let mut sync_a = sync(&context, "sync_a", &storage_a, &cloud);

            // A permanent failure while registering the watcher breaks download.
            cloud.fail_next_set_watcher(vec![CloudError::Parse]);
            let fired = Arc::new(AtomicUsize::new(0));
            let counter = fired.clone();
            sync_a.set_on_unrecoverable_error(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            sync_a.start().await;
            context.sleep(Duration::from_millis(200)).await;

            assert_eq!(fired.load(Ordering::SeqCst), 1);
            assert_eq!(sync_a.state().download, DownloadSyncState::PermanentError);

            // The delegate was unregistered: lazy fetches now fail fast.
            let digest = pagestore_storage::ObjectDigest::for_content(&[1u8; 100]);
            let identifier = storage_a.object_factory().make_identifier(0, digest);
            assert!(matches!(
                storage_a
                    .get_object(&identifier, ObjectLocation::ValueFromNetwork)
                    .await,
                Err(StorageError::NoSyncDelegate)
            ));
        });
    }

    #[test]
    fn test_independent_merges_converge() {
        let runner = deterministic::Runner::default();
        runner.start(|context| async move {
            let cloud = TestPageCloud::new();
            let storage_a = storage(&context, "storage_a").await;
            let storage_b = storage(&context, "storage_b").await;
            let mut sync_a = sync(&context, "sync_a", &storage_a, &cloud);
            let mut sync_b = sync(&context, "sync_b", &storage_b, &cloud);
            sync_a.start().await;
            sync_b.start().await;
            sync_a.enable_upload().await;
            context.sleep(Duration::from_millis(50)).await;
            let root = storage_a.heads()[0];

            // Two conflicting branches on device A, merged locally, then uploaded.
            let value = storage_a.add_object(Bytes::from_static(b"a")).await.unwrap();
            let mut journal = storage_a.start_commit(&root).await.unwrap();
            journal.put(b"a".to_vec(), value, Priority::Eager);
            let left = storage_a.commit_journal(journal).await.unwrap().unwrap();
            context.sleep(Duration::from_millis(1)).await;
            let value = storage_a.add_object(Bytes::from_static(b"b")).await.unwrap();
            let mut journal = storage_a.start_commit(&root).await.unwrap();
            journal.put(b"b".to_vec(), value, Priority::Eager);
            let right = storage_a.commit_journal(journal).await.unwrap().unwrap();
            let journal = storage_a
                .start_merge_commit(left.id(), right.id())
                .await
                .unwrap();
            let merge_a = storage_a.commit_journal(journal).await.unwrap().unwrap();
            context.sleep(Duration::from_millis(100)).await;
            assert_eq!(storage_a.heads(), storage_b.heads());

            // Device B re-derives the same merge independently: the branch tree is
            // pulled through the delegate, and the merge id comes out identical.
            let left_on_b = storage_b.get_commit(left.id()).await.unwrap();
            storage_b.get_commit_contents(&left_on_b).await.unwrap();
            let journal = storage_b
                .start_merge_commit(left.id(), right.id())
                .await
                .unwrap();
            let merge_b = storage_b.commit_journal(journal).await.unwrap().unwrap();
            assert_eq!(merge_a.id(), merge_b.id());
        });
    }

    #[test]
    fn test_lazy_value_fetch_through_delegate() {
        let runner = deterministic::Runner::default();
        runner.start(|context| async move {
            let cloud = TestPageCloud::new();
            let storage_a = storage(&context, "storage_a").await;
            let storage_b = storage(&context, "storage_b").await;
            let mut sync_a = sync(&context, "sync_a", &storage_a, &cloud);
            let mut sync_b = sync(&context, "sync_b", &storage_b, &cloud);
            sync_a.start().await;
            sync_b.start().await;
            sync_a.enable_upload().await;
            context.sleep(Duration::from_millis(50)).await;

            // A value too large to inline uploads as a piece.
            commit_value(&storage_a, b"k", &[5u8; 100]).await;
            context.sleep(Duration::from_millis(100)).await;
            assert_eq!(storage_a.heads(), storage_b.heads());

            // Device B fetches the value piece lazily through its delegate.
            let head = storage_b.heads()[0];
            let commit = storage_b.get_commit(&head).await.unwrap();
            let contents = storage_b.get_commit_contents(&commit).await.unwrap();
            assert_eq!(contents.len(), 1);
            let value = storage_b
                .get_object(&contents[0].value, ObjectLocation::ValueFromNetwork)
                .await
                .unwrap();
            assert_eq!(value, Bytes::from(vec![5u8; 100]));
        });
    }
}

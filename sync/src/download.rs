//! Download direction: applies remote commits, objects, and diffs locally.

use crate::{
    backoff::Backoff,
    batch::{self, BatchError},
    cloud::{CloudError, CommitPack, PageCloud, PositionToken, WatcherEvent},
    diff::{decode_entry_payload, normalize_diff},
    state::DownloadSyncState,
    POSITION_TOKEN_KEY,
};
use bytes::Bytes;
use commonware_macros::select;
use commonware_runtime::{Clock, Handle, Metrics as RuntimeMetrics, Spawner};
use futures::{
    channel::{mpsc, oneshot},
    future::{self, BoxFuture, Either},
    stream::FuturesUnordered,
    SinkExt, StreamExt,
};
use pagestore_storage::{
    db::Db, encryption::EncryptionService, ChangeOperation, CommitId, Entry, EntryChange,
    Error as StorageError, ObjectIdentifier, ObjectIdentifierFactory, PageStorage, TreeDiff,
};
use prometheus_client::metrics::counter::Counter;
use std::{collections::HashMap, sync::Arc, time::SystemTime};
use tracing::{debug, warn};

/// Messages accepted by the download actor.
pub(crate) enum Message {
    /// Begin the backlog download and watcher registration.
    Start,
    /// Lazy object fetch on behalf of storage.
    GetObject {
        identifier: ObjectIdentifier,
        response: oneshot::Sender<Result<Bytes, StorageError>>,
    },
    /// Diff fetch on behalf of storage.
    GetDiff {
        commit_id: CommitId,
        bases: Vec<CommitId>,
        response: oneshot::Sender<Result<TreeDiff, StorageError>>,
    },
}

/// Handle for sending messages to the download actor.
#[derive(Clone)]
pub(crate) struct Mailbox {
    sender: mpsc::Sender<Message>,
}

impl Mailbox {
    pub(crate) async fn start(&mut self) {
        let _ = self.sender.send(Message::Start).await;
    }

    pub(crate) async fn get_object(
        &mut self,
        identifier: ObjectIdentifier,
        response: oneshot::Sender<Result<Bytes, StorageError>>,
    ) {
        let _ = self
            .sender
            .send(Message::GetObject {
                identifier,
                response,
            })
            .await;
    }

    pub(crate) async fn get_diff(
        &mut self,
        commit_id: CommitId,
        bases: Vec<CommitId>,
        response: oneshot::Sender<Result<TreeDiff, StorageError>>,
    ) {
        let _ = self
            .sender
            .send(Message::GetDiff {
                commit_id,
                bases,
                response,
            })
            .await;
    }
}

enum TaskOutput {
    Backlog(Result<(), BatchError>),
    Watcher(Result<mpsc::UnboundedReceiver<WatcherEvent>, CloudError>),
    Batch(Result<usize, BatchError>),
}

enum Wake {
    Message(Option<Message>),
    Watcher(Option<WatcherEvent>),
    Task(Option<TaskOutput>),
    FetchDone,
    Retry,
}

#[derive(Default)]
struct Metrics {
    batches: Counter,
    retries: Counter,
    fetches: Counter,
}

impl Metrics {
    fn init<E: RuntimeMetrics>(context: &E) -> Self {
        let metrics = Self::default();
        context.register(
            "batches",
            "Download batches applied",
            metrics.batches.clone(),
        );
        context.register(
            "retries",
            "Download restarts after a temporary error",
            metrics.retries.clone(),
        );
        context.register(
            "fetches",
            "Object and diff fetches served for storage",
            metrics.fetches.clone(),
        );
        metrics
    }
}

/// The download state machine.
///
/// Startup downloads the backlog (everything after the persisted position token),
/// then registers a live watcher. Push notifications arriving while a batch is in
/// flight coalesce into exactly one follow-up batch. In-flight object and diff
/// fetches keep the externally-visible state at in-progress even when the commit
/// pipeline is idle.
pub(crate) struct Actor<E, D, S, C, B>
where
    E: Clock + Spawner + RuntimeMetrics,
    D: Db,
    S: EncryptionService,
    C: PageCloud,
    B: Backoff,
{
    context: E,
    storage: Arc<PageStorage<E, D, S>>,
    cloud: C,
    backoff: B,
    mailbox: mpsc::Receiver<Message>,
    states: mpsc::UnboundedSender<DownloadSyncState>,
    commit_state: DownloadSyncState,
    reported: DownloadSyncState,
    watcher: Option<mpsc::UnboundedReceiver<WatcherEvent>>,
    tasks: FuturesUnordered<BoxFuture<'static, TaskOutput>>,
    queued: Option<(CommitPack, PositionToken)>,
    retry_deadline: Option<SystemTime>,
    fetches: FuturesUnordered<BoxFuture<'static, ()>>,
    current_get_calls: usize,
    metrics: Metrics,
}

impl<E, D, S, C, B> Actor<E, D, S, C, B>
where
    E: Clock + Spawner + RuntimeMetrics,
    D: Db,
    S: EncryptionService,
    C: PageCloud,
    B: Backoff,
{
    pub(crate) fn new(
        context: E,
        storage: Arc<PageStorage<E, D, S>>,
        cloud: C,
        backoff: B,
    ) -> (Self, Mailbox, mpsc::UnboundedReceiver<DownloadSyncState>) {
        let (sender, mailbox) = mpsc::channel(64);
        let (states, states_rx) = mpsc::unbounded();
        let metrics = Metrics::init(&context);
        (
            Self {
                context,
                storage,
                cloud,
                backoff,
                mailbox,
                states,
                commit_state: DownloadSyncState::NotStarted,
                reported: DownloadSyncState::NotStarted,
                watcher: None,
                tasks: FuturesUnordered::new(),
                queued: None,
                retry_deadline: None,
                fetches: FuturesUnordered::new(),
                current_get_calls: 0,
                metrics,
            },
            Mailbox { sender },
            states_rx,
        )
    }

    /// Run the actor on its own task.
    pub(crate) fn start(self) -> Handle<()> {
        self.context.clone().spawn(|_| self.run())
    }

    async fn run(mut self) {
        loop {
            let task_done = if self.tasks.is_empty() {
                Either::Right(future::pending())
            } else {
                Either::Left(self.tasks.next())
            };
            let fetch_done = if self.fetches.is_empty() {
                Either::Right(future::pending())
            } else {
                Either::Left(self.fetches.next())
            };
            let watcher_event = match &mut self.watcher {
                Some(receiver) => Either::Left(receiver.next()),
                None => Either::Right(future::pending()),
            };
            let retry = match self.retry_deadline {
                Some(deadline) => Either::Left(self.context.sleep_until(deadline)),
                None => Either::Right(future::pending()),
            };

            let wake;
            select! {
                msg = self.mailbox.next() => {
                    wake = Wake::Message(msg);
                },
                event = watcher_event => {
                    wake = Wake::Watcher(event);
                },
                output = task_done => {
                    wake = Wake::Task(output);
                },
                _ = fetch_done => {
                    wake = Wake::FetchDone;
                },
                _ = retry => {
                    wake = Wake::Retry;
                },
            }

            match wake {
                Wake::Message(None) => return,
                Wake::Message(Some(Message::Start)) => {
                    if self.commit_state == DownloadSyncState::NotStarted {
                        self.start_backlog();
                    }
                }
                Wake::Message(Some(Message::GetObject {
                    identifier,
                    response,
                })) => self.handle_get_object(identifier, response),
                Wake::Message(Some(Message::GetDiff {
                    commit_id,
                    bases,
                    response,
                })) => self.handle_get_diff(commit_id, bases, response),
                Wake::Watcher(Some(WatcherEvent::NewCommits { pack, token })) => {
                    if self.tasks.is_empty() {
                        self.start_batch(pack, token);
                    } else {
                        // Coalesce into exactly one follow-up batch.
                        match &mut self.queued {
                            Some((queued_pack, queued_token)) => {
                                queued_pack.commits.extend(pack.commits);
                                *queued_token = token;
                            }
                            None => self.queued = Some((pack, token)),
                        }
                    }
                }
                Wake::Watcher(Some(WatcherEvent::Error(err))) => {
                    self.watcher = None;
                    self.handle_cloud_error(err);
                }
                Wake::Watcher(None) => {
                    // The connection dropped; its liveness signal is the disconnect.
                    self.watcher = None;
                    self.handle_cloud_error(CloudError::Network);
                }
                Wake::Task(None) => {}
                Wake::Task(Some(TaskOutput::Backlog(Ok(())))) => {
                    self.set_commit_state(DownloadSyncState::SettingRemoteWatcher);
                    self.start_set_watcher();
                }
                Wake::Task(Some(TaskOutput::Backlog(Err(err)))) => self.handle_batch_error(err),
                Wake::Task(Some(TaskOutput::Watcher(Ok(receiver)))) => {
                    self.watcher = Some(receiver);
                    self.backoff.reset();
                    self.set_commit_state(DownloadSyncState::Idle);
                }
                Wake::Task(Some(TaskOutput::Watcher(Err(err)))) => self.handle_cloud_error(err),
                Wake::Task(Some(TaskOutput::Batch(Ok(_)))) => {
                    self.backoff.reset();
                    self.metrics.batches.inc();
                    match self.queued.take() {
                        Some((pack, token)) => self.start_batch(pack, token),
                        None => self.set_commit_state(DownloadSyncState::Idle),
                    }
                }
                Wake::Task(Some(TaskOutput::Batch(Err(err)))) => self.handle_batch_error(err),
                Wake::FetchDone => {
                    self.current_get_calls = self.current_get_calls.saturating_sub(1);
                    self.report_state();
                }
                Wake::Retry => {
                    self.retry_deadline = None;
                    if self.commit_state == DownloadSyncState::TemporaryError {
                        self.start_backlog();
                    }
                }
            }
        }
    }

    /// Fetch everything after the persisted position token and apply it.
    fn start_backlog(&mut self) {
        self.set_commit_state(DownloadSyncState::Backlog);
        let storage = self.storage.clone();
        let cloud = self.cloud.clone();
        self.tasks.push(Box::pin(async move {
            TaskOutput::Backlog(run_backlog(storage, cloud).await)
        }));
    }

    /// Register the live watcher, re-reading the token in case the backlog advanced it.
    fn start_set_watcher(&mut self) {
        let storage = self.storage.clone();
        let cloud = self.cloud.clone();
        self.tasks.push(Box::pin(async move {
            let token = match storage.get_sync_metadata(POSITION_TOKEN_KEY).await {
                Ok(token) => token.map(PositionToken),
                Err(err) => {
                    warn!(?err, "failed to read position token");
                    None
                }
            };
            TaskOutput::Watcher(cloud.set_watcher(token).await)
        }));
    }

    fn start_batch(&mut self, pack: CommitPack, token: PositionToken) {
        self.set_commit_state(DownloadSyncState::InProgress);
        let storage = self.storage.clone();
        self.tasks.push(Box::pin(async move {
            TaskOutput::Batch(batch::download_batch(storage, pack, token).await)
        }));
    }

    fn handle_batch_error(&mut self, err: BatchError) {
        match err {
            BatchError::Temporary(err) => self.handle_cloud_error(err),
            BatchError::Permanent(reason) => {
                warn!(%reason, "download stopped permanently");
                self.watcher = None;
                self.queued = None;
                self.set_commit_state(DownloadSyncState::PermanentError);
            }
        }
    }

    fn handle_cloud_error(&mut self, err: CloudError) {
        if self.commit_state == DownloadSyncState::PermanentError {
            return;
        }
        if err.is_temporary() {
            warn!(?err, "download interrupted; backing off");
            self.metrics.retries.inc();
            self.watcher = None;
            self.queued = None;
            self.set_commit_state(DownloadSyncState::TemporaryError);
            self.retry_deadline = Some(self.context.current() + self.backoff.next());
        } else {
            warn!(?err, "download stopped permanently");
            self.watcher = None;
            self.queued = None;
            self.set_commit_state(DownloadSyncState::PermanentError);
        }
    }

    fn handle_get_object(
        &mut self,
        identifier: ObjectIdentifier,
        response: oneshot::Sender<Result<Bytes, StorageError>>,
    ) {
        if self.commit_state == DownloadSyncState::PermanentError {
            let _ = response.send(Err(StorageError::Network(
                "sync stopped permanently".to_string(),
            )));
            return;
        }
        self.current_get_calls += 1;
        self.metrics.fetches.inc();
        let cloud = self.cloud.clone();
        let encryption = self.storage.encryption().clone();
        self.fetches.push(Box::pin(async move {
            let result = fetch_object(cloud, encryption, identifier).await;
            let _ = response.send(result);
        }));
        self.report_state();
    }

    fn handle_get_diff(
        &mut self,
        commit_id: CommitId,
        bases: Vec<CommitId>,
        response: oneshot::Sender<Result<TreeDiff, StorageError>>,
    ) {
        if self.commit_state == DownloadSyncState::PermanentError {
            let _ = response.send(Err(StorageError::Network(
                "sync stopped permanently".to_string(),
            )));
            return;
        }
        self.current_get_calls += 1;
        self.metrics.fetches.inc();
        let cloud = self.cloud.clone();
        let encryption = self.storage.encryption().clone();
        let factory = self.storage.object_factory().clone();
        self.fetches.push(Box::pin(async move {
            let result = fetch_diff(cloud, encryption, factory, commit_id, bases).await;
            let _ = response.send(result);
        }));
        self.report_state();
    }

    fn set_commit_state(&mut self, state: DownloadSyncState) {
        if self.commit_state != state {
            debug!(from = %self.commit_state, to = %state, "download state");
            self.commit_state = state;
        }
        self.report_state();
    }

    /// Merge the commit pipeline state with in-flight fetches and notify on change.
    fn report_state(&mut self) {
        let merged = if self.commit_state == DownloadSyncState::Idle && self.current_get_calls > 0
        {
            DownloadSyncState::InProgress
        } else {
            self.commit_state
        };
        if merged != self.reported {
            self.reported = merged;
            let _ = self.states.unbounded_send(merged);
        }
    }
}

async fn run_backlog<E, D, S, C>(
    storage: Arc<PageStorage<E, D, S>>,
    cloud: C,
) -> Result<(), BatchError>
where
    E: Clock + Spawner + RuntimeMetrics,
    D: Db,
    S: EncryptionService,
    C: PageCloud,
{
    let token = storage
        .get_sync_metadata(POSITION_TOKEN_KEY)
        .await
        .map_err(|err| BatchError::Permanent(err.to_string()))?
        .map(PositionToken);
    let (pack, next) = match cloud.get_commits(token).await {
        Ok(result) => result,
        Err(err) if err.is_temporary() => return Err(BatchError::Temporary(err)),
        Err(err) => return Err(BatchError::Permanent(err.to_string())),
    };
    let Some(pack) = pack else {
        return Ok(());
    };
    batch::download_batch(storage, pack, next).await?;
    Ok(())
}

async fn fetch_object<C: PageCloud, S: EncryptionService>(
    cloud: C,
    encryption: S,
    identifier: ObjectIdentifier,
) -> Result<Bytes, StorageError> {
    let name = encryption.get_object_name(identifier.digest()).await?;
    let encrypted = cloud
        .get_object(name)
        .await
        .map_err(|err| StorageError::Network(err.to_string()))?;
    encryption
        .decrypt_object(identifier.key_index(), encrypted)
        .await
}

async fn fetch_diff<C: PageCloud, S: EncryptionService>(
    cloud: C,
    encryption: S,
    factory: ObjectIdentifierFactory,
    commit_id: CommitId,
    bases: Vec<CommitId>,
) -> Result<TreeDiff, StorageError> {
    let remote_id = encryption.encode_commit_id(&commit_id).await?;
    let mut base_ids = HashMap::new();
    let mut remote_bases = Vec::with_capacity(bases.len());
    for base in &bases {
        let remote = encryption.encode_commit_id(base).await?;
        base_ids.insert(remote.clone(), *base);
        remote_bases.push(remote);
    }
    let pack = cloud
        .get_diff(remote_id, remote_bases)
        .await
        .map_err(|err| match err {
            CloudError::Network | CloudError::Auth => StorageError::Network(err.to_string()),
            CloudError::NotSupported => StorageError::DiffNotSupported,
            other => StorageError::DataIntegrity(format!("diff fetch failed: {other}")),
        })?;
    let Some(base) = base_ids.get(&pack.base).copied() else {
        return Err(StorageError::DataIntegrity(
            "diff base was not among the offered bases".to_string(),
        ));
    };
    let entries = normalize_diff(pack.entries)
        .map_err(|err| StorageError::DataIntegrity(err.to_string()))?;
    let mut changes = Vec::with_capacity(entries.len());
    for entry in entries {
        let payload = encryption.decrypt_entry_payload(entry.payload).await?;
        let (value, priority) = decode_entry_payload(&payload, &factory)
            .map_err(|err| StorageError::DataIntegrity(format!("malformed diff entry: {err}")))?;
        let operation = match entry.operation {
            crate::cloud::DiffOperation::Insertion => ChangeOperation::Insertion,
            crate::cloud::DiffOperation::Deletion => ChangeOperation::Deletion,
        };
        changes.push(EntryChange {
            operation,
            entry: Entry {
                key: entry.key,
                value,
                priority,
                entry_id: entry.entry_id,
            },
        });
    }
    Ok(TreeDiff { base, changes })
}

//! Upload direction: pushes unsynced local commits and objects to the cloud.

use crate::{
    backoff::Backoff,
    batch::{self, BatchError},
    cloud::{CloudError, PageCloud},
    state::UploadSyncState,
    Error,
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
    db::Db, encryption::EncryptionService, ChangeSource, CommitEvent, PageStorage,
};
use prometheus_client::metrics::counter::Counter;
use std::{sync::Arc, time::SystemTime};
use tracing::{debug, warn};

/// Messages accepted by the upload actor.
pub(crate) enum Message {
    /// Enable upload, or nudge an enabled-but-idle upload to re-check for work.
    Enable,
    /// The download direction became idle (or busy).
    SetDownloadIdle(bool),
    /// Merge causal metadata with the cloud.
    UpdateClock {
        clock: Bytes,
        response: oneshot::Sender<Result<Bytes, Error>>,
    },
}

/// Handle for sending messages to the upload actor.
#[derive(Clone)]
pub(crate) struct Mailbox {
    sender: mpsc::Sender<Message>,
}

impl Mailbox {
    pub(crate) async fn enable(&mut self) {
        let _ = self.sender.send(Message::Enable).await;
    }

    pub(crate) async fn set_download_idle(&mut self, idle: bool) {
        let _ = self.sender.send(Message::SetDownloadIdle(idle)).await;
    }

    pub(crate) async fn update_clock(
        &mut self,
        clock: Bytes,
        response: oneshot::Sender<Result<Bytes, Error>>,
    ) {
        // If the actor is gone, the dropped responder signals the caller.
        let _ = self
            .sender
            .send(Message::UpdateClock { clock, response })
            .await;
    }
}

enum Wake {
    Message(Option<Message>),
    Commits(Option<CommitEvent>),
    BatchDone(Option<Result<(), BatchError>>),
    ClockDone(Option<Result<Bytes, CloudError>>),
    Retry,
}

#[derive(Default)]
struct Metrics {
    batches: Counter,
    retries: Counter,
    clock_updates: Counter,
}

impl Metrics {
    fn init<E: RuntimeMetrics>(context: &E) -> Self {
        let metrics = Self::default();
        context.register(
            "batches",
            "Upload batches completed",
            metrics.batches.clone(),
        );
        context.register(
            "retries",
            "Upload batches retried after a temporary error",
            metrics.retries.clone(),
        );
        context.register(
            "clock_updates",
            "Clock uploads sent to the cloud",
            metrics.clock_updates.clone(),
        );
        metrics
    }
}

/// The upload state machine.
///
/// At most one batch is in flight; a local commit arriving mid-batch simply causes a
/// re-query once the batch completes, which also drops commits that became synced via
/// a concurrent remote notification. Upload holds while the download direction is not
/// idle and while the page has more than one head (an unresolved local conflict).
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
    commit_events: mpsc::UnboundedReceiver<CommitEvent>,
    states: mpsc::UnboundedSender<UploadSyncState>,
    state: UploadSyncState,
    enabled: bool,
    download_idle: bool,
    batches: FuturesUnordered<BoxFuture<'static, Result<(), BatchError>>>,
    retry_deadline: Option<SystemTime>,
    clock_requests: FuturesUnordered<BoxFuture<'static, Result<Bytes, CloudError>>>,
    clock_responders: Vec<oneshot::Sender<Result<Bytes, Error>>>,
    pending_clock: Option<(Bytes, Vec<oneshot::Sender<Result<Bytes, Error>>>)>,
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
    ) -> (Self, Mailbox, mpsc::UnboundedReceiver<UploadSyncState>) {
        let (sender, mailbox) = mpsc::channel(64);
        let (states, states_rx) = mpsc::unbounded();
        let commit_events = storage.register_commit_watcher();
        let metrics = Metrics::init(&context);
        (
            Self {
                context,
                storage,
                cloud,
                backoff,
                mailbox,
                commit_events,
                states,
                state: UploadSyncState::NotStarted,
                enabled: false,
                download_idle: false,
                batches: FuturesUnordered::new(),
                retry_deadline: None,
                clock_requests: FuturesUnordered::new(),
                clock_responders: Vec::new(),
                pending_clock: None,
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
            let batch_done = if self.batches.is_empty() {
                Either::Right(future::pending())
            } else {
                Either::Left(self.batches.next())
            };
            let clock_done = if self.clock_requests.is_empty() {
                Either::Right(future::pending())
            } else {
                Either::Left(self.clock_requests.next())
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
                event = self.commit_events.next() => {
                    wake = Wake::Commits(event);
                },
                result = batch_done => {
                    wake = Wake::BatchDone(result);
                },
                result = clock_done => {
                    wake = Wake::ClockDone(result);
                },
                _ = retry => {
                    wake = Wake::Retry;
                },
            }

            match wake {
                Wake::Message(None) => return,
                Wake::Message(Some(Message::Enable)) => {
                    self.enabled = true;
                    self.maybe_start().await;
                }
                Wake::Message(Some(Message::SetDownloadIdle(idle))) => {
                    self.download_idle = idle;
                    if idle {
                        self.maybe_start().await;
                    } else if self.enabled
                        && self.batches.is_empty()
                        && self.retry_deadline.is_none()
                        && self.state != UploadSyncState::PermanentError
                    {
                        self.set_state(UploadSyncState::WaitRemoteDownload);
                    }
                }
                Wake::Message(Some(Message::UpdateClock { clock, response })) => {
                    self.handle_update_clock(clock, response);
                }
                Wake::Commits(None) => return,
                Wake::Commits(Some((commits, source))) => {
                    // Remote commits are echoes of the download direction; only local
                    // ones create upload work. A batch already in flight re-queries on
                    // completion, so there is nothing to do here in that case.
                    if source == ChangeSource::Local
                        && !commits.is_empty()
                        && self.batches.is_empty()
                    {
                        self.maybe_start().await;
                    }
                }
                Wake::BatchDone(None) => {}
                Wake::BatchDone(Some(Ok(()))) => {
                    self.backoff.reset();
                    self.metrics.batches.inc();
                    self.maybe_start().await;
                }
                Wake::BatchDone(Some(Err(BatchError::Temporary(err)))) => {
                    warn!(?err, "upload batch failed; backing off");
                    self.metrics.retries.inc();
                    self.set_state(UploadSyncState::TemporaryError);
                    self.retry_deadline = Some(self.context.current() + self.backoff.next());
                }
                Wake::BatchDone(Some(Err(BatchError::Permanent(reason)))) => {
                    warn!(%reason, "upload stopped permanently");
                    self.set_state(UploadSyncState::PermanentError);
                }
                Wake::ClockDone(None) => {}
                Wake::ClockDone(Some(result)) => self.finish_clock(result),
                Wake::Retry => {
                    self.retry_deadline = None;
                    self.maybe_start().await;
                }
            }
        }
    }

    /// Start a batch if upload is enabled and nothing holds it back.
    async fn maybe_start(&mut self) {
        if !self.enabled
            || !self.batches.is_empty()
            || self.retry_deadline.is_some()
            || self.state == UploadSyncState::PermanentError
        {
            return;
        }
        if !self.download_idle {
            self.set_state(UploadSyncState::WaitRemoteDownload);
            return;
        }
        if self.storage.heads().len() > 1 {
            // Wait for a merge to resolve the local conflict.
            self.set_state(UploadSyncState::Pending);
            return;
        }
        // Re-query immediately before building the batch: commits may have become
        // synced via a concurrently-received remote notification.
        let commits = match self.storage.get_unsynced_commits().await {
            Ok(commits) => commits,
            Err(err) => {
                warn!(?err, "failed to query unsynced commits");
                self.set_state(UploadSyncState::PermanentError);
                return;
            }
        };
        if commits.is_empty() {
            self.set_state(UploadSyncState::Idle);
            return;
        }
        debug!(commits = commits.len(), "starting upload batch");
        self.set_state(UploadSyncState::InProgress);
        let storage = self.storage.clone();
        let cloud = self.cloud.clone();
        self.batches
            .push(Box::pin(batch::upload_batch(storage, cloud, commits)));
    }

    /// Rate-limit clock uploads to one in flight; later calls queue, coalescing to the
    /// latest value, and all queued callbacks resolve with the follow-up request.
    fn handle_update_clock(
        &mut self,
        clock: Bytes,
        response: oneshot::Sender<Result<Bytes, Error>>,
    ) {
        if !self.clock_requests.is_empty() {
            match &mut self.pending_clock {
                Some((value, responders)) => {
                    *value = clock;
                    responders.push(response);
                }
                None => self.pending_clock = Some((clock, vec![response])),
            }
            return;
        }
        self.clock_responders.push(response);
        self.metrics.clock_updates.inc();
        let cloud = self.cloud.clone();
        self.clock_requests
            .push(Box::pin(async move { cloud.update_clock(clock).await }));
    }

    fn finish_clock(&mut self, result: Result<Bytes, CloudError>) {
        for responder in std::mem::take(&mut self.clock_responders) {
            let _ = responder.send(result.clone().map_err(Error::Cloud));
        }
        if let Some((clock, responders)) = self.pending_clock.take() {
            self.clock_responders = responders;
            self.metrics.clock_updates.inc();
            let cloud = self.cloud.clone();
            self.clock_requests
                .push(Box::pin(async move { cloud.update_clock(clock).await }));
        }
    }

    fn set_state(&mut self, state: UploadSyncState) {
        if self.state == state {
            return;
        }
        debug!(from = %self.state, to = %state, "upload state");
        self.state = state;
        let _ = self.states.unbounded_send(state);
    }
}

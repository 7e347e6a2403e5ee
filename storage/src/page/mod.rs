//! The page store: journal commits, synced-commit ingestion, object resolution, and
//! garbage collection over one page's commit DAG.

use crate::{
    commit::{peek_root, ChangeSource, Commit, CommitData, CommitFactory, CommitId, LiveCommitTracker},
    db::{Batch, Db},
    encryption::EncryptionService,
    journal::{Journal, JournalChange},
    object::{ObjectDigest, ObjectIdentifier, ObjectIdentifierFactory, Priority},
    pruner::{CommitPruningPolicy, Pruner},
    tree::{self, Entry, TreeDiff},
    Error,
};
use bytes::Bytes;
use commonware_codec::{Read as CodecRead, ReadExt, Write as CodecWrite};
use commonware_runtime::{Clock, Metrics as RuntimeMetrics, Spawner};
use futures::{channel::mpsc, future::BoxFuture, StreamExt};
use prometheus_client::metrics::counter::Counter;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::UNIX_EPOCH,
};
use tracing::{debug, warn};

pub(crate) mod keys;

/// When unreferenced pieces are collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPolicy {
    /// Never collect automatically; [PageStorage::delete_object] remains available.
    Never,
    /// Collect a piece as soon as its last live identifier drops and nothing on disk
    /// points at it. Roots of synced commits are not pinned beyond their own liveness:
    /// once a commit is synced, its parents' roots stop being protected.
    EagerLiveReferences,
}

/// Page store construction knobs.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub gc_policy: GcPolicy,
    pub pruning_policy: CommitPruningPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gc_policy: GcPolicy::EagerLiveReferences,
            pruning_policy: CommitPruningPolicy::LocalImmediate,
        }
    }
}

/// Where [PageStorage::get_object] is allowed to look.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectLocation {
    /// Local store only.
    Local,
    /// Local store, then the sync delegate's object fetch.
    ValueFromNetwork,
    /// Local store, then diff-based retrieval tied to the given commit.
    TreeNodeFromNetwork(CommitId),
}

/// Outcome of a garbage-collection attempt.
#[derive(Debug)]
pub enum GcOutcome {
    /// The piece was removed; the returned references are candidates for collection.
    Deleted(Vec<(ObjectDigest, Priority)>),
    /// A live reference, pending transaction, or on-disk pointer blocked deletion.
    /// Expected under racing reads; callers simply retry later.
    Canceled,
}

/// A commit id together with its plaintext storage bytes, as delivered by sync.
#[derive(Debug, Clone)]
pub struct CommitIdAndBytes {
    pub id: CommitId,
    pub bytes: Bytes,
}

/// Batch of commits delivered to watchers, with provenance.
pub type CommitEvent = (Vec<Arc<Commit>>, ChangeSource);

/// Lazy-fetch surface implemented by the cloud synchronizer.
///
/// Futures are `'static`: implementations clone whatever channel they need into the
/// returned future, so a delegate call survives the caller dropping its borrow.
pub trait PageSyncDelegate: Send + Sync + 'static {
    /// Fetch the piece addressed by `identifier` from the cloud.
    fn get_object(&self, identifier: ObjectIdentifier) -> BoxFuture<'static, Result<Bytes, Error>>;

    /// Fetch a diff reconstructing the tree of `commit_id` from one of the `bases`
    /// commits, whose trees are available locally.
    fn get_diff(
        &self,
        commit_id: CommitId,
        bases: Vec<CommitId>,
    ) -> BoxFuture<'static, Result<TreeDiff, Error>>;

    /// Upload causal metadata, returning the cloud-merged clock.
    fn update_clock(&self, clock: Bytes) -> BoxFuture<'static, Result<Bytes, Error>>;
}

#[derive(Default)]
struct StorageMetrics {
    commits_local: Counter,
    commits_synced: Counter,
    objects_added: Counter,
    objects_collected: Counter,
    commits_pruned: Counter,
}

impl StorageMetrics {
    fn init<E: RuntimeMetrics>(context: &E) -> Self {
        let metrics = Self::default();
        context.register(
            "commits_local",
            "Commits created by local journals",
            metrics.commits_local.clone(),
        );
        context.register(
            "commits_synced",
            "Commits applied from the cloud",
            metrics.commits_synced.clone(),
        );
        context.register(
            "objects_added",
            "Pieces written to the local store",
            metrics.objects_added.clone(),
        );
        context.register(
            "objects_collected",
            "Pieces removed by garbage collection",
            metrics.objects_collected.clone(),
        );
        context.register(
            "commits_pruned",
            "Commits removed by the pruner",
            metrics.commits_pruned.clone(),
        );
        metrics
    }
}

/// The object and commit store of one page.
pub struct PageStorage<E: Clock + Spawner + RuntimeMetrics, D: Db, S: EncryptionService> {
    context: E,
    db: D,
    encryption: S,
    objects: ObjectIdentifierFactory,
    commits: CommitFactory,
    gc_policy: GcPolicy,
    // Serializes tree rebuilds and head-set updates across commit_journal and
    // add_commits_from_sync.
    commit_lock: futures::lock::Mutex<()>,
    // Head commits held live; keys mirror the tracker's head set.
    heads: Mutex<HashMap<CommitId, Arc<Commit>>>,
    watchers: Mutex<Vec<mpsc::UnboundedSender<CommitEvent>>>,
    delegate: Mutex<Option<Arc<dyn PageSyncDelegate>>>,
    // Feeds digests to the collector task; present under eager collection.
    gc_tx: Option<mpsc::UnboundedSender<ObjectDigest>>,
    pruner: Mutex<Option<Pruner<E, D, S>>>,
    metrics: StorageMetrics,
}

impl<E: Clock + Spawner + RuntimeMetrics, D: Db, S: EncryptionService> PageStorage<E, D, S> {
    /// Open the page, creating the sentinel root commit if the store is empty.
    pub async fn init(context: E, config: Config, db: D, encryption: S) -> Result<Arc<Self>, Error> {
        let tracker = LiveCommitTracker::new();
        let commits = CommitFactory::new(tracker);
        let objects = ObjectIdentifierFactory::new();
        let metrics = StorageMetrics::init(&context);

        let (gc_tx, gc_rx) = match config.gc_policy {
            GcPolicy::EagerLiveReferences => {
                let (tx, rx) = mpsc::unbounded();
                objects.set_untracked_channel(tx.clone());
                (Some(tx), Some(rx))
            }
            GcPolicy::Never => (None, None),
        };

        let storage = Arc::new(Self {
            context,
            db,
            encryption,
            objects,
            commits,
            gc_policy: config.gc_policy,
            commit_lock: futures::lock::Mutex::new(()),
            heads: Mutex::new(HashMap::new()),
            watchers: Mutex::new(Vec::new()),
            delegate: Mutex::new(None),
            gc_tx,
            pruner: Mutex::new(None),
            metrics,
        });

        // Load existing heads, or create the sentinel root commit of an empty page.
        let head_rows = storage.db.get_by_prefix(keys::HEADS).await?;
        if head_rows.is_empty() {
            let node = tree::encode_node(&[]);
            let digest = ObjectDigest::hash_of(&node);
            let root_identifier = storage
                .objects
                .make_identifier(storage.encryption.key_index(), digest.clone());
            let commit = storage.commits.root(root_identifier.clone());
            let encrypted_commit = storage
                .encryption
                .encrypt_commit(commit.storage_bytes().into())
                .await?;
            let name = storage.encryption.get_object_name(&digest).await?;
            let encrypted_node = storage
                .encryption
                .encrypt_object(root_identifier.key_index(), node.into())
                .await?;
            let mut batch = Batch::new();
            batch.put(keys::object(&name), encrypted_node);
            batch.put(keys::commit(commit.id()), encrypted_commit);
            batch.put(keys::commit_ref(&digest, commit.id()), Bytes::new());
            batch.put(
                keys::head(commit.id()),
                Bytes::copy_from_slice(&commit.timestamp().to_be_bytes()),
            );
            storage.db.apply(batch).await?;
            storage
                .commits
                .tracker()
                .add_heads([(commit.timestamp(), *commit.id())]);
            storage.heads.lock().unwrap().insert(*commit.id(), commit);
        } else {
            for (key, _) in head_rows {
                let id = <[u8; 32]>::try_from(&key[keys::HEADS.len()..])
                    .map(CommitId::from)
                    .map_err(|_| Error::DataIntegrity("malformed head row".to_string()))?;
                let commit = storage.load_commit(&id).await?;
                storage
                    .commits
                    .tracker()
                    .add_heads([(commit.timestamp(), id)]);
                storage.heads.lock().unwrap().insert(id, commit);
            }
        }

        // The collector drains digests whose last live identifier dropped.
        if let Some(mut gc_rx) = gc_rx {
            let weak = Arc::downgrade(&storage);
            storage
                .context
                .with_label("gc")
                .spawn(move |_| async move {
                    while let Some(digest) = gc_rx.next().await {
                        let Some(storage) = weak.upgrade() else {
                            return;
                        };
                        storage.collect(digest).await;
                    }
                });
        }

        // The pruner reacts to head-set changes.
        if config.pruning_policy == CommitPruningPolicy::LocalImmediate {
            let pruner = Pruner::new(
                storage.context.with_label("pruner"),
                Arc::downgrade(&storage),
            );
            *storage.pruner.lock().unwrap() = Some(pruner);
        }

        Ok(storage)
    }

    /// The live-commit tracker of this page.
    pub fn tracker(&self) -> &LiveCommitTracker {
        self.commits.tracker()
    }

    /// The identifier factory of this page.
    pub fn object_factory(&self) -> &ObjectIdentifierFactory {
        &self.objects
    }

    /// The encryption service of this page.
    pub fn encryption(&self) -> &S {
        &self.encryption
    }

    /// Current heads, ordered by (timestamp, id).
    pub fn heads(&self) -> Vec<CommitId> {
        self.tracker().heads()
    }

    /// Current head commits, ordered by (timestamp, id).
    pub fn head_commits(&self) -> Vec<Arc<Commit>> {
        let heads = self.heads.lock().unwrap();
        let mut commits: Vec<_> = heads.values().cloned().collect();
        commits.sort_by_key(|c| (c.timestamp(), *c.id()));
        commits
    }

    /// Register a watcher notified of every commit batch in creation order.
    pub fn register_commit_watcher(&self) -> mpsc::UnboundedReceiver<CommitEvent> {
        let (tx, rx) = mpsc::unbounded();
        self.watchers.lock().unwrap().push(tx);
        rx
    }

    /// Install (or clear) the lazy-fetch delegate.
    pub fn set_sync_delegate(&self, delegate: Option<Arc<dyn PageSyncDelegate>>) {
        *self.delegate.lock().unwrap() = delegate;
    }

    /// Begin a journal with a single parent.
    pub async fn start_commit(&self, parent: &CommitId) -> Result<Journal, Error> {
        let parent = self.get_commit(parent).await?;
        Ok(Journal::new(vec![parent]))
    }

    /// Begin a merge journal over two parents.
    pub async fn start_merge_commit(
        &self,
        left: &CommitId,
        right: &CommitId,
    ) -> Result<Journal, Error> {
        let left = self.get_commit(left).await?;
        let right = self.get_commit(right).await?;
        Ok(Journal::new(vec![left, right]))
    }

    /// Store a value, returning its identifier. Values at most
    /// [crate::object::MAX_INLINE_SIZE] bytes stay inline and never touch the store.
    pub async fn add_object(&self, content: Bytes) -> Result<ObjectIdentifier, Error> {
        let digest = ObjectDigest::for_content(&content);
        let identifier = self
            .objects
            .make_identifier(self.encryption.key_index(), digest.clone());
        if digest.is_inlined() {
            return Ok(identifier);
        }
        let name = self.encryption.get_object_name(&digest).await?;
        if self.db.has_key(&keys::object(&name)).await? {
            return Ok(identifier);
        }
        let encrypted = self
            .encryption
            .encrypt_object(identifier.key_index(), content)
            .await?;
        let mut batch = Batch::new();
        batch.put(keys::object(&name), encrypted);
        batch.put(
            keys::unsynced_piece(&digest),
            Bytes::copy_from_slice(&identifier.key_index().to_be_bytes()),
        );
        self.db.apply(batch).await?;
        self.metrics.objects_added.inc();
        Ok(identifier)
    }

    /// Commit a journal, producing the new commit or `None` for a true no-op.
    pub async fn commit_journal(&self, journal: Journal) -> Result<Option<Arc<Commit>>, Error> {
        let _serializer = self.commit_lock.lock().await;
        let (parents, changes) = journal.into_parts();

        // Rebuild the tree from the first parent's root.
        let base_entries = self.read_node(parents[0].root()).await?;
        let entries = apply_journal(base_entries, &changes);
        let node = tree::encode_node(&entries);
        let digest = ObjectDigest::hash_of(&node);

        // A single-parent commit that does not change the root is a no-op.
        if parents.len() == 1 && parents[0].root().digest() == &digest {
            return Ok(None);
        }

        let root_identifier = self
            .objects
            .make_identifier(self.encryption.key_index(), digest.clone());

        // Hold the parents' roots live until the batch lands, so a racing collector
        // cannot remove them mid-commit.
        let _parent_roots: Vec<ObjectIdentifier> =
            parents.iter().map(|p| p.root().clone()).collect();

        let commit = self.commits.from_content_and_parents(
            self.now(),
            parents.clone(),
            root_identifier.clone(),
        );

        let mut batch = Batch::new();
        let name = self.encryption.get_object_name(&digest).await?;
        let encrypted_node = self
            .encryption
            .encrypt_object(root_identifier.key_index(), node.into())
            .await?;
        self.stage_node_piece(&mut batch, &digest, &name, encrypted_node, &entries, true);
        let encrypted_commit = self
            .encryption
            .encrypt_commit(commit.storage_bytes().into())
            .await?;
        batch.put(keys::commit(commit.id()), encrypted_commit);
        batch.put(
            keys::unsynced_commit(commit.id()),
            Bytes::copy_from_slice(&commit.generation().to_be_bytes()),
        );
        batch.put(keys::commit_ref(&digest, commit.id()), Bytes::new());
        let mut removed_heads = Vec::new();
        {
            let heads = self.heads.lock().unwrap();
            for parent in &parents {
                if heads.contains_key(parent.id()) {
                    removed_heads.push(*parent.id());
                    batch.delete(keys::head(parent.id()));
                }
            }
        }
        batch.put(
            keys::head(commit.id()),
            Bytes::copy_from_slice(&commit.timestamp().to_be_bytes()),
        );

        // An io failure aborts the whole commit: no head change, no notification.
        self.db.apply(batch).await?;

        self.tracker().remove_heads(&removed_heads);
        self.tracker()
            .add_heads([(commit.timestamp(), *commit.id())]);
        {
            let mut heads = self.heads.lock().unwrap();
            for id in &removed_heads {
                heads.remove(id);
            }
            heads.insert(*commit.id(), commit.clone());
        }
        self.metrics.commits_local.inc();
        self.notify_watchers(vec![commit.clone()], ChangeSource::Local);
        self.schedule_prune();
        Ok(Some(commit))
    }

    /// Apply a batch of commits delivered by sync, atomically.
    ///
    /// Commits must arrive in an order compatible with causality: a commit whose parent
    /// is neither stored nor earlier in the batch fails the whole batch with
    /// [Error::ParentNotFound] and nothing is applied. Re-delivered commits are
    /// idempotent; locally-known unsynced commits are marked synced instead of re-added.
    pub async fn add_commits_from_sync(
        &self,
        commits: Vec<CommitIdAndBytes>,
        source: ChangeSource,
    ) -> Result<(), Error> {
        let _serializer = self.commit_lock.lock().await;

        let mut seen: Vec<CommitId> = Vec::new();
        let mut to_add: Vec<(CommitIdAndBytes, CommitData)> = Vec::new();
        let mut newly_synced: Vec<CommitId> = Vec::new();
        for commit in commits {
            if seen.contains(&commit.id) {
                continue;
            }
            if self.db.has_key(&keys::commit(&commit.id)).await? {
                if self
                    .db
                    .has_key(&keys::unsynced_commit(&commit.id))
                    .await?
                {
                    newly_synced.push(commit.id);
                }
                continue;
            }
            let mut buf = commit.bytes.as_ref();
            let data = CommitData::read_cfg(&mut buf, &())?;
            if !buf.is_empty() {
                return Err(Error::DataIntegrity(format!(
                    "commit {} has trailing bytes",
                    commit.id
                )));
            }
            if data.id() != commit.id {
                return Err(Error::DataIntegrity(format!(
                    "commit {} does not match its content",
                    commit.id
                )));
            }
            for parent in &data.parents {
                if !seen.contains(parent) && !self.db.has_key(&keys::commit(parent)).await? {
                    return Err(Error::ParentNotFound(*parent));
                }
            }
            seen.push(commit.id);
            to_add.push((commit, data));
        }

        // Simulate head updates over the whole batch.
        let mut heads: HashMap<CommitId, u64> = {
            let current = self.heads.lock().unwrap();
            current
                .iter()
                .map(|(id, commit)| (*id, commit.timestamp()))
                .collect()
        };
        let original: Vec<CommitId> = heads.keys().copied().collect();
        for (commit, data) in &to_add {
            for parent in &data.parents {
                heads.remove(parent);
            }
            heads.insert(commit.id, data.timestamp);
        }

        let mut batch = Batch::new();
        for (commit, data) in &to_add {
            let encrypted = self
                .encryption
                .encrypt_commit(commit.bytes.clone())
                .await?;
            batch.put(keys::commit(&commit.id), encrypted);
            if !data.root_digest.is_inlined() {
                batch.put(keys::commit_ref(&data.root_digest, &commit.id), Bytes::new());
            }
        }
        for id in &newly_synced {
            batch.delete(keys::unsynced_commit(id));
        }
        let removed: Vec<CommitId> = original
            .iter()
            .filter(|id| !heads.contains_key(*id))
            .copied()
            .collect();
        for id in &removed {
            batch.delete(keys::head(id));
        }
        let added_heads: Vec<(u64, CommitId)> = heads
            .iter()
            .filter(|(id, _)| !original.contains(id))
            .map(|(id, timestamp)| (*timestamp, *id))
            .collect();
        for (timestamp, id) in &added_heads {
            batch.put(
                keys::head(id),
                Bytes::copy_from_slice(&timestamp.to_be_bytes()),
            );
        }
        if batch.is_empty() {
            return Ok(());
        }
        self.db.apply(batch).await?;

        // Materialize the applied commits and update in-memory state.
        let mut applied = Vec::with_capacity(to_add.len());
        for (commit, _) in &to_add {
            let materialized = self.commits.from_storage_bytes(
                commit.id,
                &commit.bytes,
                &self.objects,
                Vec::new(),
                true,
            )?;
            applied.push(materialized);
        }
        for id in &newly_synced {
            self.tracker().mark_synced(id);
        }
        self.tracker().remove_heads(&removed);
        self.tracker().add_heads(added_heads.iter().copied());
        {
            let mut head_map = self.heads.lock().unwrap();
            for id in &removed {
                head_map.remove(id);
            }
            for commit in &applied {
                if heads.contains_key(commit.id()) {
                    head_map.insert(*commit.id(), commit.clone());
                }
            }
        }
        self.metrics.commits_synced.inc_by(applied.len() as u64);
        if !applied.is_empty() {
            self.notify_watchers(applied, source);
        }
        self.schedule_prune();
        Ok(())
    }

    /// Load a commit by id.
    pub async fn get_commit(&self, id: &CommitId) -> Result<Arc<Commit>, Error> {
        self.load_commit(id).await
    }

    /// Whether the commit with `id` is stored.
    pub async fn has_commit(&self, id: &CommitId) -> Result<bool, Error> {
        Ok(self.db.has_key(&keys::commit(id)).await?)
    }

    /// Unsynced commits, ordered by generation.
    pub async fn get_unsynced_commits(&self) -> Result<Vec<Arc<Commit>>, Error> {
        let rows = self.db.get_by_prefix(keys::UNSYNCED_COMMITS).await?;
        let mut ids = Vec::with_capacity(rows.len());
        for (key, value) in rows {
            let id = <[u8; 32]>::try_from(&key[keys::UNSYNCED_COMMITS.len()..])
                .map(CommitId::from)
                .map_err(|_| Error::DataIntegrity("malformed unsynced commit row".to_string()))?;
            let generation = decode_u64(&value)?;
            ids.push((generation, id));
        }
        ids.sort();
        let mut commits = Vec::with_capacity(ids.len());
        for (_, id) in ids {
            commits.push(self.load_commit(&id).await?);
        }
        Ok(commits)
    }

    /// Mark a commit as synced.
    pub async fn mark_commit_synced(&self, id: &CommitId) -> Result<(), Error> {
        let mut batch = Batch::new();
        batch.delete(keys::unsynced_commit(id));
        self.db.apply(batch).await?;
        self.tracker().mark_synced(id);
        Ok(())
    }

    /// Identifiers of pieces written locally and not yet uploaded.
    pub async fn get_unsynced_pieces(&self) -> Result<Vec<ObjectIdentifier>, Error> {
        let rows = self.db.get_by_prefix(keys::UNSYNCED_PIECES).await?;
        let mut identifiers = Vec::with_capacity(rows.len());
        for (key, value) in rows {
            let mut digest_bytes = &key[keys::UNSYNCED_PIECES.len()..];
            let digest = ObjectDigest::read(&mut digest_bytes)?;
            let key_index = decode_u32(&value)?;
            identifiers.push(self.objects.make_identifier(key_index, digest));
        }
        Ok(identifiers)
    }

    /// Mark a piece as uploaded.
    pub async fn mark_piece_synced(&self, digest: &ObjectDigest) -> Result<(), Error> {
        let mut batch = Batch::new();
        batch.delete(keys::unsynced_piece(digest));
        self.db.apply(batch).await?;
        Ok(())
    }

    /// Read an object's bytes, resolving through the given location policy.
    pub async fn get_object(
        &self,
        identifier: &ObjectIdentifier,
        location: ObjectLocation,
    ) -> Result<Bytes, Error> {
        if let ObjectDigest::Inline(bytes) = identifier.digest() {
            return Ok(bytes.clone());
        }
        if let Some(bytes) = self.read_local_piece(identifier).await? {
            return Ok(bytes);
        }
        match location {
            ObjectLocation::Local => Err(Error::ObjectNotFound(identifier.digest().clone())),
            ObjectLocation::ValueFromNetwork => self.fetch_object(identifier).await,
            ObjectLocation::TreeNodeFromNetwork(commit_id) => {
                Box::pin(self.fetch_tree_node(identifier, commit_id)).await
            }
        }
    }

    /// Read a byte range of an object. `offset` past the end yields empty bytes.
    pub async fn get_object_part(
        &self,
        identifier: &ObjectIdentifier,
        offset: u64,
        max_size: Option<u64>,
        location: ObjectLocation,
    ) -> Result<Bytes, Error> {
        let bytes = self.get_object(identifier, location).await?;
        let start = (offset as usize).min(bytes.len());
        let end = match max_size {
            Some(max) => (start + max as usize).min(bytes.len()),
            None => bytes.len(),
        };
        Ok(bytes.slice(start..end))
    }

    /// The entries of a commit's tree, fetching the root node via diff if necessary.
    pub async fn get_commit_contents(&self, commit: &Commit) -> Result<Vec<Entry>, Error> {
        let bytes = self
            .get_object(
                commit.root(),
                ObjectLocation::TreeNodeFromNetwork(*commit.id()),
            )
            .await?;
        Ok(tree::decode_node(&bytes, &self.objects)?)
    }

    /// Store an opaque sync-metadata value (e.g. the cloud position token).
    pub async fn set_sync_metadata(&self, key: &[u8], value: Bytes) -> Result<(), Error> {
        let mut batch = Batch::new();
        batch.put(keys::sync_metadata(key), value);
        self.db.apply(batch).await?;
        Ok(())
    }

    /// Read an opaque sync-metadata value.
    pub async fn get_sync_metadata(&self, key: &[u8]) -> Result<Option<Bytes>, Error> {
        Ok(self.db.get(&keys::sync_metadata(key)).await?)
    }

    /// Root identifiers sync may still need for diff computation.
    pub fn live_root_identifiers(&self) -> Vec<ObjectIdentifier> {
        self.tracker().live_root_identifiers()
    }

    /// Attempt to delete the piece addressed by `digest`.
    ///
    /// Deletion is canceled if any identifier is live, a transaction is already
    /// pending, or anything on disk (tree node or commit) still points at the digest.
    /// On success, returns the outbound references the piece owned; they are candidates
    /// for collection in turn.
    pub async fn delete_object(&self, digest: &ObjectDigest) -> Result<GcOutcome, Error> {
        if digest.is_inlined() {
            return Ok(GcOutcome::Canceled);
        }
        if !self.objects.start_deletion(digest) {
            return Ok(GcOutcome::Canceled);
        }
        // From here on, any early exit must release the pending-deletion marker.
        let prepared = self.prepare_deletion(digest).await;
        let (outbound, name) = match prepared {
            Ok(Some(prepared)) => prepared,
            Ok(None) => {
                self.objects.abort_deletion(digest);
                return Ok(GcOutcome::Canceled);
            }
            Err(err) => {
                self.objects.abort_deletion(digest);
                return Err(err);
            }
        };

        let mut batch = Batch::new();
        batch.delete(keys::object(&name));
        batch.delete(keys::unsynced_piece(digest));
        for (destination, _) in &outbound {
            batch.delete(keys::object_ref(digest, destination));
            batch.delete(keys::inbound_ref(destination, digest));
        }

        // The reads above were suspension points: an identifier may have appeared.
        if !self.objects.complete_deletion(digest) {
            debug!(%digest, "deletion aborted by concurrent identifier");
            return Ok(GcOutcome::Canceled);
        }
        self.db.apply(batch).await?;
        self.metrics.objects_collected.inc();
        debug!(%digest, "piece collected");
        Ok(GcOutcome::Deleted(outbound))
    }

    /// Collect everything needed to delete `digest`: its outbound references and its
    /// stored name. Returns `None` if an on-disk pointer still references the digest.
    ///
    /// Live commits hold their root identifiers (and unsynced commits their parents'
    /// roots), so protected roots never reach this point: their live count already
    /// rejected the deletion transaction.
    async fn prepare_deletion(
        &self,
        digest: &ObjectDigest,
    ) -> Result<Option<(Vec<(ObjectDigest, Priority)>, Vec<u8>)>, Error> {
        let referenced = self.db.has_prefix(&keys::inbound_refs_prefix(digest)).await?
            || self.db.has_prefix(&keys::commit_refs_prefix(digest)).await?;
        if referenced {
            return Ok(None);
        }
        let mut outbound = Vec::new();
        let prefix = keys::object_refs_prefix(digest);
        for (key, value) in self.db.get_by_prefix(&prefix).await? {
            let mut destination_bytes = &key[prefix.len()..];
            let destination = ObjectDigest::read(&mut destination_bytes)?;
            let mut priority_bytes = value.as_ref();
            let priority = Priority::read(&mut priority_bytes)?;
            outbound.push((destination, priority));
        }
        let name = self.encryption.get_object_name(digest).await?;
        Ok(Some((outbound, name)))
    }

    /// Durably delete commits. Heads and live commits are skipped.
    pub async fn delete_commits(&self, ids: &[CommitId]) -> Result<(), Error> {
        let mut batch = Batch::new();
        let mut orphaned_roots = Vec::new();
        let mut deleted = 0u64;
        for id in ids {
            if self.tracker().is_live(id) || self.heads.lock().unwrap().contains_key(id) {
                continue;
            }
            let Some(encrypted) = self.db.get(&keys::commit(id)).await? else {
                continue;
            };
            let bytes = self.encryption.decrypt_commit(encrypted).await?;
            let root = peek_root(&bytes, &self.objects)?;
            batch.delete(keys::commit(id));
            batch.delete(keys::unsynced_commit(id));
            if !root.digest().is_inlined() {
                batch.delete(keys::commit_ref(root.digest(), id));
                orphaned_roots.push(root.digest().clone());
            }
            deleted += 1;
        }
        if batch.is_empty() {
            return Ok(());
        }
        self.db.apply(batch).await?;
        self.metrics.commits_pruned.inc_by(deleted);
        // Nudge the collector: these roots may now be unreachable.
        if let Some(tx) = &self.gc_tx {
            for digest in orphaned_roots {
                let _ = tx.unbounded_send(digest);
            }
        }
        Ok(())
    }

    /// The configured collection policy.
    pub fn gc_policy(&self) -> GcPolicy {
        self.gc_policy
    }

    async fn collect(&self, digest: ObjectDigest) {
        let mut queue = vec![digest];
        while let Some(digest) = queue.pop() {
            match self.delete_object(&digest).await {
                Ok(GcOutcome::Deleted(references)) => {
                    queue.extend(references.into_iter().map(|(digest, _)| digest));
                }
                Ok(GcOutcome::Canceled) => {}
                Err(err) => {
                    warn!(%digest, ?err, "garbage collection failed");
                }
            }
        }
    }

    async fn load_commit(&self, id: &CommitId) -> Result<Arc<Commit>, Error> {
        if let Some(commit) = self.heads.lock().unwrap().get(id) {
            return Ok(commit.clone());
        }
        let Some(encrypted) = self.db.get(&keys::commit(id)).await? else {
            return Err(Error::CommitNotFound(*id));
        };
        let bytes = self.encryption.decrypt_commit(encrypted).await?;
        let synced = !self.db.has_key(&keys::unsynced_commit(id)).await?;
        let mut parent_roots = Vec::new();
        if !synced {
            // Unsynced commits keep their parents' roots derivable for diff upload.
            let mut buf = bytes.as_ref();
            let data = CommitData::read_cfg(&mut buf, &())?;
            for parent in &data.parents {
                let Some(parent_encrypted) = self.db.get(&keys::commit(parent)).await? else {
                    continue;
                };
                let parent_bytes = self.encryption.decrypt_commit(parent_encrypted).await?;
                parent_roots.push(peek_root(&parent_bytes, &self.objects)?);
            }
        }
        self.commits
            .from_storage_bytes(*id, &bytes, &self.objects, parent_roots, synced)
    }

    async fn read_local_piece(
        &self,
        identifier: &ObjectIdentifier,
    ) -> Result<Option<Bytes>, Error> {
        let name = self.encryption.get_object_name(identifier.digest()).await?;
        let Some(encrypted) = self.db.get(&keys::object(&name)).await? else {
            return Ok(None);
        };
        let bytes = self
            .encryption
            .decrypt_object(identifier.key_index(), encrypted)
            .await?;
        if !identifier.digest().matches(&bytes) {
            return Err(Error::DataIntegrity(format!(
                "stored piece does not match digest {}",
                identifier.digest()
            )));
        }
        Ok(Some(bytes))
    }

    async fn fetch_object(&self, identifier: &ObjectIdentifier) -> Result<Bytes, Error> {
        let delegate = self.sync_delegate()?;
        let bytes = delegate.get_object(identifier.clone()).await?;
        if !identifier.digest().matches(&bytes) {
            return Err(Error::DataIntegrity(format!(
                "fetched piece does not match digest {}",
                identifier.digest()
            )));
        }
        self.store_fetched_piece(identifier, bytes.clone(), &[])
            .await?;
        Ok(bytes)
    }

    async fn fetch_tree_node(
        &self,
        identifier: &ObjectIdentifier,
        commit_id: CommitId,
    ) -> Result<Bytes, Error> {
        let delegate = self.sync_delegate()?;
        let bases = self.tracker().live_commits();
        let diff = match delegate.get_diff(commit_id, bases).await {
            Ok(diff) => diff,
            // The cloud cannot serve diffs; fall back to fetching the whole node. The
            // node's reference rows still have to land for collection to stay sound.
            Err(Error::DiffNotSupported) => {
                let bytes = self.fetch_object(identifier).await?;
                let entries = tree::decode_node(&bytes, &self.objects)?;
                self.store_fetched_piece(identifier, bytes.clone(), &entries)
                    .await?;
                return Ok(bytes);
            }
            Err(err) => return Err(err),
        };
        let base = self.get_commit(&diff.base).await?;
        let base_bytes = self.get_object(base.root(), ObjectLocation::Local).await?;
        let base_entries = tree::decode_node(&base_bytes, &self.objects)?;
        let entries = tree::apply_changes(base_entries, &diff.changes);
        let node = tree::encode_node(&entries);
        if !identifier.digest().matches(&node) {
            return Err(Error::DataIntegrity(format!(
                "diff for commit {commit_id} does not reconstruct {}",
                identifier.digest()
            )));
        }
        let bytes = Bytes::from(node);
        self.store_fetched_piece(identifier, bytes.clone(), &entries)
            .await?;
        Ok(bytes)
    }

    async fn store_fetched_piece(
        &self,
        identifier: &ObjectIdentifier,
        bytes: Bytes,
        entries: &[Entry],
    ) -> Result<(), Error> {
        let name = self.encryption.get_object_name(identifier.digest()).await?;
        let encrypted = self
            .encryption
            .encrypt_object(identifier.key_index(), bytes)
            .await?;
        let mut batch = Batch::new();
        if entries.is_empty() {
            batch.put(keys::object(&name), encrypted);
        } else {
            self.stage_node_piece(&mut batch, identifier.digest(), &name, encrypted, entries, false);
        }
        self.db.apply(batch).await?;
        Ok(())
    }

    /// Stage a tree-node piece and its reference rows.
    fn stage_node_piece(
        &self,
        batch: &mut Batch,
        digest: &ObjectDigest,
        name: &[u8],
        encrypted: Bytes,
        entries: &[Entry],
        unsynced: bool,
    ) {
        batch.put(keys::object(name), encrypted);
        if unsynced {
            batch.put(
                keys::unsynced_piece(digest),
                Bytes::copy_from_slice(&self.encryption.key_index().to_be_bytes()),
            );
        }
        for (destination, priority) in tree::node_references(entries) {
            let mut priority_bytes = Vec::with_capacity(1);
            priority.write(&mut priority_bytes);
            batch.put(
                keys::object_ref(digest, &destination),
                Bytes::from(priority_bytes),
            );
            batch.put(keys::inbound_ref(&destination, digest), Bytes::new());
        }
    }

    async fn read_node(&self, root: &ObjectIdentifier) -> Result<Vec<Entry>, Error> {
        let bytes = self.get_object(root, ObjectLocation::Local).await?;
        Ok(tree::decode_node(&bytes, &self.objects)?)
    }

    fn sync_delegate(&self) -> Result<Arc<dyn PageSyncDelegate>, Error> {
        self.delegate
            .lock()
            .unwrap()
            .clone()
            .ok_or(Error::NoSyncDelegate)
    }

    fn notify_watchers(&self, commits: Vec<Arc<Commit>>, source: ChangeSource) {
        let event: CommitEvent = (commits, source);
        self.watchers
            .lock()
            .unwrap()
            .retain(|watcher| watcher.unbounded_send(event.clone()).is_ok());
    }

    fn schedule_prune(&self) {
        if let Some(pruner) = &*self.pruner.lock().unwrap() {
            pruner.schedule();
        }
    }

    fn now(&self) -> u64 {
        self.context
            .current()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos() as u64)
            .unwrap_or(0)
    }
}

fn apply_journal(
    base: Vec<Entry>,
    changes: &std::collections::BTreeMap<Vec<u8>, JournalChange>,
) -> Vec<Entry> {
    let mut entries: std::collections::BTreeMap<Vec<u8>, Entry> =
        base.into_iter().map(|e| (e.key.clone(), e)).collect();
    for (key, change) in changes {
        match change {
            JournalChange::Put { value, priority } => {
                entries.insert(
                    key.clone(),
                    tree::make_entry(key.clone(), value.clone(), *priority),
                );
            }
            JournalChange::Delete => {
                entries.remove(key);
            }
        }
    }
    entries.into_values().collect()
}

fn decode_u64(bytes: &[u8]) -> Result<u64, Error> {
    let array: [u8; 8] = bytes
        .try_into()
        .map_err(|_| Error::DataIntegrity("malformed u64 row".to_string()))?;
    Ok(u64::from_be_bytes(array))
}

fn decode_u32(bytes: &[u8]) -> Result<u32, Error> {
    let array: [u8; 4] = bytes
        .try_into()
        .map_err(|_| Error::DataIntegrity("malformed u32 row".to_string()))?;
    Ok(u32::from_be_bytes(array))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db::memory::Memory, encryption::Plaintext, object::MAX_INLINE_SIZE};
    use commonware_runtime::{deterministic, Runner as _};
    use std::time::Duration;

    type TestStorage = PageStorage<deterministic::Context, Memory, Plaintext>;

    async fn new_storage(context: deterministic::Context) -> (Arc<TestStorage>, Memory) {
        let db = Memory::new();
        let storage = PageStorage::init(context, Config::default(), db.clone(), Plaintext::new())
            .await
            .unwrap();
        (storage, db)
    }

    fn big_value(seed: u8) -> Bytes {
        Bytes::from(vec![seed; MAX_INLINE_SIZE + 1])
    }

    #[test]
    fn test_commit_delete_and_noop() {
        let runner = deterministic::Runner::default();
        runner.start(|context| async move {
            let (storage, _) = new_storage(context.with_label("storage")).await;
            let root = storage.heads()[0];

            // Put "k" -> "v".
            let value = storage.add_object(Bytes::from_static(b"v")).await.unwrap();
            let mut journal = storage.start_commit(&root).await.unwrap();
            journal.put(b"k".to_vec(), value.clone(), Priority::Eager);
            let c1 = storage.commit_journal(journal).await.unwrap().unwrap();
            let contents = storage.get_commit_contents(&c1).await.unwrap();
            assert_eq!(contents.len(), 1);
            assert_eq!(contents[0].key, b"k".to_vec());
            assert_eq!(storage.heads(), vec![*c1.id()]);

            // Delete "k".
            context.sleep(Duration::from_millis(1)).await;
            let mut journal = storage.start_commit(c1.id()).await.unwrap();
            journal.delete(b"k".to_vec());
            let c2 = storage.commit_journal(journal).await.unwrap().unwrap();
            assert!(storage.get_commit_contents(&c2).await.unwrap().is_empty());
            assert_eq!(storage.heads(), vec![*c2.id()]);

            // Re-putting the same content from c1 is a true no-op, not a new commit.
            context.sleep(Duration::from_millis(1)).await;
            let mut journal = storage.start_commit(c1.id()).await.unwrap();
            journal.put(b"k".to_vec(), value, Priority::Eager);
            assert!(storage.commit_journal(journal).await.unwrap().is_none());
            assert_eq!(storage.heads(), vec![*c2.id()]);
        });
    }

    #[test]
    fn test_heads_are_maximal_elements() {
        let runner = deterministic::Runner::default();
        runner.start(|context| async move {
            let (storage, _) = new_storage(context.with_label("storage")).await;
            let root = storage.heads()[0];

            let value_a = storage.add_object(Bytes::from_static(b"a")).await.unwrap();
            let mut journal = storage.start_commit(&root).await.unwrap();
            journal.put(b"a".to_vec(), value_a, Priority::Eager);
            let left = storage.commit_journal(journal).await.unwrap().unwrap();

            context.sleep(Duration::from_millis(1)).await;
            let value_b = storage.add_object(Bytes::from_static(b"b")).await.unwrap();
            let mut journal = storage.start_commit(&root).await.unwrap();
            journal.put(b"b".to_vec(), value_b, Priority::Eager);
            let right = storage.commit_journal(journal).await.unwrap().unwrap();

            // Both branches are maximal.
            let mut expected = vec![*left.id(), *right.id()];
            expected.sort_by_key(|id| {
                (
                    if id == left.id() {
                        left.timestamp()
                    } else {
                        right.timestamp()
                    },
                    *id,
                )
            });
            assert_eq!(storage.heads(), expected);

            // A merge collapses the head set to its single maximal element.
            let journal = storage
                .start_merge_commit(left.id(), right.id())
                .await
                .unwrap();
            let merge = storage.commit_journal(journal).await.unwrap().unwrap();
            assert_eq!(storage.heads(), vec![*merge.id()]);
            assert_eq!(merge.generation(), 2);
        });
    }

    #[test]
    fn test_commit_io_error_aborts() {
        let runner = deterministic::Runner::default();
        runner.start(|context| async move {
            let (storage, db) = new_storage(context.with_label("storage")).await;
            let root = storage.heads()[0];
            let mut watcher = storage.register_commit_watcher();

            let value = storage.add_object(Bytes::from_static(b"v")).await.unwrap();
            let mut journal = storage.start_commit(&root).await.unwrap();
            journal.put(b"k".to_vec(), value.clone(), Priority::Eager);
            db.fail_next_batches(1);
            assert!(matches!(
                storage.commit_journal(journal).await,
                Err(Error::Db(_))
            ));

            // Nothing moved: heads unchanged, no notification.
            assert_eq!(storage.heads(), vec![root]);
            assert!(watcher.try_next().is_err());

            // A retry with fresh staging succeeds.
            let mut journal = storage.start_commit(&root).await.unwrap();
            journal.put(b"k".to_vec(), value, Priority::Eager);
            let commit = storage.commit_journal(journal).await.unwrap().unwrap();
            assert_eq!(storage.heads(), vec![*commit.id()]);
            let (commits, source) = watcher.try_next().unwrap().unwrap();
            assert_eq!(commits.len(), 1);
            assert_eq!(source, ChangeSource::Local);
        });
    }

    #[test]
    fn test_add_commits_from_sync_idempotent() {
        let runner = deterministic::Runner::default();
        runner.start(|context| async move {
            let (source_storage, _) = new_storage(context.with_label("source")).await;
            let (target, _) = new_storage(context.with_label("target")).await;
            let root = source_storage.heads()[0];
            // Both empty pages agree on the sentinel commit.
            assert_eq!(source_storage.heads(), target.heads());

            let value = source_storage
                .add_object(Bytes::from_static(b"v"))
                .await
                .unwrap();
            let mut journal = source_storage.start_commit(&root).await.unwrap();
            journal.put(b"k".to_vec(), value, Priority::Eager);
            let c1 = source_storage.commit_journal(journal).await.unwrap().unwrap();
            context.sleep(Duration::from_millis(1)).await;
            let mut journal = source_storage.start_commit(c1.id()).await.unwrap();
            journal.delete(b"k".to_vec());
            let c2 = source_storage.commit_journal(journal).await.unwrap().unwrap();

            let batch = vec![
                CommitIdAndBytes {
                    id: *c1.id(),
                    bytes: c1.storage_bytes().into(),
                },
                CommitIdAndBytes {
                    id: *c2.id(),
                    bytes: c2.storage_bytes().into(),
                },
            ];
            let mut watcher = target.register_commit_watcher();
            target
                .add_commits_from_sync(batch.clone(), ChangeSource::Cloud)
                .await
                .unwrap();
            assert_eq!(target.heads(), vec![*c2.id()]);
            let (commits, source) = watcher.try_next().unwrap().unwrap();
            assert_eq!(commits.len(), 2);
            assert_eq!(source, ChangeSource::Cloud);

            // Re-applying the same batch adds nothing and notifies nobody.
            target
                .add_commits_from_sync(batch, ChangeSource::Cloud)
                .await
                .unwrap();
            assert_eq!(target.heads(), vec![*c2.id()]);
            assert!(watcher.try_next().is_err());
        });
    }

    #[test]
    fn test_add_commits_missing_parent() {
        let runner = deterministic::Runner::default();
        runner.start(|context| async move {
            let (source_storage, _) = new_storage(context.with_label("source")).await;
            let (target, _) = new_storage(context.with_label("target")).await;
            let root = source_storage.heads()[0];

            let value = source_storage
                .add_object(Bytes::from_static(b"v"))
                .await
                .unwrap();
            let mut journal = source_storage.start_commit(&root).await.unwrap();
            journal.put(b"k".to_vec(), value, Priority::Eager);
            let c1 = source_storage.commit_journal(journal).await.unwrap().unwrap();
            context.sleep(Duration::from_millis(1)).await;
            let mut journal = source_storage.start_commit(c1.id()).await.unwrap();
            journal.delete(b"k".to_vec());
            let c2 = source_storage.commit_journal(journal).await.unwrap().unwrap();

            // Delivering the child without its parent fails the whole batch.
            let mut watcher = target.register_commit_watcher();
            let result = target
                .add_commits_from_sync(
                    vec![CommitIdAndBytes {
                        id: *c2.id(),
                        bytes: c2.storage_bytes().into(),
                    }],
                    ChangeSource::Cloud,
                )
                .await;
            assert!(matches!(result, Err(Error::ParentNotFound(id)) if id == *c1.id()));
            assert!(!target.has_commit(c2.id()).await.unwrap());
            assert!(watcher.try_next().is_err());
        });
    }

    #[test]
    fn test_remote_echo_marks_synced() {
        let runner = deterministic::Runner::default();
        runner.start(|context| async move {
            let (storage, _) = new_storage(context.with_label("storage")).await;
            let root = storage.heads()[0];

            let value = storage.add_object(Bytes::from_static(b"v")).await.unwrap();
            let mut journal = storage.start_commit(&root).await.unwrap();
            journal.put(b"k".to_vec(), value, Priority::Eager);
            let c1 = storage.commit_journal(journal).await.unwrap().unwrap();

            let unsynced = storage.get_unsynced_commits().await.unwrap();
            assert_eq!(unsynced.len(), 1);
            assert_eq!(unsynced[0].id(), c1.id());

            // The cloud echoing our own commit back marks it synced without re-adding
            // or notifying.
            let mut watcher = storage.register_commit_watcher();
            storage
                .add_commits_from_sync(
                    vec![CommitIdAndBytes {
                        id: *c1.id(),
                        bytes: c1.storage_bytes().into(),
                    }],
                    ChangeSource::Cloud,
                )
                .await
                .unwrap();
            assert!(storage.get_unsynced_commits().await.unwrap().is_empty());
            assert!(watcher.try_next().is_err());
        });
    }

    #[test]
    fn test_gc_collects_unreferenced_value() {
        let runner = deterministic::Runner::default();
        runner.start(|context| async move {
            let (storage, _) = new_storage(context.with_label("storage")).await;

            let value = storage.add_object(big_value(1)).await.unwrap();
            let digest = value.digest().clone();
            assert!(storage
                .get_object(&value, ObjectLocation::Local)
                .await
                .is_ok());

            // Dropping the last identifier makes the piece collectable.
            drop(value);
            context.sleep(Duration::from_millis(10)).await;

            let revived = storage.object_factory().make_identifier(0, digest);
            assert!(matches!(
                storage.get_object(&revived, ObjectLocation::Local).await,
                Err(Error::ObjectNotFound(_))
            ));
            assert!(storage.get_unsynced_pieces().await.unwrap().is_empty());
        });
    }

    #[test]
    fn test_gc_canceled_while_referenced() {
        let runner = deterministic::Runner::default();
        runner.start(|context| async move {
            let (storage, _) = new_storage(context.with_label("storage")).await;
            let root = storage.heads()[0];

            let value = storage.add_object(big_value(2)).await.unwrap();
            let digest = value.digest().clone();
            let mut journal = storage.start_commit(&root).await.unwrap();
            journal.put(b"k".to_vec(), value, Priority::Lazy);
            storage.commit_journal(journal).await.unwrap().unwrap();

            // The journal value identifier is gone, but the committed tree points at
            // the piece on disk: deletion cancels and the bytes stay readable.
            context.sleep(Duration::from_millis(10)).await;
            assert!(matches!(
                storage.delete_object(&digest).await.unwrap(),
                GcOutcome::Canceled
            ));
            let revived = storage.object_factory().make_identifier(0, digest);
            assert!(storage
                .get_object(&revived, ObjectLocation::Local)
                .await
                .is_ok());
        });
    }

    #[test]
    fn test_deletion_race_protection() {
        let runner = deterministic::Runner::default();
        runner.start(|context| async move {
            let (storage, _) = new_storage(context.with_label("storage")).await;

            let value = storage.add_object(big_value(3)).await.unwrap();
            let digest = value.digest().clone();
            drop(value);

            // Start a deletion, then revive the digest before completing: the factory
            // protocol forces the delete to cancel, and the bytes survive.
            assert!(storage.object_factory().start_deletion(&digest));
            let revived = storage.object_factory().make_identifier(0, digest.clone());
            assert!(!storage.object_factory().complete_deletion(&digest));
            assert!(storage
                .get_object(&revived, ObjectLocation::Local)
                .await
                .is_ok());
        });
    }

    #[test]
    fn test_sync_metadata_round_trip() {
        let runner = deterministic::Runner::default();
        runner.start(|context| async move {
            let (storage, _) = new_storage(context.with_label("storage")).await;
            assert!(storage
                .get_sync_metadata(b"timestamp")
                .await
                .unwrap()
                .is_none());
            storage
                .set_sync_metadata(b"timestamp", Bytes::from_static(b"token-1"))
                .await
                .unwrap();
            assert_eq!(
                storage.get_sync_metadata(b"timestamp").await.unwrap(),
                Some(Bytes::from_static(b"token-1"))
            );
        });
    }

    #[test]
    fn test_unsynced_pieces_tracking() {
        let runner = deterministic::Runner::default();
        runner.start(|context| async move {
            let (storage, _) = new_storage(context.with_label("storage")).await;

            let value = storage.add_object(big_value(4)).await.unwrap();
            let pieces = storage.get_unsynced_pieces().await.unwrap();
            assert_eq!(pieces.len(), 1);
            assert_eq!(pieces[0].digest(), value.digest());

            storage.mark_piece_synced(value.digest()).await.unwrap();
            assert!(storage.get_unsynced_pieces().await.unwrap().is_empty());
        });
    }

}

//! Background deletion of commits dominated by the live set.
//!
//! After any change to the live-commit set, the pruner computes the latest unique
//! common ancestor (LUCA) of everything live and deletes every strict ancestor of it
//! that is not itself live. Triggers are coalesced: one prune runs at a time, and any
//! number of triggers arriving mid-run collapse into a single follow-up.

use crate::{
    commit::CommitId,
    db::Db,
    encryption::EncryptionService,
    page::PageStorage,
    Error,
};
use commonware_runtime::{Clock, Metrics, Spawner};
use std::{
    collections::{BTreeSet, HashSet},
    sync::{Arc, Mutex, Weak},
};
use tracing::{debug, warn};

/// When dominated commits are deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitPruningPolicy {
    /// Keep all commits.
    Never,
    /// Prune after every local change to the live-commit set.
    LocalImmediate,
}

struct PruneState {
    in_flight: bool,
    queued: bool,
}

pub(crate) struct Pruner<E: Clock + Spawner + Metrics, D: Db, S: EncryptionService> {
    context: E,
    storage: Weak<PageStorage<E, D, S>>,
    state: Arc<Mutex<PruneState>>,
}

impl<E: Clock + Spawner + Metrics, D: Db, S: EncryptionService> Pruner<E, D, S> {
    pub(crate) fn new(context: E, storage: Weak<PageStorage<E, D, S>>) -> Self {
        Self {
            context,
            storage,
            state: Arc::new(Mutex::new(PruneState {
                in_flight: false,
                queued: false,
            })),
        }
    }

    /// Request a prune. If one is already running, queue exactly one follow-up.
    pub(crate) fn schedule(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if state.in_flight {
                state.queued = true;
                return;
            }
            state.in_flight = true;
        }
        let storage = self.storage.clone();
        let state = self.state.clone();
        self.context.clone().spawn(move |_| async move {
            loop {
                let Some(storage) = storage.upgrade() else {
                    let mut state = state.lock().unwrap();
                    state.in_flight = false;
                    state.queued = false;
                    return;
                };
                if let Err(err) = prune_once(&storage).await {
                    warn!(?err, "prune failed");
                }
                drop(storage);
                let mut state = state.lock().unwrap();
                if state.queued {
                    state.queued = false;
                    continue;
                }
                state.in_flight = false;
                return;
            }
        });
    }
}

/// One prune pass: find the LUCA of all live commits and delete its strict ancestors.
///
/// A missing parent anywhere in the walk (prior pruning, remote truncation) degrades
/// the pass to a no-op for that branch.
async fn prune_once<E: Clock + Spawner + Metrics, D: Db, S: EncryptionService>(
    storage: &Arc<PageStorage<E, D, S>>,
) -> Result<(), Error> {
    // Seed the frontier with every live commit.
    let live = storage.tracker().live_commits();
    if live.is_empty() {
        return Ok(());
    }
    let mut frontier: BTreeSet<(u64, CommitId)> = BTreeSet::new();
    for id in live {
        match storage.get_commit(&id).await {
            Ok(commit) => {
                frontier.insert((commit.generation(), id));
            }
            Err(Error::CommitNotFound(_)) => return Ok(()),
            Err(err) => return Err(err),
        }
    }

    // Walk backwards, always replacing the highest-generation commit with its parents,
    // until a single common ancestor remains.
    while frontier.len() > 1 {
        let Some(&newest) = frontier.iter().next_back() else {
            break;
        };
        frontier.remove(&newest);
        let (_, id) = newest;
        let commit = match storage.get_commit(&id).await {
            Ok(commit) => commit,
            Err(Error::CommitNotFound(_)) => return Ok(()),
            Err(err) => return Err(err),
        };
        for parent in commit.parent_ids() {
            let parent = match storage.get_commit(parent).await {
                Ok(parent) => parent,
                Err(Error::CommitNotFound(_)) => return Ok(()),
                Err(err) => return Err(err),
            };
            frontier.insert((parent.generation(), *parent.id()));
        }
    }
    let Some((_, luca)) = frontier.into_iter().next() else {
        return Ok(());
    };

    // Collect the strict ancestors of the LUCA that are not live.
    let luca_commit = match storage.get_commit(&luca).await {
        Ok(commit) => commit,
        Err(Error::CommitNotFound(_)) => return Ok(()),
        Err(err) => return Err(err),
    };
    let mut queue: Vec<CommitId> = luca_commit.parent_ids().to_vec();
    drop(luca_commit);
    let mut seen: HashSet<CommitId> = HashSet::new();
    let mut to_delete = Vec::new();
    while let Some(id) = queue.pop() {
        if !seen.insert(id) {
            continue;
        }
        let parents = match storage.get_commit(&id).await {
            Ok(commit) => commit.parent_ids().to_vec(),
            Err(Error::CommitNotFound(_)) => continue,
            Err(err) => return Err(err),
        };
        // The Arc from get_commit is gone now, so liveness reflects real holders.
        if !storage.tracker().is_live(&id) {
            to_delete.push(id);
        }
        queue.extend(parents);
    }
    if to_delete.is_empty() {
        return Ok(());
    }
    debug!(luca = %luca, count = to_delete.len(), "pruning dominated commits");
    storage.delete_commits(&to_delete).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::memory::Memory,
        encryption::Plaintext,
        object::Priority,
        page::{Config, GcPolicy, ObjectLocation, PageStorage},
    };
    use bytes::Bytes;
    use commonware_runtime::{deterministic, Runner as _};
    use std::time::Duration;

    type TestStorage = PageStorage<deterministic::Context, Memory, Plaintext>;

    async fn new_storage(
        context: deterministic::Context,
        pruning_policy: CommitPruningPolicy,
    ) -> Arc<TestStorage> {
        PageStorage::init(
            context,
            Config {
                gc_policy: GcPolicy::EagerLiveReferences,
                pruning_policy,
            },
            Memory::new(),
            Plaintext::new(),
        )
        .await
        .unwrap()
    }

    #[test]
    fn test_prunes_dominated_chain() {
        let runner = deterministic::Runner::default();
        runner.start(|context| async move {
            let storage =
                new_storage(context.with_label("storage"), CommitPruningPolicy::LocalImmediate)
                    .await;
            let root = storage.heads()[0];

            let value = storage.add_object(Bytes::from_static(b"v")).await.unwrap();
            let mut journal = storage.start_commit(&root).await.unwrap();
            journal.put(b"k".to_vec(), value, Priority::Eager);
            let c1 = storage.commit_journal(journal).await.unwrap().unwrap();
            let c1_id = *c1.id();
            // Keep only the digest: a held identifier would pin the piece.
            let c1_root_digest = c1.root().digest().clone();

            context.sleep(Duration::from_millis(1)).await;
            let value = storage.add_object(Bytes::from_static(b"w")).await.unwrap();
            let mut journal = storage.start_commit(&c1_id).await.unwrap();
            journal.put(b"k2".to_vec(), value, Priority::Eager);
            let c2 = storage.commit_journal(journal).await.unwrap().unwrap();
            let c2_id = *c2.id();

            // While still referenced, nothing is pruned.
            context.sleep(Duration::from_millis(10)).await;
            assert!(storage.has_commit(&c1_id).await.unwrap());

            // Release our references and land one more commit to re-trigger pruning.
            drop(c1);
            drop(c2);
            context.sleep(Duration::from_millis(1)).await;
            let value = storage.add_object(Bytes::from_static(b"x")).await.unwrap();
            let mut journal = storage.start_commit(&c2_id).await.unwrap();
            journal.put(b"k3".to_vec(), value, Priority::Eager);
            let c3 = storage.commit_journal(journal).await.unwrap().unwrap();
            context.sleep(Duration::from_millis(20)).await;

            // Everything strictly dominated by the sole live commit is gone.
            assert!(storage.has_commit(c3.id()).await.unwrap());
            assert!(!storage.has_commit(&c1_id).await.unwrap());
            assert!(!storage.has_commit(&c2_id).await.unwrap());
            assert!(!storage.has_commit(&root).await.unwrap());

            // The orphaned tree node of the pruned commit was collected too: its
            // bytes are unreadable once a fresh identifier probes for them.
            let probe = storage.object_factory().make_identifier(0, c1_root_digest);
            assert!(matches!(
                storage.get_object(&probe, ObjectLocation::Local).await,
                Err(crate::Error::ObjectNotFound(_))
            ));
        });
    }

    #[test]
    fn test_never_policy_keeps_history() {
        let runner = deterministic::Runner::default();
        runner.start(|context| async move {
            let storage =
                new_storage(context.with_label("storage"), CommitPruningPolicy::Never).await;
            let root = storage.heads()[0];

            let value = storage.add_object(Bytes::from_static(b"v")).await.unwrap();
            let mut journal = storage.start_commit(&root).await.unwrap();
            journal.put(b"k".to_vec(), value, Priority::Eager);
            let c1 = storage.commit_journal(journal).await.unwrap().unwrap();
            let c1_id = *c1.id();
            drop(c1);

            context.sleep(Duration::from_millis(1)).await;
            let value = storage.add_object(Bytes::from_static(b"w")).await.unwrap();
            let mut journal = storage.start_commit(&c1_id).await.unwrap();
            journal.put(b"k2".to_vec(), value, Priority::Eager);
            storage.commit_journal(journal).await.unwrap().unwrap();
            context.sleep(Duration::from_millis(20)).await;

            assert!(storage.has_commit(&root).await.unwrap());
            assert!(storage.has_commit(&c1_id).await.unwrap());
        });
    }
}

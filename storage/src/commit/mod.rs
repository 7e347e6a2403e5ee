//! Immutable commits and their content-addressed identity.
//!
//! A commit's id is the sha-256 of its storage bytes (parents, timestamp, generation,
//! root identifier), so identical content yields identical ids on every device. Merge
//! commits take `max(parent timestamps)` as their timestamp and sort their parents, so
//! two devices independently merging the same pair converge on the same id. Normal
//! commits take the local clock, which keeps re-created history distinct.

use crate::{
    object::{read_identifier, ObjectDigest, ObjectIdentifier, ObjectIdentifierFactory},
    Error,
};
use bytes::{Buf, BufMut};
use commonware_codec::{EncodeSize, Error as CodecError, FixedSize, Read, ReadExt, Write};
use commonware_cryptography::{sha256, Hasher, Sha256};
use std::sync::Arc;

mod tracker;
pub use tracker::LiveCommitTracker;

/// Identity of a commit.
pub type CommitId = sha256::Digest;

/// Provenance of a batch of commits handed to watchers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeSource {
    /// Committed by a local journal.
    Local,
    /// Applied from the cloud synchronizer.
    Cloud,
}

/// An immutable node of the commit DAG.
///
/// Registers itself with the [LiveCommitTracker] on construction and unregisters on
/// drop; share via [Arc]. Two parents means merge, one means normal, zero is reserved
/// for the sentinel root commit of an empty page.
pub struct Commit {
    id: CommitId,
    parents: Vec<CommitId>,
    timestamp: u64,
    generation: u64,
    root: ObjectIdentifier,
    // Unregisters from the tracker when the commit is dropped. Held, never read.
    _registration: tracker::Registration,
}

impl Commit {
    pub fn id(&self) -> &CommitId {
        &self.id
    }

    pub fn parent_ids(&self) -> &[CommitId] {
        &self.parents
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Identifier of the page's B-tree root at this commit.
    pub fn root(&self) -> &ObjectIdentifier {
        &self.root
    }

    /// Whether this is the sentinel root commit.
    pub fn is_root(&self) -> bool {
        self.parents.is_empty()
    }

    /// Serialized storage bytes; hashing them yields [Self::id].
    pub fn storage_bytes(&self) -> Vec<u8> {
        let data = CommitData {
            timestamp: self.timestamp,
            generation: self.generation,
            root_key_index: self.root.key_index(),
            root_digest: self.root.digest().clone(),
            parents: self.parents.clone(),
        };
        data.to_bytes()
    }
}

impl std::fmt::Debug for Commit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Commit")
            .field("id", &self.id)
            .field("parents", &self.parents)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Decoded storage bytes of a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CommitData {
    pub timestamp: u64,
    pub generation: u64,
    pub root_key_index: u32,
    pub root_digest: ObjectDigest,
    pub parents: Vec<CommitId>,
}

impl CommitData {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encode_size());
        self.write(&mut buf);
        buf
    }

    /// The content-addressed id of these bytes.
    pub fn id(&self) -> CommitId {
        let mut hasher = Sha256::new();
        hasher.update(&self.to_bytes());
        hasher.finalize()
    }
}

impl Write for CommitData {
    fn write(&self, buf: &mut impl BufMut) {
        self.timestamp.write(buf);
        self.generation.write(buf);
        self.root_key_index.write(buf);
        self.root_digest.write(buf);
        (self.parents.len() as u8).write(buf);
        for parent in &self.parents {
            parent.write(buf);
        }
    }
}

impl EncodeSize for CommitData {
    fn encode_size(&self) -> usize {
        u64::SIZE * 2
            + u32::SIZE
            + self.root_digest.encode_size()
            + u8::SIZE
            + self.parents.len() * CommitId::SIZE
    }
}

impl Read for CommitData {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let timestamp = u64::read(buf)?;
        let generation = u64::read(buf)?;
        let root_key_index = u32::read(buf)?;
        let root_digest = ObjectDigest::read(buf)?;
        let count = u8::read(buf)? as usize;
        if count > 2 {
            return Err(CodecError::Invalid("CommitData", "too many parents"));
        }
        let mut parents = Vec::with_capacity(count);
        for _ in 0..count {
            parents.push(CommitId::read(buf)?);
        }
        Ok(Self {
            timestamp,
            generation,
            root_key_index,
            root_digest,
            parents,
        })
    }
}

/// Materializes [Commit] objects, registering each with the live-commit tracker.
#[derive(Clone)]
pub struct CommitFactory {
    tracker: LiveCommitTracker,
}

impl CommitFactory {
    pub fn new(tracker: LiveCommitTracker) -> Self {
        Self { tracker }
    }

    pub fn tracker(&self) -> &LiveCommitTracker {
        &self.tracker
    }

    /// Build the sentinel root commit of an empty page.
    pub fn root(&self, root: ObjectIdentifier) -> Arc<Commit> {
        self.materialize(
            CommitData {
                timestamp: 0,
                generation: 0,
                root_key_index: root.key_index(),
                root_digest: root.digest().clone(),
                parents: Vec::new(),
            },
            root,
            Vec::new(),
            true,
        )
    }

    /// Build a new commit from its content and parents.
    ///
    /// With two parents this is a merge: parents are sorted by id and the timestamp is
    /// the maximum of theirs, making the result independent of merge order. With one
    /// parent, `timestamp` is the caller's clock reading.
    pub fn from_content_and_parents(
        &self,
        timestamp: u64,
        parents: Vec<Arc<Commit>>,
        root: ObjectIdentifier,
    ) -> Arc<Commit> {
        assert!(!parents.is_empty() && parents.len() <= 2);
        let mut parents = parents;
        let timestamp = if parents.len() == 2 {
            parents.sort_by(|a, b| a.id().cmp(b.id()));
            parents.iter().map(|p| p.timestamp()).max().unwrap_or(0)
        } else {
            timestamp
        };
        let generation = 1 + parents.iter().map(|p| p.generation()).max().unwrap_or(0);
        let parent_roots = parents.iter().map(|p| p.root().clone()).collect();
        let data = CommitData {
            timestamp,
            generation,
            root_key_index: root.key_index(),
            root_digest: root.digest().clone(),
            parents: parents.iter().map(|p| *p.id()).collect(),
        };
        self.materialize(data, root, parent_roots, false)
    }

    /// Rehydrate a commit from its storage bytes, verifying the id matches the content.
    ///
    /// `parent_roots` feeds the tracker's live-root derivation for unsynced commits and
    /// may be empty for synced ones.
    pub fn from_storage_bytes(
        &self,
        id: CommitId,
        bytes: &[u8],
        factory: &ObjectIdentifierFactory,
        parent_roots: Vec<ObjectIdentifier>,
        synced: bool,
    ) -> Result<Arc<Commit>, Error> {
        let mut buf = bytes;
        let data = CommitData::read_cfg(&mut buf, &())?;
        if buf.remaining() != 0 {
            return Err(Error::DataIntegrity(format!(
                "commit {id} has trailing bytes"
            )));
        }
        let computed = data.id();
        if computed != id {
            return Err(Error::DataIntegrity(format!(
                "commit id mismatch: stored {id}, content {computed}"
            )));
        }
        let root = factory.make_identifier(data.root_key_index, data.root_digest.clone());
        Ok(self.materialize(data, root, parent_roots, synced))
    }

    fn materialize(
        &self,
        data: CommitData,
        root: ObjectIdentifier,
        parent_roots: Vec<ObjectIdentifier>,
        synced: bool,
    ) -> Arc<Commit> {
        let id = data.id();
        let registration = self
            .tracker
            .register(id, root.clone(), parent_roots, synced);
        Arc::new(Commit {
            id,
            parents: data.parents,
            timestamp: data.timestamp,
            generation: data.generation,
            root,
            _registration: registration,
        })
    }
}

/// Compute the content-addressed id of commit storage bytes, verifying they parse.
pub fn compute_commit_id(bytes: &[u8]) -> Result<CommitId, Error> {
    let mut buf = bytes;
    let data = CommitData::read_cfg(&mut buf, &())?;
    if buf.remaining() != 0 {
        return Err(Error::DataIntegrity(
            "commit bytes have trailing data".to_string(),
        ));
    }
    Ok(data.id())
}

/// Decode only the root identifier out of commit storage bytes, without registering
/// anything as live.
pub(crate) fn peek_root(
    bytes: &[u8],
    factory: &ObjectIdentifierFactory,
) -> Result<ObjectIdentifier, Error> {
    let mut buf = bytes;
    // Skip timestamp and generation.
    let _ = u64::read(&mut buf).map_err(Error::Codec)?;
    let _ = u64::read(&mut buf).map_err(Error::Codec)?;
    read_identifier(&mut buf, factory).map_err(Error::Codec)
}

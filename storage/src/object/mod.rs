//! Content-addressed object identifiers and their reference-counting factory.
//!
//! Every stored piece is addressed by an [ObjectDigest]. Short values are carried
//! inline by the digest itself and never touch storage; everything else is addressed
//! by the sha-256 of its bytes. An [ObjectIdentifier] is a live, counted reference to
//! a digest: while any identifier for a digest exists in memory, the digest cannot be
//! garbage-collected. Collection itself is a two-phase protocol ([ObjectIdentifierFactory::
//! start_deletion] / [ObjectIdentifierFactory::complete_deletion]) that tolerates an
//! identifier being re-created between the decision to collect and the actual delete.

use bytes::{Buf, BufMut, Bytes};
use commonware_codec::{EncodeSize, Error as CodecError, FixedSize, Read, ReadExt, Write};
use commonware_cryptography::{sha256, Hasher, Sha256};
use commonware_utils::hex;
use futures::channel::mpsc;
use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{Arc, Mutex, Weak},
};

/// Largest value carried inline by a digest instead of being stored as a piece.
pub const MAX_INLINE_SIZE: usize = 64;

/// Priority of a stored value: eager values travel with their tree, lazy values are
/// fetched on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Eager,
    Lazy,
}

impl Write for Priority {
    fn write(&self, buf: &mut impl BufMut) {
        let tag: u8 = match self {
            Self::Eager => 0,
            Self::Lazy => 1,
        };
        tag.write(buf);
    }
}

impl EncodeSize for Priority {
    fn encode_size(&self) -> usize {
        u8::SIZE
    }
}

impl Read for Priority {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        match u8::read(buf)? {
            0 => Ok(Self::Eager),
            1 => Ok(Self::Lazy),
            i => Err(CodecError::InvalidEnum(i)),
        }
    }
}

/// Content address of a piece.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectDigest {
    /// The value itself, for content at most [MAX_INLINE_SIZE] bytes.
    Inline(Bytes),
    /// Sha-256 of the piece bytes.
    Hash(sha256::Digest),
}

impl ObjectDigest {
    /// Compute the digest of `content`.
    pub fn for_content(content: &[u8]) -> Self {
        if content.len() <= MAX_INLINE_SIZE {
            return Self::Inline(Bytes::copy_from_slice(content));
        }
        let mut hasher = Sha256::new();
        hasher.update(content);
        Self::Hash(hasher.finalize())
    }

    /// Compute a digest that always hashes, even for short content.
    ///
    /// Tree nodes use this: their reference rows must exist on disk for garbage
    /// collection, so they are stored as pieces regardless of size.
    pub fn hash_of(content: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(content);
        Self::Hash(hasher.finalize())
    }

    /// Whether `content` is the value this digest addresses.
    pub fn matches(&self, content: &[u8]) -> bool {
        match self {
            Self::Inline(bytes) => bytes == content,
            Self::Hash(digest) => {
                let mut hasher = Sha256::new();
                hasher.update(content);
                hasher.finalize() == *digest
            }
        }
    }

    /// Whether the digest carries its value inline.
    pub fn is_inlined(&self) -> bool {
        matches!(self, Self::Inline(_))
    }

    /// Serialized form, usable as a db row-key component.
    pub fn to_key(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.encode_size());
        self.write(&mut key);
        key
    }
}

impl Write for ObjectDigest {
    fn write(&self, buf: &mut impl BufMut) {
        match self {
            Self::Inline(bytes) => {
                0u8.write(buf);
                (bytes.len() as u8).write(buf);
                buf.put_slice(bytes);
            }
            Self::Hash(digest) => {
                1u8.write(buf);
                digest.write(buf);
            }
        }
    }
}

impl EncodeSize for ObjectDigest {
    fn encode_size(&self) -> usize {
        match self {
            Self::Inline(bytes) => u8::SIZE + u8::SIZE + bytes.len(),
            Self::Hash(_) => u8::SIZE + sha256::Digest::SIZE,
        }
    }
}

impl Read for ObjectDigest {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        match u8::read(buf)? {
            0 => {
                let len = u8::read(buf)? as usize;
                if len > MAX_INLINE_SIZE {
                    return Err(CodecError::Invalid("ObjectDigest", "inline too large"));
                }
                if buf.remaining() < len {
                    return Err(CodecError::EndOfBuffer);
                }
                let mut content = vec![0u8; len];
                buf.copy_to_slice(&mut content);
                Ok(Self::Inline(content.into()))
            }
            1 => Ok(Self::Hash(sha256::Digest::read(buf)?)),
            i => Err(CodecError::InvalidEnum(i)),
        }
    }
}

impl fmt::Debug for ObjectDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for ObjectDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inline(bytes) => write!(f, "inline:{}", hex(bytes)),
            Self::Hash(digest) => write!(f, "{digest}"),
        }
    }
}

struct FactoryState {
    // Live identifier count per digest. Absent means untracked.
    counts: HashMap<ObjectDigest, usize>,
    // Digests with a deletion transaction in flight.
    pending_deletions: HashSet<ObjectDigest>,
    // Receives digests whose live count dropped to zero.
    untracked: Option<mpsc::UnboundedSender<ObjectDigest>>,
}

/// Allocates [ObjectIdentifier]s and tracks, per digest, how many are alive.
///
/// The factory is the single authority on whether a digest may be deleted: a deletion
/// transaction only starts while the live count is zero, and only completes if no
/// identifier was allocated in between.
#[derive(Clone)]
pub struct ObjectIdentifierFactory {
    state: Arc<Mutex<FactoryState>>,
}

impl ObjectIdentifierFactory {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FactoryState {
                counts: HashMap::new(),
                pending_deletions: HashSet::new(),
                untracked: None,
            })),
        }
    }

    /// Route untracked-digest notifications to `sender`.
    ///
    /// Whenever the last live identifier for a non-inline digest is dropped, the digest
    /// is sent on this channel so the owner can attempt collection.
    pub fn set_untracked_channel(&self, sender: mpsc::UnboundedSender<ObjectDigest>) {
        self.state.lock().unwrap().untracked = Some(sender);
    }

    /// Allocate a live identifier for `digest`.
    ///
    /// Aborts any in-flight deletion transaction for the digest.
    pub fn make_identifier(&self, key_index: u32, digest: ObjectDigest) -> ObjectIdentifier {
        if digest.is_inlined() {
            // Inline digests never touch storage, so there is nothing to track.
            return ObjectIdentifier {
                key_index,
                digest,
                factory: Weak::new(),
            };
        }
        let mut state = self.state.lock().unwrap();
        state.pending_deletions.remove(&digest);
        *state.counts.entry(digest.clone()).or_insert(0) += 1;
        ObjectIdentifier {
            key_index,
            digest,
            factory: Arc::downgrade(&self.state),
        }
    }

    /// Number of live identifiers for `digest`.
    pub fn live_count(&self, digest: &ObjectDigest) -> usize {
        self.state
            .lock()
            .unwrap()
            .counts
            .get(digest)
            .copied()
            .unwrap_or(0)
    }

    /// Number of digests with at least one live identifier.
    pub fn tracked(&self) -> usize {
        self.state.lock().unwrap().counts.len()
    }

    /// Begin a deletion transaction for `digest`.
    ///
    /// Succeeds only if no identifier is alive and no transaction is already pending.
    pub fn start_deletion(&self, digest: &ObjectDigest) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.counts.contains_key(digest) || state.pending_deletions.contains(digest) {
            return false;
        }
        state.pending_deletions.insert(digest.clone());
        true
    }

    /// Finish a deletion transaction for `digest`.
    ///
    /// Returns true if the transaction is still valid, in which case the caller owns
    /// the actual removal of stored bytes. Returns false if an identifier was allocated
    /// since [Self::start_deletion]; the caller must restart from scratch.
    pub fn complete_deletion(&self, digest: &ObjectDigest) -> bool {
        self.state.lock().unwrap().pending_deletions.remove(digest)
    }

    /// Abandon a deletion transaction without deleting anything.
    pub fn abort_deletion(&self, digest: &ObjectDigest) {
        self.state.lock().unwrap().pending_deletions.remove(digest);
    }
}

impl Default for ObjectIdentifierFactory {
    fn default() -> Self {
        Self::new()
    }
}

/// A live, counted reference to a content-addressed piece.
///
/// `key_index` names the encryption key the piece was written under; identifiers with
/// the same digest but different key indices address the same bytes. The identifier
/// keeps a non-owning handle to its factory: if the factory is gone, drops and clones
/// degrade to plain value semantics instead of dangling.
pub struct ObjectIdentifier {
    key_index: u32,
    digest: ObjectDigest,
    factory: Weak<Mutex<FactoryState>>,
}

impl ObjectIdentifier {
    pub fn key_index(&self) -> u32 {
        self.key_index
    }

    pub fn digest(&self) -> &ObjectDigest {
        &self.digest
    }

    /// Serialized `(key_index, digest)`, usable as a db row-key component.
    pub fn to_key(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.encode_size());
        self.write(&mut key);
        key
    }
}

impl Write for ObjectIdentifier {
    fn write(&self, buf: &mut impl BufMut) {
        self.key_index.write(buf);
        self.digest.write(buf);
    }
}

impl EncodeSize for ObjectIdentifier {
    fn encode_size(&self) -> usize {
        u32::SIZE + self.digest.encode_size()
    }
}

/// Decode an identifier written by [Write], re-attaching it to `factory`.
pub fn read_identifier(
    buf: &mut impl Buf,
    factory: &ObjectIdentifierFactory,
) -> Result<ObjectIdentifier, CodecError> {
    let key_index = u32::read(buf)?;
    let digest = ObjectDigest::read(buf)?;
    Ok(factory.make_identifier(key_index, digest))
}

impl Clone for ObjectIdentifier {
    fn clone(&self) -> Self {
        if let Some(state) = self.factory.upgrade() {
            let mut state = state.lock().unwrap();
            *state.counts.entry(self.digest.clone()).or_insert(0) += 1;
        }
        Self {
            key_index: self.key_index,
            digest: self.digest.clone(),
            factory: self.factory.clone(),
        }
    }
}

impl Drop for ObjectIdentifier {
    fn drop(&mut self) {
        let Some(state) = self.factory.upgrade() else {
            return;
        };
        let mut state = state.lock().unwrap();
        let Some(count) = state.counts.get_mut(&self.digest) else {
            return;
        };
        *count -= 1;
        if *count > 0 {
            return;
        }
        state.counts.remove(&self.digest);
        if let Some(untracked) = &state.untracked {
            // The receiver being gone just means nobody collects anymore.
            let _ = untracked.unbounded_send(self.digest.clone());
        }
    }
}

impl PartialEq for ObjectIdentifier {
    fn eq(&self, other: &Self) -> bool {
        self.key_index == other.key_index && self.digest == other.digest
    }
}

impl Eq for ObjectIdentifier {}

impl PartialOrd for ObjectIdentifier {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ObjectIdentifier {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.key_index, &self.digest).cmp(&(other.key_index, &other.digest))
    }
}

impl std::hash::Hash for ObjectIdentifier {
    fn hash<H: std::hash::Hasher>(&self, hasher: &mut H) {
        self.key_index.hash(hasher);
        self.digest.hash(hasher);
    }
}

impl fmt::Debug for ObjectIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectIdentifier({}, {})", self.key_index, self.digest)
    }
}

impl fmt::Display for ObjectIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.key_index, self.digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{FutureExt, StreamExt};

    fn hash_digest(content: &[u8]) -> ObjectDigest {
        let mut padded = content.to_vec();
        padded.resize(MAX_INLINE_SIZE + 1, 0xab);
        ObjectDigest::for_content(&padded)
    }

    #[test]
    fn test_inline_boundary() {
        let small = ObjectDigest::for_content(&[0u8; MAX_INLINE_SIZE]);
        assert!(small.is_inlined());
        let large = ObjectDigest::for_content(&[0u8; MAX_INLINE_SIZE + 1]);
        assert!(!large.is_inlined());
    }

    #[test]
    fn test_live_counting() {
        let factory = ObjectIdentifierFactory::new();
        let digest = hash_digest(b"piece");

        let a = factory.make_identifier(0, digest.clone());
        assert_eq!(factory.live_count(&digest), 1);
        let b = a.clone();
        assert_eq!(factory.live_count(&digest), 2);
        drop(a);
        assert_eq!(factory.live_count(&digest), 1);
        drop(b);
        assert_eq!(factory.live_count(&digest), 0);
        assert_eq!(factory.tracked(), 0);
    }

    #[test]
    fn test_inline_identifiers_untracked() {
        let factory = ObjectIdentifierFactory::new();
        let digest = ObjectDigest::for_content(b"tiny");
        let id = factory.make_identifier(0, digest.clone());
        assert_eq!(factory.live_count(&digest), 0);
        drop(id);
        assert_eq!(factory.tracked(), 0);
    }

    #[test]
    fn test_deletion_requires_zero_live() {
        let factory = ObjectIdentifierFactory::new();
        let digest = hash_digest(b"piece");

        let id = factory.make_identifier(0, digest.clone());
        assert!(!factory.start_deletion(&digest));
        drop(id);
        assert!(factory.start_deletion(&digest));
        // A second transaction for the same digest is rejected.
        assert!(!factory.start_deletion(&digest));
        assert!(factory.complete_deletion(&digest));
        // The transaction is consumed.
        assert!(!factory.complete_deletion(&digest));
    }

    #[test]
    fn test_reallocation_aborts_deletion() {
        let factory = ObjectIdentifierFactory::new();
        let digest = hash_digest(b"piece");

        assert!(factory.start_deletion(&digest));
        // An identifier allocated mid-transaction invalidates it.
        let id = factory.make_identifier(0, digest.clone());
        assert!(!factory.complete_deletion(&digest));
        drop(id);

        // A fresh transaction succeeds once the identifier is gone again.
        assert!(factory.start_deletion(&digest));
        assert!(factory.complete_deletion(&digest));
    }

    #[test]
    fn test_untracked_notification() {
        let factory = ObjectIdentifierFactory::new();
        let (tx, mut rx) = mpsc::unbounded();
        factory.set_untracked_channel(tx);

        let digest = hash_digest(b"piece");
        let a = factory.make_identifier(0, digest.clone());
        let b = a.clone();
        drop(a);
        assert!(rx.try_next().is_err()); // still live
        drop(b);
        let notified = rx.next().now_or_never().flatten().unwrap();
        assert_eq!(notified, digest);
    }

    #[test]
    fn test_identifier_survives_factory_teardown() {
        let digest = hash_digest(b"piece");
        let id = {
            let factory = ObjectIdentifierFactory::new();
            factory.make_identifier(3, digest.clone())
        };
        // The factory is gone; clone and drop degrade to value semantics.
        let copy = id.clone();
        assert_eq!(copy.key_index(), 3);
        assert_eq!(copy.digest(), &digest);
        drop(copy);
        drop(id);
    }

    #[test]
    fn test_codec_round_trip() {
        let factory = ObjectIdentifierFactory::new();
        for digest in [hash_digest(b"a"), ObjectDigest::for_content(b"b")] {
            let id = factory.make_identifier(7, digest);
            let encoded = id.to_key();
            let decoded = read_identifier(&mut encoded.as_slice(), &factory).unwrap();
            assert_eq!(decoded, id);
        }
    }
}

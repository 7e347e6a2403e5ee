//! Row-key layout of a page inside the key-value store.
//!
//! Digest components are self-delimiting (tag byte plus fixed or length-prefixed
//! content), so concatenated keys never collide across prefixes.

use crate::{commit::CommitId, object::ObjectDigest};

pub const HEADS: &[u8] = b"heads/";
pub const COMMITS: &[u8] = b"commits/";
pub const UNSYNCED_COMMITS: &[u8] = b"unsynced/commits/";
pub const OBJECTS: &[u8] = b"objects/";
pub const UNSYNCED_PIECES: &[u8] = b"unsynced/pieces/";
pub const OBJECT_REFS: &[u8] = b"refs/object/";
pub const INBOUND_REFS: &[u8] = b"refs/inbound/";
pub const COMMIT_REFS: &[u8] = b"refs/commit/";
pub const SYNC_METADATA: &[u8] = b"sync/metadata/";

fn join(prefix: &[u8], parts: &[&[u8]]) -> Vec<u8> {
    let mut key = prefix.to_vec();
    for part in parts {
        key.extend_from_slice(part);
    }
    key
}

pub fn head(id: &CommitId) -> Vec<u8> {
    join(HEADS, &[id.as_ref()])
}

pub fn commit(id: &CommitId) -> Vec<u8> {
    join(COMMITS, &[id.as_ref()])
}

pub fn unsynced_commit(id: &CommitId) -> Vec<u8> {
    join(UNSYNCED_COMMITS, &[id.as_ref()])
}

pub fn object(name: &[u8]) -> Vec<u8> {
    join(OBJECTS, &[name])
}

pub fn unsynced_piece(digest: &ObjectDigest) -> Vec<u8> {
    join(UNSYNCED_PIECES, &[&digest.to_key()])
}

/// Prefix of all outbound references owned by `source`.
pub fn object_refs_prefix(source: &ObjectDigest) -> Vec<u8> {
    join(OBJECT_REFS, &[&source.to_key(), b"/"])
}

pub fn object_ref(source: &ObjectDigest, destination: &ObjectDigest) -> Vec<u8> {
    join(
        OBJECT_REFS,
        &[&source.to_key(), b"/", &destination.to_key()],
    )
}

/// Prefix of all inbound references pointing at `destination`.
pub fn inbound_refs_prefix(destination: &ObjectDigest) -> Vec<u8> {
    join(INBOUND_REFS, &[&destination.to_key(), b"/"])
}

pub fn inbound_ref(destination: &ObjectDigest, source: &ObjectDigest) -> Vec<u8> {
    join(
        INBOUND_REFS,
        &[&destination.to_key(), b"/", &source.to_key()],
    )
}

/// Prefix of all commits whose root is `root`.
pub fn commit_refs_prefix(root: &ObjectDigest) -> Vec<u8> {
    join(COMMIT_REFS, &[&root.to_key(), b"/"])
}

pub fn commit_ref(root: &ObjectDigest, id: &CommitId) -> Vec<u8> {
    join(COMMIT_REFS, &[&root.to_key(), b"/", id.as_ref()])
}

pub fn sync_metadata(key: &[u8]) -> Vec<u8> {
    join(SYNC_METADATA, &[key])
}

//! The consumed surface of the B-tree library: entry encoding, diff application, and
//! reference extraction.
//!
//! The page store only relies on three things from its tree: applying a set of changes
//! to a base root yields a deterministic new root, a root can be read back as entries,
//! and a root reports which object identifiers it references. The node layout here is
//! a single flat, sorted, content-addressed node; the real multi-node layout is an
//! external concern and deliberately not part of this contract.

use crate::object::{
    read_identifier, ObjectDigest, ObjectIdentifier, ObjectIdentifierFactory, Priority,
};
use bytes::{Buf, BufMut};
use commonware_codec::{Error as CodecError, Read, ReadExt, Write};
use commonware_cryptography::{Hasher, Sha256};
use std::collections::BTreeMap;

/// Length of a derived entry id.
pub const ENTRY_ID_SIZE: usize = 16;

/// Domain separator for entry-id derivation.
const ENTRY_ID_NAMESPACE: &[u8] = b"pagestore/entry-id";

/// One keyed value in a tree node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Vec<u8>,
    pub value: ObjectIdentifier,
    pub priority: Priority,
    /// Deterministic per (key, value digest, priority); never secret.
    pub entry_id: Vec<u8>,
}

/// A single tree mutation inside a diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryChange {
    pub operation: ChangeOperation,
    pub entry: Entry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChangeOperation {
    Deletion,
    Insertion,
}

/// A diff against a base commit's tree, as produced by the cloud.
#[derive(Debug, Clone)]
pub struct TreeDiff {
    pub base: crate::commit::CommitId,
    pub changes: Vec<EntryChange>,
}

/// Derive the deterministic entry id for `(key, value, priority)`.
///
/// Two devices writing the same content under the same key derive the same id, which
/// is what makes independently-built merge trees byte-identical.
pub fn entry_id(key: &[u8], value: &ObjectIdentifier, priority: Priority) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(ENTRY_ID_NAMESPACE);
    hasher.update(&(key.len() as u64).to_be_bytes());
    hasher.update(key);
    hasher.update(&value.to_key());
    hasher.update(&[match priority {
        Priority::Eager => 0,
        Priority::Lazy => 1,
    }]);
    hasher.finalize().as_ref()[..ENTRY_ID_SIZE].to_vec()
}

/// Build an [Entry], deriving its id.
pub fn make_entry(key: Vec<u8>, value: ObjectIdentifier, priority: Priority) -> Entry {
    let entry_id = entry_id(&key, &value, priority);
    Entry {
        key,
        value,
        priority,
        entry_id,
    }
}

/// Encode a node from entries. Entries must be handed over sorted by key; the caller
/// keeps them in an ordered map.
pub fn encode_node(entries: &[Entry]) -> Vec<u8> {
    let mut buf = Vec::new();
    (entries.len() as u32).write(&mut buf);
    for entry in entries {
        (entry.key.len() as u32).write(&mut buf);
        buf.put_slice(&entry.key);
        entry.value.write(&mut buf);
        entry.priority.write(&mut buf);
        (entry.entry_id.len() as u8).write(&mut buf);
        buf.put_slice(&entry.entry_id);
    }
    buf
}

/// Decode a node back into entries, re-attaching value identifiers to `factory`.
pub fn decode_node(
    bytes: &[u8],
    factory: &ObjectIdentifierFactory,
) -> Result<Vec<Entry>, CodecError> {
    let mut buf = bytes;
    let count = u32::read(&mut buf)? as usize;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let key_len = u32::read(&mut buf)? as usize;
        let key = read_bytes(&mut buf, key_len)?;
        let value = read_identifier(&mut buf, factory)?;
        let priority = Priority::read(&mut buf)?;
        let id_len = u8::read(&mut buf)? as usize;
        let entry_id = read_bytes(&mut buf, id_len)?;
        entries.push(Entry {
            key,
            value,
            priority,
            entry_id,
        });
    }
    if buf.remaining() != 0 {
        return Err(CodecError::ExtraData(buf.remaining()));
    }
    Ok(entries)
}

fn read_bytes(buf: &mut impl Buf, len: usize) -> Result<Vec<u8>, CodecError> {
    if buf.remaining() < len {
        return Err(CodecError::EndOfBuffer);
    }
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    Ok(bytes)
}

/// Apply diff changes to base entries, producing the new sorted entry set.
pub fn apply_changes(base: Vec<Entry>, changes: &[EntryChange]) -> Vec<Entry> {
    let mut entries: BTreeMap<Vec<u8>, Entry> =
        base.into_iter().map(|e| (e.key.clone(), e)).collect();
    for change in changes {
        match change.operation {
            ChangeOperation::Insertion => {
                entries.insert(change.entry.key.clone(), change.entry.clone());
            }
            ChangeOperation::Deletion => {
                entries.remove(&change.entry.key);
            }
        }
    }
    entries.into_values().collect()
}

/// The `(digest, priority)` pairs a node points at, excluding inline values that never
/// touch storage.
pub fn node_references(entries: &[Entry]) -> Vec<(ObjectDigest, Priority)> {
    entries
        .iter()
        .filter(|e| !e.value.digest().is_inlined())
        .map(|e| (e.value.digest().clone(), e.priority))
        .collect()
}

//! Diff normalization and entry payload codec.

use crate::{
    cloud::{DiffEntry, DiffOperation},
    Error,
};
use bytes::Buf;
use commonware_codec::{Error as CodecError, Read, ReadExt, Write};
use pagestore_storage::{ObjectDigest, ObjectIdentifier, ObjectIdentifierFactory, Priority};
use std::collections::HashMap;

/// Normalize a cloud diff.
///
/// Insertions and deletions for the same entry id cancel pairwise. A residual count
/// other than -1, 0, or +1 per id means the diff is ambiguous and is rejected: the
/// cloud must not learn anything about local entries beyond what it already encoded,
/// so nothing is guessed. Surviving changes are sorted by `(key, deletion before
/// insertion, entry id)`, which makes the output invariant under input order and is
/// the exact order the tree patcher requires.
pub fn normalize_diff(entries: Vec<DiffEntry>) -> Result<Vec<DiffEntry>, Error> {
    struct Tally {
        count: i64,
        insertion: Option<DiffEntry>,
        deletion: Option<DiffEntry>,
    }
    let mut tallies: HashMap<Vec<u8>, Tally> = HashMap::new();
    for entry in entries {
        let tally = tallies.entry(entry.entry_id.clone()).or_insert(Tally {
            count: 0,
            insertion: None,
            deletion: None,
        });
        match entry.operation {
            DiffOperation::Insertion => {
                tally.count += 1;
                tally.insertion.get_or_insert(entry);
            }
            DiffOperation::Deletion => {
                tally.count -= 1;
                tally.deletion.get_or_insert(entry);
            }
        }
    }

    let mut normalized = Vec::new();
    for (_, tally) in tallies {
        let survivor = match tally.count {
            0 => continue,
            1 => tally.insertion,
            -1 => tally.deletion,
            _ => return Err(Error::AmbiguousDiff),
        };
        // A nonzero residual implies at least one instance of that operation.
        let Some(survivor) = survivor else {
            return Err(Error::AmbiguousDiff);
        };
        normalized.push(survivor);
    }
    normalized.sort_by(|a, b| {
        (&a.key, a.operation, &a.entry_id).cmp(&(&b.key, b.operation, &b.entry_id))
    });
    Ok(normalized)
}

/// Encode the plaintext entry payload carried inside a diff: the value identifier's
/// parts and the entry priority.
pub fn encode_entry_payload(
    key_index: u32,
    digest: &ObjectDigest,
    priority: Priority,
) -> Vec<u8> {
    let mut buf = Vec::new();
    key_index.write(&mut buf);
    digest.write(&mut buf);
    priority.write(&mut buf);
    buf
}

/// Decode an entry payload, materializing the identifier through `factory`.
pub fn decode_entry_payload(
    bytes: &[u8],
    factory: &ObjectIdentifierFactory,
) -> Result<(ObjectIdentifier, Priority), CodecError> {
    let mut buf = bytes;
    let key_index = u32::read(&mut buf)?;
    let digest = ObjectDigest::read(&mut buf)?;
    let priority = Priority::read(&mut buf)?;
    if buf.remaining() != 0 {
        return Err(CodecError::ExtraData(buf.remaining()));
    }
    Ok((factory.make_identifier(key_index, digest), priority))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

    fn insertion(id: u8, key: &[u8]) -> DiffEntry {
        DiffEntry {
            entry_id: vec![id],
            operation: DiffOperation::Insertion,
            key: key.to_vec(),
            payload: Bytes::from_static(b"payload"),
        }
    }

    fn deletion(id: u8, key: &[u8]) -> DiffEntry {
        DiffEntry {
            entry_id: vec![id],
            operation: DiffOperation::Deletion,
            key: key.to_vec(),
            payload: Bytes::from_static(b"payload"),
        }
    }

    #[test]
    fn test_pairwise_cancellation() {
        let normalized = normalize_diff(vec![
            insertion(1, b"a"),
            deletion(1, b"a"),
            insertion(2, b"b"),
        ])
        .unwrap();
        assert_eq!(normalized, vec![insertion(2, b"b")]);
    }

    #[test]
    fn test_deletion_sorts_before_insertion() {
        let normalized =
            normalize_diff(vec![insertion(1, b"k"), deletion(2, b"k"), insertion(3, b"a")])
                .unwrap();
        assert_eq!(
            normalized,
            vec![insertion(3, b"a"), deletion(2, b"k"), insertion(1, b"k")]
        );
    }

    #[test]
    fn test_ambiguous_residual_rejected() {
        assert!(matches!(
            normalize_diff(vec![insertion(1, b"a"), insertion(1, b"a")]),
            Err(Error::AmbiguousDiff)
        ));
        assert!(matches!(
            normalize_diff(vec![deletion(1, b"a"), deletion(1, b"a"), deletion(1, b"a")]),
            Err(Error::AmbiguousDiff)
        ));
    }

    #[test]
    fn test_shuffle_invariance() {
        let entries = vec![
            insertion(1, b"a"),
            deletion(1, b"a"),
            insertion(2, b"b"),
            deletion(3, b"b"),
            insertion(4, b"c"),
            deletion(4, b"c"),
            insertion(4, b"c"),
            insertion(5, b"d"),
        ];
        let expected = normalize_diff(entries.clone()).unwrap();
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..32 {
            let mut shuffled = entries.clone();
            shuffled.shuffle(&mut rng);
            assert_eq!(normalize_diff(shuffled).unwrap(), expected);
        }
    }

    #[test]
    fn test_payload_round_trip() {
        let factory = ObjectIdentifierFactory::new();
        let digest = ObjectDigest::for_content(b"value");
        let encoded = encode_entry_payload(3, &digest, Priority::Lazy);
        let (identifier, priority) = decode_entry_payload(&encoded, &factory).unwrap();
        assert_eq!(identifier.key_index(), 3);
        assert_eq!(identifier.digest(), &digest);
        assert_eq!(priority, Priority::Lazy);
    }
}

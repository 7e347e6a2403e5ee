//! In-memory [Db] engine backed by an ordered map.

use super::{Batch, Db, Error, Op};
use bytes::Bytes;
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

struct State {
    rows: BTreeMap<Vec<u8>, Bytes>,
    // Number of upcoming `apply` calls that fail with an io error (test hook).
    fail_batches: usize,
}

/// An ordered in-memory key-value engine.
///
/// Cheap to clone; all clones share the same underlying map. Reads take a snapshot
/// under the lock, so prefix scans are stable even if a batch lands mid-iteration
/// of the result.
#[derive(Clone)]
pub struct Memory {
    state: Arc<Mutex<State>>,
}

impl Memory {
    /// Create an empty engine.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                rows: BTreeMap::new(),
                fail_batches: 0,
            })),
        }
    }

    /// Make the next `count` calls to [Db::apply] fail with an io error.
    pub fn fail_next_batches(&self, count: usize) {
        self.state.lock().unwrap().fail_batches = count;
    }

    /// Number of rows currently stored.
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().rows.len()
    }

    /// Whether no rows are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}

impl Db for Memory {
    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>, Error> {
        Ok(self.state.lock().unwrap().rows.get(key).cloned())
    }

    async fn has_key(&self, key: &[u8]) -> Result<bool, Error> {
        Ok(self.state.lock().unwrap().rows.contains_key(key))
    }

    async fn has_prefix(&self, prefix: &[u8]) -> Result<bool, Error> {
        let state = self.state.lock().unwrap();
        Ok(state
            .rows
            .range(prefix.to_vec()..)
            .next()
            .map(|(k, _)| k.starts_with(prefix))
            .unwrap_or(false))
    }

    async fn get_by_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Bytes)>, Error> {
        let state = self.state.lock().unwrap();
        Ok(state
            .rows
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn apply(&self, batch: Batch) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if state.fail_batches > 0 {
            state.fail_batches -= 1;
            return Err(Error::Io("injected batch failure".to_string()));
        }
        for op in batch.into_ops() {
            match op {
                Op::Put(key, value) => {
                    state.rows.insert(key, value);
                }
                Op::Delete(key) => {
                    state.rows.remove(&key);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_runtime::{deterministic, Runner as _};

    #[test]
    fn test_batch_atomicity() {
        let runner = deterministic::Runner::default();
        runner.start(|_| async move {
            let db = Memory::new();
            let mut batch = Batch::new();
            batch.put(b"a".to_vec(), Bytes::from_static(b"1"));
            batch.put(b"b".to_vec(), Bytes::from_static(b"2"));
            db.apply(batch).await.unwrap();
            assert_eq!(db.get(b"a").await.unwrap(), Some(Bytes::from_static(b"1")));

            // An injected failure leaves the map untouched.
            db.fail_next_batches(1);
            let mut batch = Batch::new();
            batch.delete(b"a".to_vec());
            assert!(db.apply(batch).await.is_err());
            assert!(db.has_key(b"a").await.unwrap());
        });
    }

    #[test]
    fn test_prefix_scan() {
        let runner = deterministic::Runner::default();
        runner.start(|_| async move {
            let db = Memory::new();
            let mut batch = Batch::new();
            batch.put(b"commits/1".to_vec(), Bytes::from_static(b"x"));
            batch.put(b"commits/2".to_vec(), Bytes::from_static(b"y"));
            batch.put(b"objects/1".to_vec(), Bytes::from_static(b"z"));
            db.apply(batch).await.unwrap();

            let rows = db.get_by_prefix(b"commits/").await.unwrap();
            assert_eq!(rows.len(), 2);
            assert_eq!(rows[0].0, b"commits/1".to_vec());
            assert!(db.has_prefix(b"objects/").await.unwrap());
            assert!(!db.has_prefix(b"refs/").await.unwrap());
        });
    }
}

//! Ordered key-value abstraction consumed by the page store.
//!
//! The production engine behind this trait is an external collaborator; the in-memory
//! [memory::Memory] engine backs tests and small pages. All reads of a prefix return a
//! point-in-time snapshot: mutations applied after the call do not leak into the result.

use bytes::Bytes;
use std::future::Future;
use thiserror::Error;

pub mod memory;

/// Errors that can occur when interacting with a [Db].
#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    Io(String),
}

/// A single staged mutation inside a [Batch].
#[derive(Debug, Clone)]
enum Op {
    Put(Vec<u8>, Bytes),
    Delete(Vec<u8>),
}

/// An ordered set of mutations applied atomically by [Db::apply].
#[derive(Debug, Default, Clone)]
pub struct Batch {
    ops: Vec<Op>,
}

impl Batch {
    /// Create an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a put.
    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: Bytes) {
        self.ops.push(Op::Put(key.into(), value));
    }

    /// Stage a delete.
    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.ops.push(Op::Delete(key.into()));
    }

    /// Whether any mutations are staged.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    fn into_ops(self) -> Vec<Op> {
        self.ops
    }
}

/// Ordered key-value store with atomic batched writes and prefix scans.
pub trait Db: Clone + Send + Sync + 'static {
    /// Get the value stored under `key`.
    fn get(&self, key: &[u8]) -> impl Future<Output = Result<Option<Bytes>, Error>> + Send;

    /// Whether `key` is present.
    fn has_key(&self, key: &[u8]) -> impl Future<Output = Result<bool, Error>> + Send;

    /// Whether any key starts with `prefix`.
    fn has_prefix(&self, prefix: &[u8]) -> impl Future<Output = Result<bool, Error>> + Send;

    /// Snapshot of all `(key, value)` pairs whose key starts with `prefix`, in key order.
    fn get_by_prefix(
        &self,
        prefix: &[u8],
    ) -> impl Future<Output = Result<Vec<(Vec<u8>, Bytes)>, Error>> + Send;

    /// Apply all mutations in `batch` atomically.
    fn apply(&self, batch: Batch) -> impl Future<Output = Result<(), Error>> + Send;
}

//! The encryption collaborator: commit and object content is opaque to the cloud.
//!
//! The real service lives in another process; the page store only needs the narrow
//! async surface below. [Plaintext] is the identity implementation used by tests and
//! unencrypted pages.

use crate::{commit::CommitId, object::ObjectDigest, Error};
use bytes::Bytes;
use commonware_cryptography::{Hasher, Sha256};
use std::future::Future;

/// Encrypts and decrypts everything that leaves the local store.
pub trait EncryptionService: Clone + Send + Sync + 'static {
    /// Key index new pieces are written under.
    fn key_index(&self) -> u32;

    /// Encrypt commit storage bytes.
    fn encrypt_commit(&self, bytes: Bytes) -> impl Future<Output = Result<Bytes, Error>> + Send;

    /// Decrypt commit storage bytes.
    fn decrypt_commit(&self, bytes: Bytes) -> impl Future<Output = Result<Bytes, Error>> + Send;

    /// Encrypt piece bytes written under `key_index`.
    fn encrypt_object(
        &self,
        key_index: u32,
        bytes: Bytes,
    ) -> impl Future<Output = Result<Bytes, Error>> + Send;

    /// Decrypt piece bytes.
    fn decrypt_object(
        &self,
        key_index: u32,
        bytes: Bytes,
    ) -> impl Future<Output = Result<Bytes, Error>> + Send;

    /// The obfuscated name a piece is stored and uploaded under.
    fn get_object_name(
        &self,
        digest: &ObjectDigest,
    ) -> impl Future<Output = Result<Vec<u8>, Error>> + Send;

    /// The remote (cloud-visible) encoding of a commit id.
    fn encode_commit_id(
        &self,
        id: &CommitId,
    ) -> impl Future<Output = Result<Vec<u8>, Error>> + Send;

    /// Encrypt an entry payload carried inside a cloud diff.
    fn encrypt_entry_payload(
        &self,
        bytes: Bytes,
    ) -> impl Future<Output = Result<Bytes, Error>> + Send;

    /// Decrypt an entry payload carried inside a cloud diff.
    fn decrypt_entry_payload(
        &self,
        bytes: Bytes,
    ) -> impl Future<Output = Result<Bytes, Error>> + Send;
}

/// Identity encryption: content passes through unchanged, names and remote ids are
/// still domain-separated hashes so storage keys never collide with raw content.
#[derive(Clone, Default)]
pub struct Plaintext;

impl Plaintext {
    pub fn new() -> Self {
        Self
    }
}

impl EncryptionService for Plaintext {
    fn key_index(&self) -> u32 {
        0
    }

    async fn encrypt_commit(&self, bytes: Bytes) -> Result<Bytes, Error> {
        Ok(bytes)
    }

    async fn decrypt_commit(&self, bytes: Bytes) -> Result<Bytes, Error> {
        Ok(bytes)
    }

    async fn encrypt_object(&self, _key_index: u32, bytes: Bytes) -> Result<Bytes, Error> {
        Ok(bytes)
    }

    async fn decrypt_object(&self, _key_index: u32, bytes: Bytes) -> Result<Bytes, Error> {
        Ok(bytes)
    }

    async fn get_object_name(&self, digest: &ObjectDigest) -> Result<Vec<u8>, Error> {
        let mut hasher = Sha256::new();
        hasher.update(b"pagestore/object-name");
        hasher.update(&digest.to_key());
        Ok(hasher.finalize().as_ref().to_vec())
    }

    async fn encode_commit_id(&self, id: &CommitId) -> Result<Vec<u8>, Error> {
        let mut hasher = Sha256::new();
        hasher.update(b"pagestore/remote-commit-id");
        hasher.update(id.as_ref());
        Ok(hasher.finalize().as_ref().to_vec())
    }

    async fn encrypt_entry_payload(&self, bytes: Bytes) -> Result<Bytes, Error> {
        Ok(bytes)
    }

    async fn decrypt_entry_payload(&self, bytes: Bytes) -> Result<Bytes, Error> {
        Ok(bytes)
    }
}

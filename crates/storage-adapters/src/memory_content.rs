//! In-memory content-addressed blob store.
//!
//! Blocks are addressed by hex SHA-256. A store can be linked to other
//! stores it will fetch from on a local miss, which is how peers in one
//! process exchange post bodies and attachments.

use std::sync::{Arc, RwLock, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use domains::{sha256_hex, ContentHash, ContentStore, DomainError, Result};
use tracing::{debug, trace};

#[derive(Debug, Default)]
pub struct MemoryContentStore {
    blocks: DashMap<ContentHash, Bytes>,
    pins: DashSet<ContentHash>,
    remotes: RwLock<Vec<Weak<MemoryContentStore>>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lets this store fetch blocks it does not have from `remote`.
    pub fn add_remote(&self, remote: &Arc<MemoryContentStore>) -> Result<()> {
        let mut remotes = self
            .remotes
            .write()
            .map_err(|_| DomainError::Internal("remote list poisoned".into()))?;
        remotes.push(Arc::downgrade(remote));
        Ok(())
    }

    /// Stores bytes under an arbitrary address without hashing them.
    /// Simulates a peer serving corrupted content.
    pub fn insert_unchecked(&self, hash: impl Into<ContentHash>, data: Bytes) {
        self.blocks.insert(hash.into(), data);
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.blocks.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    fn local(&self, hash: &str) -> Option<Bytes> {
        self.blocks.get(hash).map(|b| b.value().clone())
    }

    fn fetch_remote(&self, hash: &str) -> Result<Option<Bytes>> {
        let remotes = self
            .remotes
            .read()
            .map_err(|_| DomainError::Internal("remote list poisoned".into()))?;
        Ok(remotes
            .iter()
            .filter_map(Weak::upgrade)
            .find_map(|remote| remote.local(hash)))
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn put(&self, data: Bytes) -> Result<ContentHash> {
        let hash = sha256_hex(&data);
        trace!(%hash, size = data.len(), "put block");
        self.blocks.insert(hash.clone(), data);
        Ok(hash)
    }

    async fn get(&self, hash: &str) -> Result<Option<Bytes>> {
        if let Some(data) = self.local(hash) {
            return Ok(Some(data));
        }
        let fetched = self.fetch_remote(hash)?;
        if let Some(data) = &fetched {
            debug!(%hash, "fetched block from remote");
            self.blocks.insert(hash.to_string(), data.clone());
        }
        Ok(fetched)
    }

    async fn pin(&self, hash: &str) -> Result<()> {
        if !self.blocks.contains_key(hash) {
            return Err(DomainError::NotFound("block".into(), hash.to_string()));
        }
        self.pins.insert(hash.to_string());
        Ok(())
    }

    async fn unpin(&self, hash: &str) -> Result<()> {
        self.pins.remove(hash);
        Ok(())
    }

    async fn is_pinned(&self, hash: &str) -> Result<bool> {
        Ok(self.pins.contains(hash))
    }

    async fn delete(&self, hash: &str) -> Result<()> {
        self.pins.remove(hash);
        self.blocks.remove(hash);
        Ok(())
    }
}

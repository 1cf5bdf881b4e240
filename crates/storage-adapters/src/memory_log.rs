//! In-memory replicated logs.
//!
//! Every log created through a [`MemoryLogStore`] is immediately visible to
//! every other handle on the same store, which stands in for a live
//! replication session between peers.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use domains::{DomainError, LogId, LogStore, ReplicatedLog, Result};
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug)]
pub struct MemoryLog {
    id: LogId,
    entries: RwLock<Vec<Bytes>>,
}

impl MemoryLog {
    pub fn new(id: impl Into<LogId>) -> Self {
        Self {
            id: id.into(),
            entries: RwLock::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ReplicatedLog for MemoryLog {
    fn id(&self) -> LogId {
        self.id.clone()
    }

    async fn append(&self, entry: Bytes) -> Result<u64> {
        let mut entries = self.entries.write().await;
        entries.push(entry);
        Ok(entries.len() as u64 - 1)
    }

    async fn get(&self, index: u64) -> Result<Option<Bytes>> {
        let entries = self.entries.read().await;
        Ok(usize::try_from(index)
            .ok()
            .and_then(|i| entries.get(i))
            .cloned())
    }

    async fn len(&self) -> Result<u64> {
        Ok(self.entries.read().await.len() as u64)
    }
}

/// Shared registry of logs. Cloning yields another handle on the same set.
#[derive(Debug, Clone, Default)]
pub struct MemoryLogStore {
    namespace: String,
    logs: Arc<DashMap<LogId, Arc<MemoryLog>>>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle whose `create` names are scoped under `namespace`, sharing
    /// the underlying logs with `self`.
    pub fn namespace(&self, namespace: &str) -> Self {
        let namespace = if self.namespace.is_empty() {
            namespace.to_string()
        } else {
            format!("{}/{}", self.namespace, namespace)
        };
        Self {
            namespace,
            logs: Arc::clone(&self.logs),
        }
    }

    fn scoped_id(&self, name: &str) -> LogId {
        if self.namespace.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.namespace, name)
        }
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn create(&self, name: &str) -> Result<Arc<dyn ReplicatedLog>> {
        let id = self.scoped_id(name);
        let entry = self.logs.entry(id.clone()).or_insert_with(|| {
            debug!(log = %id, "creating log");
            Arc::new(MemoryLog::new(id.clone()))
        });
        let log: Arc<MemoryLog> = Arc::clone(entry.value());
        Ok(log)
    }

    async fn open(&self, id: &str) -> Result<Arc<dyn ReplicatedLog>> {
        match self.logs.get(id) {
            Some(log) => {
                let log: Arc<MemoryLog> = Arc::clone(log.value());
                Ok(log)
            }
            None => Err(DomainError::NotFound("log".into(), id.to_string())),
        }
    }
}

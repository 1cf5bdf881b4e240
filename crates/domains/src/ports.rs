//! # Ports
//!
//! Contracts for the external collaborators of the event feed. The swarm,
//! the replication protocol and the proof circuit live behind these traits;
//! `storage-adapters` and `auth-adapters` provide implementations.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::errors::Result;
use crate::models::{ContentHash, LogId, NullifierInput, Proof, Timestamp, VerificationResult};

/// An append-only log replicated between peers.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait ReplicatedLog: Send + Sync {
    /// Stable identifier other peers use to open this log.
    fn id(&self) -> LogId;

    /// Appends one entry and returns its index.
    async fn append(&self, entry: Bytes) -> Result<u64>;

    /// Reads the entry at `index`, `None` if it has not been replicated yet.
    async fn get(&self, index: u64) -> Result<Option<Bytes>>;

    async fn len(&self) -> Result<u64>;
}

/// A set of logs sharing one replication session (the corestore).
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Creates, or reopens, a writable log owned by this node.
    async fn create(&self, name: &str) -> Result<Arc<dyn ReplicatedLog>>;

    /// Opens a (possibly remote) log by id for reading.
    async fn open(&self, id: &str) -> Result<Arc<dyn ReplicatedLog>>;
}

/// Rate-limiting membership proofs.
///
/// The identity secret is held by the implementation, so a prover instance
/// speaks for exactly one member.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait ProofSystem: Send + Sync {
    async fn create_proof(
        &self,
        signal: &str,
        inputs: &[NullifierInput],
        group_id: &str,
    ) -> Result<Proof>;

    /// Checks group membership and the proof's binding to its signal and
    /// nullifiers. Nullifier reuse is tracked by the caller.
    async fn verify_proof(&self, proof: &Proof, group_id: &str) -> Result<VerificationResult>;
}

/// Content-addressed blob storage.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Stores bytes and returns their address.
    async fn put(&self, data: Bytes) -> Result<ContentHash>;

    /// Fetches bytes by address, possibly from the network.
    async fn get(&self, hash: &str) -> Result<Option<Bytes>>;

    async fn pin(&self, hash: &str) -> Result<()>;

    async fn unpin(&self, hash: &str) -> Result<()>;

    async fn is_pinned(&self, hash: &str) -> Result<bool>;

    /// Physically removes local content.
    async fn delete(&self, hash: &str) -> Result<()>;
}

/// Source of wall-clock time, in unix seconds.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

//! Shared harness for the integration tests.
//!
//! A [`Swarm`] runs several board nodes in one process. They share one log
//! store, their content stores fetch from one another, and they all read
//! one manual clock.

use std::sync::Arc;

use auth_adapters::{DevMembershipProver, MembershipGroup};
use domains::{EventTypeRegistry, NullifierSpec, Post, TYPE_POST, TYPE_THREAD};
use secrecy::SecretString;
use services::{
    BoardConfig, BoardNode, ContentLimits, FeedConfig, FeedEvent, NodeConfig, NodePorts,
};
use storage_adapters::{ManualClock, MemoryContentStore, MemoryLogStore};
use tokio::sync::broadcast;

pub const GROUP_ID: &str = "1000";
pub const TOPIC: &str = "integration";

pub struct Peer {
    pub node: BoardNode,
    pub store: Arc<MemoryContentStore>,
}

pub struct Swarm {
    pub logs: MemoryLogStore,
    pub group: Arc<MembershipGroup>,
    pub clock: Arc<ManualClock>,
    stores: Vec<Arc<MemoryContentStore>>,
}

impl Swarm {
    pub fn new(start: u64) -> Self {
        Self {
            logs: MemoryLogStore::new(),
            group: Arc::new(MembershipGroup::new(GROUP_ID)),
            clock: Arc::new(ManualClock::new(start)),
            stores: Vec::new(),
        }
    }

    /// Starts a member node named `name`.
    pub async fn spawn(&mut self, name: &str, config: NodeConfig) -> Peer {
        let store = Arc::new(MemoryContentStore::new());
        for other in &self.stores {
            store.add_remote(other).unwrap();
            other.add_remote(&store).unwrap();
        }
        self.stores.push(store.clone());

        let prover = DevMembershipProver::join(
            SecretString::from(format!("{name}-identity-secret")),
            self.group.clone(),
        );
        let ports = NodePorts {
            logs: Arc::new(self.logs.namespace(name)),
            content: store.clone(),
            prover: Arc::new(prover),
            clock: self.clock.clone(),
        };
        let node = BoardNode::new(config, ports).await.unwrap();
        Peer { node, store }
    }
}

/// Rate limits used in production.
pub fn production_registry() -> EventTypeRegistry {
    EventTypeRegistry::new()
        .with_type(
            TYPE_THREAD,
            vec![NullifierSpec::new(1000, 1), NullifierSpec::new(86400, 16)],
        )
        .with_type(
            TYPE_POST,
            vec![NullifierSpec::new(10, 1), NullifierSpec::new(86400, 2048)],
        )
}

/// Limits loose enough that tests can post freely.
pub fn permissive_registry() -> EventTypeRegistry {
    EventTypeRegistry::new()
        .with_type(TYPE_THREAD, vec![NullifierSpec::new(1, 1000)])
        .with_type(TYPE_POST, vec![NullifierSpec::new(1, 1000)])
}

pub fn node_config(registry: EventTypeRegistry, max_threads: usize) -> NodeConfig {
    NodeConfig {
        feed: FeedConfig::new(TOPIC, GROUP_ID, registry),
        board: BoardConfig {
            max_threads,
            ..BoardConfig::default()
        },
        content: ContentLimits::default(),
    }
}

/// Makes `a` replicate `b`.
pub async fn follow(a: &BoardNode, b: &BoardNode) {
    a.add_peer(b.member_tag(), b.log_ids()).await.unwrap();
}

/// Every node replicates every other node.
pub async fn mesh(nodes: &[&BoardNode]) {
    for a in nodes {
        for b in nodes {
            if a.member_tag() != b.member_tag() {
                follow(a, b).await;
            }
        }
    }
}

/// Syncs every node, `rounds` times over.
pub async fn sync_rounds(nodes: &[&BoardNode], rounds: usize) {
    for _ in 0..rounds {
        for node in nodes {
            node.sync_all().await;
        }
    }
}

pub fn op(com: &str) -> Post {
    Post {
        com: com.into(),
        ..Post::default()
    }
}

pub fn reply(thread: &str, com: &str) -> Post {
    Post {
        com: com.into(),
        resto: thread.into(),
        ..Post::default()
    }
}

/// Everything currently buffered on a feed subscription.
pub fn drain_events(events: &mut broadcast::Receiver<FeedEvent>) -> Vec<FeedEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

//! # services
//!
//! Board logic on top of the domain ports: the ordered [`Timeline`], the
//! proof-gated [`EventFeed`], content verification and the
//! [`BulletinBoard`] that turns feed events into threads.
//!
//! Nothing here performs I/O directly. Logs, blobs, proofs and time all
//! come in through `domains::ports`.

pub mod board;
pub mod content;
pub mod feed;
pub mod node;
pub mod rate_limit;
pub mod timeline;

pub use board::{BoardConfig, BoardError, BulletinBoard, CatalogPage, PostView};
pub use content::{ContentLimits, ContentManager, PostReceipt};
pub use feed::{
    calculate_consensus_time, EventFeed, FeedConfig, FeedContext, FeedError, FeedEvent,
    FeedHandler, NewEventOutcome,
};
pub use node::{Attachment, BoardNode, NodeConfig, NodePorts};
pub use rate_limit::{ClaimAge, RateLimitGate};
pub use timeline::Timeline;

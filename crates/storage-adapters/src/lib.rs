//! # storage-adapters
//!
//! In-process implementations of the feedboard storage ports:
//! replicated logs, the content-addressed blob store and clocks.
//! Peers running in one process share a [`MemoryLogStore`] the same way
//! hypercore peers share a replication session.

pub mod clock;
#[cfg(feature = "memory")]
pub mod memory_content;
#[cfg(feature = "memory")]
pub mod memory_log;

pub use clock::{ManualClock, SystemClock};
#[cfg(feature = "memory")]
pub use memory_content::MemoryContentStore;
#[cfg(feature = "memory")]
pub use memory_log::{MemoryLog, MemoryLogStore};

//! feedboard/crates/domains/src/lib.rs
//!
//! Models, wire formats and port traits shared by every feedboard crate.
//! Nothing in here performs I/O; adapters implement the ports.

pub mod errors;
pub mod models;
pub mod ports;
pub mod wire;

// Re-exporting for easier access in other crates
pub use errors::*;
pub use models::*;
pub use ports::*;

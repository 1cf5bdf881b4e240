//! # auth-adapters
//!
//! Membership proof implementations of the `ProofSystem` port.

#[cfg(feature = "dev-prover")]
pub mod membership;

#[cfg(feature = "dev-prover")]
pub use membership::{DevMembershipProver, MembershipGroup};

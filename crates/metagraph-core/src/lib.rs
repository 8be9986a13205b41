//! Metagraph Core Library
//!
//! This crate provides the wire types, canonical encoding, digest functions,
//! signature verification and proof-of-work validation for the Metagraph
//! synapse registry and tensor RPC transport.
//!
//! # Modules
//!
//! - [`types`]: Wire entities (Synapse, TensorMessage, GossipBatch, etc.)
//! - [`canonical`]: Deterministic serialization and structural checks
//! - [`crypto`]: Digests and signature verification
//! - [`pow`]: Age-scaled proof-of-work validation
//! - [`schema`]: Tensor-to-schema compatibility
//! - [`error`]: Error types

pub mod canonical;
pub mod crypto;
pub mod error;
pub mod pow;
pub mod schema;
pub mod types;

#[cfg(test)]
mod test_vectors;

pub use error::{Error, Result};
pub use pow::{DifficultyParams, ProofOfWorkValidator};
pub use types::*;

//! Digest derivations and signature verification for Metagraph
//!
//! All digests use BLAKE3 with domain separation prefixes.
//! This module provides the normative implementations.

use crate::canonical::synapse_digest_bytes;
use crate::error::{Error, Result};
use crate::types::*;
use blake3::Hasher;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};

// =============================================================================
// DOMAIN SEPARATION PREFIXES
// =============================================================================

/// Domain prefix for synapse digests (proof of work and record signature)
pub const DOMAIN_SYNAPSE: &[u8] = b"synapse";
/// Domain prefix for tensor message digests
pub const DOMAIN_TENSOR_MESSAGE: &[u8] = b"tensor-message";

// =============================================================================
// DIGESTS
// =============================================================================

/// Compute the synapse digest.
///
/// `digest = BLAKE3("synapse" || canonical_bytes(neuron_key, synapse_key,
/// address, port, indef, outdef, block_hash, nounce))`
pub fn synapse_digest(synapse: &Synapse) -> Result<Bytes32> {
    let bytes = synapse_digest_bytes(synapse)?;

    let mut hasher = Hasher::new();
    hasher.update(DOMAIN_SYNAPSE);
    hasher.update(&bytes);
    Ok(*hasher.finalize().as_bytes())
}

/// Compute the tensor message digest.
///
/// `digest = BLAKE3("tensor-message" || neuron_key || synapse_key || nounce_le)`
pub fn tensor_message_digest(
    neuron_key: &NeuronKey,
    synapse_key: &SynapseKey,
    nounce: i64,
) -> Bytes32 {
    let mut hasher = Hasher::new();
    hasher.update(DOMAIN_TENSOR_MESSAGE);
    hasher.update(&neuron_key.0);
    hasher.update(&synapse_key.0);
    hasher.update(&nounce.to_le_bytes());
    *hasher.finalize().as_bytes()
}

/// Count leading zero bits of a digest (256 for the all-zero digest).
pub fn leading_zero_bits(digest: &Bytes32) -> u32 {
    let mut bits = 0;
    for byte in digest {
        if *byte == 0 {
            bits += 8;
        } else {
            bits += byte.leading_zeros();
            break;
        }
    }
    bits
}

// =============================================================================
// SIGNATURES
// =============================================================================

/// Verify an ed25519 signature over a digest.
///
/// Malformed keys and signatures of the wrong length are reported as
/// `InvalidSignature`, never as a panic.
pub fn verify_signature(public_key: &Bytes32, digest: &[u8], signature: &[u8]) -> Result<()> {
    let verifying_key =
        VerifyingKey::from_bytes(public_key).map_err(|_| Error::InvalidSignature)?;
    let sig = Signature::from_slice(signature).map_err(|_| Error::InvalidSignature)?;
    verifying_key
        .verify(digest, &sig)
        .map_err(|_| Error::InvalidSignature)
}

/// Verify a synapse record's signature under its `neuron_key`.
pub fn verify_synapse_signature(synapse: &Synapse) -> Result<()> {
    let digest = synapse_digest(synapse)?;
    verify_signature(&synapse.neuron_key.0, &digest, &synapse.signature)
}

/// Verify a tensor message's signature under its `neuron_key`.
pub fn verify_message_signature(message: &TensorMessage) -> Result<()> {
    let digest = tensor_message_digest(&message.neuron_key, &message.synapse_key, message.nounce);
    verify_signature(&message.neuron_key.0, &digest, &message.signature)
}

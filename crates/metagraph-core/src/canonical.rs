//! Canonical encoding and structural checks for Metagraph records
//!
//! All hashed/signed objects use postcard serialization with strict constraints:
//! - Field order is Rust struct field order
//! - Only the fields named in the digest definition are encoded
//! - Schema lists keep their declared order (position is meaningful)

use crate::error::{Error, Result};
use crate::types::*;
use serde::Serialize;

/// Length of an ed25519 signature
pub const SIGNATURE_LEN: usize = 64;
/// Maximum rank of a declared tensor
pub const MAX_TENSOR_DIMS: usize = 64;
/// Maximum number of tensor definitions in `indef` or `outdef`
pub const MAX_SCHEMA_DEFS: usize = 256;
/// Maximum address length accepted from the network
pub const MAX_ADDRESS_LEN: usize = 256;
/// Wildcard dimension allowed in schema definitions only
pub const WILDCARD_DIM: i64 = -1;

/// Serialize a value to canonical bytes using postcard.
///
/// This is the normative encoding for all hashing and signing operations.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    postcard::to_allocvec(value).map_err(Error::from)
}

/// The digested view of a synapse: everything except version, proof and signature.
#[derive(Serialize)]
struct SynapseHashable<'a> {
    neuron_key: &'a NeuronKey,
    synapse_key: &'a SynapseKey,
    address: &'a str,
    port: &'a str,
    indef: &'a [TensorDef],
    outdef: &'a [TensorDef],
    block_hash: &'a BlockHash,
    nounce: i32,
}

/// Canonical bytes of the digested synapse fields.
pub fn synapse_digest_bytes(synapse: &Synapse) -> Result<Vec<u8>> {
    canonical_bytes(&SynapseHashable {
        neuron_key: &synapse.neuron_key,
        synapse_key: &synapse.synapse_key,
        address: &synapse.address,
        port: &synapse.port,
        indef: &synapse.indef,
        outdef: &synapse.outdef,
        block_hash: &synapse.block_hash,
        nounce: synapse.nounce,
    })
}

/// Check a schema definition: positive dims or the wildcard.
pub fn validate_schema_def(def: &TensorDef) -> Result<()> {
    if def.shape.len() > MAX_TENSOR_DIMS {
        return Err(Error::MalformedRecord(format!(
            "tensor rank {} exceeds {}",
            def.shape.len(),
            MAX_TENSOR_DIMS
        )));
    }
    if let Some(dim) = def
        .shape
        .iter()
        .find(|&&d| d != WILDCARD_DIM && d <= 0)
    {
        return Err(Error::MalformedRecord(format!("invalid schema dimension {}", dim)));
    }
    Ok(())
}

fn validate_schema_list(field: &str, defs: &[TensorDef]) -> Result<()> {
    if defs.len() > MAX_SCHEMA_DEFS {
        return Err(Error::MalformedRecord(format!(
            "{} has {} entries (max {})",
            field,
            defs.len(),
            MAX_SCHEMA_DEFS
        )));
    }
    defs.iter().try_for_each(validate_schema_def)
}

/// Structural validation of a synapse record, before any cryptography.
pub fn validate_synapse(synapse: &Synapse) -> Result<()> {
    if synapse.address.is_empty() || synapse.address.len() > MAX_ADDRESS_LEN {
        return Err(Error::MalformedRecord("address empty or too long".into()));
    }
    match synapse.port.parse::<u16>() {
        Ok(port) if port != 0 => {}
        _ => {
            return Err(Error::MalformedRecord(format!(
                "invalid port {:?}",
                synapse.port
            )))
        }
    }
    if synapse.signature.len() != SIGNATURE_LEN {
        return Err(Error::MalformedRecord(format!(
            "signature is {} bytes",
            synapse.signature.len()
        )));
    }
    validate_schema_list("indef", &synapse.indef)?;
    validate_schema_list("outdef", &synapse.outdef)?;
    Ok(())
}

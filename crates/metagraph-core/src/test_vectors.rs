//! Test vectors for cross-implementation validation of digests
//!
//! These vectors MUST be reproduced exactly by any other implementation.

use crate::canonical::{canonical_bytes, synapse_digest_bytes};
use crate::crypto::*;
use crate::types::*;
use serde::Serialize;

/// Test vector output format (JSON serializable)
#[derive(Serialize)]
pub struct TestVector {
    pub name: String,
    pub description: String,
    pub inputs: serde_json::Value,
    pub canonical_bytes_hex: String,
    pub hash_hex: String,
}

/// Generate all test vectors as JSON
pub fn generate_test_vectors() -> Vec<TestVector> {
    vec![
        tensor_def_vector(),
        synapse_digest_vector(),
        tensor_message_digest_vector(),
    ]
}

fn tensor_def_vector() -> TestVector {
    let def = TensorDef::new(vec![2, -1], DType::Float32, true);
    let bytes = canonical_bytes(&def).unwrap();

    TestVector {
        name: "tensor_def_canonical".into(),
        description: "Canonical bytes for TensorDef (zigzag varint dims)".into(),
        inputs: serde_json::json!({
            "version": def.version,
            "shape": def.shape,
            "dtype": "FLOAT32",
            "requires_grad": def.requires_grad,
        }),
        canonical_bytes_hex: hex::encode(&bytes),
        hash_hex: hex::encode(blake3::hash(&bytes).as_bytes()),
    }
}

fn vector_synapse() -> Synapse {
    Synapse {
        version: PROTOCOL_VERSION.into(),
        neuron_key: NeuronKey([0x11; 32]),
        synapse_key: SynapseKey([0x22; 32]),
        address: "192.168.1.1".into(),
        port: "8091".into(),
        indef: vec![TensorDef::new(vec![-1, 784], DType::Float32, true)],
        outdef: vec![TensorDef::new(vec![-1, 10], DType::Float32, false)],
        block_hash: BlockHash([0x33; 32]),
        nounce: 12345,
        proof_of_work: [0; 32],
        signature: vec![],
    }
}

fn synapse_digest_vector() -> TestVector {
    let synapse = vector_synapse();
    let bytes = synapse_digest_bytes(&synapse).unwrap();
    let digest = synapse_digest(&synapse).unwrap();

    TestVector {
        name: "synapse_digest".into(),
        description: "digest = BLAKE3(\"synapse\" || canonical_bytes(neuron_key, synapse_key, address, port, indef, outdef, block_hash, nounce))".into(),
        inputs: serde_json::json!({
            "neuron_key_hex": synapse.neuron_key.to_string(),
            "synapse_key_hex": synapse.synapse_key.to_string(),
            "address": synapse.address,
            "port": synapse.port,
            "indef": [{ "shape": [-1, 784], "dtype": "FLOAT32", "requires_grad": true }],
            "outdef": [{ "shape": [-1, 10], "dtype": "FLOAT32", "requires_grad": false }],
            "block_hash_hex": synapse.block_hash.to_string(),
            "nounce": synapse.nounce,
        }),
        canonical_bytes_hex: hex::encode(&bytes),
        hash_hex: hex::encode(digest),
    }
}

fn tensor_message_digest_vector() -> TestVector {
    let neuron_key = NeuronKey([0x44; 32]);
    let synapse_key = SynapseKey([0x55; 32]);
    let nounce = -7i64;
    let digest = tensor_message_digest(&neuron_key, &synapse_key, nounce);

    TestVector {
        name: "tensor_message_digest".into(),
        description: "digest = BLAKE3(\"tensor-message\" || neuron_key || synapse_key || nounce_i64_le)".into(),
        inputs: serde_json::json!({
            "neuron_key_hex": neuron_key.to_string(),
            "synapse_key_hex": synapse_key.to_string(),
            "nounce": nounce,
        }),
        canonical_bytes_hex: "".into(), // raw concatenation, no postcard
        hash_hex: hex::encode(digest),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_vectors() {
        let vectors = generate_test_vectors();
        assert_eq!(vectors.len(), 3);

        // Print JSON for manual inspection / export
        let json = serde_json::to_string_pretty(&vectors).unwrap();
        println!("Test Vectors:\n{}", json);
    }

    #[test]
    fn test_tensor_def_bytes_pinned() {
        // "1.0.0" (len 5), shape [2, -1] as zigzag varints, Float32 = 1, true
        let v = tensor_def_vector();
        assert_eq!(v.canonical_bytes_hex, "05312e302e300204010101");
    }

    #[test]
    fn test_synapse_digest_deterministic() {
        let v1 = synapse_digest_vector();
        let v2 = synapse_digest_vector();
        assert_eq!(v1.hash_hex, v2.hash_hex);
        assert_eq!(v1.canonical_bytes_hex, v2.canonical_bytes_hex);
    }

    #[test]
    fn test_synapse_bytes_start_with_keys() {
        let v = synapse_digest_vector();
        let expected_prefix = format!("{}{}", hex::encode([0x11; 32]), hex::encode([0x22; 32]));
        assert!(v.canonical_bytes_hex.starts_with(&expected_prefix));
    }
}

//! Identity keys for neurons and synapses
//!
//! Keys are supplied to the node (seed from config or persisted state);
//! verification lives in `metagraph_core::crypto`.

use ed25519_dalek::{Signer, SigningKey};
use metagraph_core::crypto::{synapse_digest, tensor_message_digest};
use metagraph_core::types::*;
use rand::rngs::OsRng;

/// Ed25519 keypair for signing and identity
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Create from seed bytes (for deterministic testing and persisted identities)
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        Self { signing_key }
    }

    /// Seed bytes, for persisting the identity
    pub fn seed(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Get the public key bytes
    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// This key as a neuron identity
    pub fn neuron_key(&self) -> NeuronKey {
        NeuronKey(self.public_key())
    }

    /// This key as a synapse identity
    pub fn synapse_key(&self) -> SynapseKey {
        SynapseKey(self.public_key())
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }

    /// Sign a synapse record in place.
    ///
    /// The record must already carry its final nounce and proof of work.
    pub fn sign_synapse(&self, synapse: &mut Synapse) -> metagraph_core::Result<()> {
        let digest = synapse_digest(synapse)?;
        synapse.signature = self.sign(&digest).to_vec();
        Ok(())
    }

    /// Build a signed tensor message from this neuron to `synapse_key`.
    pub fn sign_message(&self, synapse_key: SynapseKey, nounce: i64, tensors: Vec<Tensor>) -> TensorMessage {
        let neuron_key = self.neuron_key();
        let digest = tensor_message_digest(&neuron_key, &synapse_key, nounce);
        TensorMessage {
            version: PROTOCOL_VERSION.into(),
            neuron_key,
            synapse_key,
            nounce,
            signature: self.sign(&digest).to_vec(),
            tensors,
        }
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &hex::encode(self.public_key()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metagraph_core::crypto::{verify_message_signature, verify_signature, verify_synapse_signature};

    #[test]
    fn test_keypair_sign_verify() {
        let kp = KeyPair::generate();
        let msg = b"hello world";
        let sig = kp.sign(msg);

        assert!(verify_signature(&kp.public_key(), msg, &sig).is_ok());
    }

    #[test]
    fn test_seed_roundtrip() {
        let kp = KeyPair::from_seed(&[3; 32]);
        let restored = KeyPair::from_seed(&kp.seed());
        assert_eq!(kp.public_key(), restored.public_key());
    }

    #[test]
    fn test_sign_synapse() {
        let kp = KeyPair::from_seed(&[4; 32]);
        let mut synapse = Synapse {
            version: PROTOCOL_VERSION.into(),
            neuron_key: kp.neuron_key(),
            synapse_key: SynapseKey([1; 32]),
            address: "127.0.0.1".into(),
            port: "9000".into(),
            indef: vec![],
            outdef: vec![],
            block_hash: BlockHash([2; 32]),
            nounce: 0,
            proof_of_work: [0; 32],
            signature: vec![],
        };
        kp.sign_synapse(&mut synapse).unwrap();
        assert!(verify_synapse_signature(&synapse).is_ok());
    }

    #[test]
    fn test_sign_message() {
        let kp = KeyPair::from_seed(&[5; 32]);
        let message = kp.sign_message(SynapseKey([9; 32]), 11, vec![]);
        assert!(verify_message_signature(&message).is_ok());
    }
}

//! Wire entities for the Metagraph protocol
//!
//! All types here are designed for deterministic serialization via postcard.
//! Field order matters for digest and signature computation.

use serde::{Deserialize, Serialize};
use std::fmt;

/// 32-byte fixed-size array used for keys and hashes.
pub type Bytes32 = [u8; 32];

/// Protocol version string stamped on outgoing entities
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Gossip batch format version
pub const GOSSIP_VERSION: f32 = 1.0;

// =============================================================================
// IDENTITY TYPES (newtypes for type safety)
// =============================================================================

/// Owner identity: ed25519 public key of a neuron
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NeuronKey(pub Bytes32);

/// Endpoint identity: ed25519 public key of a synapse
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SynapseKey(pub Bytes32);

/// Chain block hash used as a freshness anchor
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct BlockHash(pub Bytes32);

macro_rules! hex_display {
    ($($ty:ty),*) => {
        $(
            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}", hex::encode(self.0))
                }
            }
        )*
    };
}

hex_display!(NeuronKey, SynapseKey, BlockHash);

macro_rules! short_hex {
    ($($ty:ty),*) => {
        $(
            impl $ty {
                /// Short form for log lines
                pub fn short(&self) -> String {
                    hex::encode(&self.0[..8])
                }
            }
        )*
    };
}

short_hex!(NeuronKey, SynapseKey);

// =============================================================================
// TENSOR SCHEMA
// =============================================================================

/// Element type of a tensor buffer
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DType {
    Unknown = 0,
    Float32 = 1,
    Float64 = 2,
    Int32 = 3,
    Int64 = 4,
}

impl DType {
    /// Width of one element in bytes, `None` when the type is not declared
    pub fn element_size(&self) -> Option<usize> {
        match self {
            DType::Unknown => None,
            DType::Float32 | DType::Int32 => Some(4),
            DType::Float64 | DType::Int64 => Some(8),
        }
    }
}

/// Shape, element type and gradient flag of a tensor.
///
/// In schema definitions a dimension of `-1` matches any size; transmitted
/// tensors always carry concrete dimensions.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TensorDef {
    pub version: String,
    pub shape: Vec<i64>,
    pub dtype: DType,
    pub requires_grad: bool,
}

impl TensorDef {
    pub fn new(shape: Vec<i64>, dtype: DType, requires_grad: bool) -> Self {
        Self {
            version: PROTOCOL_VERSION.into(),
            shape,
            dtype,
            requires_grad,
        }
    }

    /// Number of elements for a concrete shape, `None` on wildcard or overflow
    pub fn element_count(&self) -> Option<usize> {
        self.shape.iter().try_fold(1usize, |acc, &dim| {
            usize::try_from(dim).ok().and_then(|d| acc.checked_mul(d))
        })
    }
}

/// Opaque tensor payload plus its declared metadata
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tensor {
    pub version: String,
    pub buffer: Vec<u8>,
    pub tensor_def: TensorDef,
}

impl Tensor {
    pub fn new(buffer: Vec<u8>, tensor_def: TensorDef) -> Self {
        Self {
            version: PROTOCOL_VERSION.into(),
            buffer,
            tensor_def,
        }
    }
}

// =============================================================================
// SYNAPSE RECORD
// =============================================================================

/// Registry entry advertising a tensor-processing endpoint.
///
/// `proof_of_work` is the synapse digest itself; `nounce` is the free
/// variable a neuron increments until the digest meets the difficulty.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Synapse {
    pub version: String,
    pub neuron_key: NeuronKey,
    pub synapse_key: SynapseKey,
    pub address: String,
    pub port: String,
    pub indef: Vec<TensorDef>,
    pub outdef: Vec<TensorDef>,
    pub block_hash: BlockHash,
    pub nounce: i32,
    pub proof_of_work: Bytes32,
    /// Ed25519 signature over the synapse digest, verifiable under `neuron_key`
    pub signature: Vec<u8>,
}

// =============================================================================
// TENSOR RPC
// =============================================================================

/// Forward/Backward request and response body
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TensorMessage {
    pub version: String,
    pub neuron_key: NeuronKey,
    pub synapse_key: SynapseKey,
    pub nounce: i64,
    /// Ed25519 signature over (neuron_key || synapse_key || nounce)
    pub signature: Vec<u8>,
    pub tensors: Vec<Tensor>,
}

/// Which tensor RPC a message belongs to
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CallKind {
    Forward,
    Backward,
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallKind::Forward => f.write_str("forward"),
            CallKind::Backward => f.write_str("backward"),
        }
    }
}

// =============================================================================
// GOSSIP
// =============================================================================

/// Batched registry and peer-list exchange
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GossipBatch {
    pub version: f32,
    pub peers: Vec<String>,
    pub synapses: Vec<Synapse>,
}

impl GossipBatch {
    pub fn new(peers: Vec<String>, synapses: Vec<Synapse>) -> Self {
        Self {
            version: GOSSIP_VERSION,
            peers,
            synapses,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), Vec::new())
    }
}

impl Default for GossipBatch {
    fn default() -> Self {
        Self::empty()
    }
}

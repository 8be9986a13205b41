//! Error types for the Metagraph protocol

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Protocol error taxonomy shared by the registry, gossip and tensor transport
#[derive(Debug, Error)]
pub enum Error {
    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    /// Record fails structural checks
    #[error("malformed record: {0}")]
    MalformedRecord(String),

    /// Digest mismatch or not enough leading zero bits
    #[error("invalid proof of work: required {required} bits, achieved {achieved}")]
    InvalidProofOfWork { required: u32, achieved: u32 },

    /// Block anchor too old or unknown to the height oracle
    #[error("stale block reference: {0}")]
    StaleBlockReference(String),

    /// Signature does not verify under the claimed key
    #[error("invalid signature")]
    InvalidSignature,

    /// Nounce already used on this connection
    #[error("replayed nounce {offered} (last seen {last_seen:?})")]
    ReplayedNounce { offered: i64, last_seen: Option<i64> },

    /// Tensors do not match the declared schema
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    /// Registry full and no evictable victim
    #[error("capacity exceeded (capacity {capacity})")]
    CapacityExceeded { capacity: usize },

    /// Peer did not answer
    #[error("peer unreachable: {0}")]
    PeerUnreachable(String),

    /// Unknown synapse
    #[error("not found: {0}")]
    NotFound(String),

    /// Height oracle could not answer
    #[error("height oracle unavailable: {0}")]
    HeightOracleUnavailable(String),

    /// Connection was rejected earlier and needs a new handshake
    #[error("connection rejected")]
    ConnectionRejected,

    /// Compute executor failed
    #[error("executor failed: {0}")]
    ExecutorFailed(String),
}

impl Error {
    /// Stable numeric code used on the wire
    pub fn code(&self) -> u16 {
        match self {
            Error::Serialization(_) => 1,
            Error::MalformedRecord(_) => 2,
            Error::InvalidProofOfWork { .. } => 3,
            Error::StaleBlockReference(_) => 4,
            Error::InvalidSignature => 5,
            Error::ReplayedNounce { .. } => 6,
            Error::SchemaMismatch(_) => 7,
            Error::CapacityExceeded { .. } => 8,
            Error::PeerUnreachable(_) => 9,
            Error::NotFound(_) => 10,
            Error::HeightOracleUnavailable(_) => 11,
            Error::ConnectionRejected => 12,
            Error::ExecutorFailed(_) => 13,
        }
    }

    /// Whether this failure terminates the tensor connection
    pub fn rejects_connection(&self) -> bool {
        matches!(
            self,
            Error::InvalidSignature | Error::ReplayedNounce { .. } | Error::ConnectionRejected
        )
    }
}

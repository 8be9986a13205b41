//! Networking primitives for the Metagraph protocol
//!
//! This crate provides:
//! - Identity keypairs and record/message signing
//! - Length-prefixed framing for the Gossip, Forward and Backward RPCs
//! - The bounded peer directory used by gossip
//! - A framed TCP client

pub mod crypto;
pub mod framing;
pub mod peer;
pub mod transport;

pub use crypto::KeyPair;
pub use framing::{Frame, FrameCodec, FrameType, RpcFailure};
pub use peer::{FailureOutcome, PeerDirectory};
pub use transport::{GossipClient, TcpTransport, TransportError};

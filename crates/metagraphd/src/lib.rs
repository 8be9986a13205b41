//! metagraphd - Metagraph synapse registry and tensor RPC daemon
//!
//! This daemon provides:
//! - A proof-of-work gated, capacity-bounded synapse registry
//! - Push-pull gossip of synapse records and peer addresses
//! - Signed, nounce-ordered Forward/Backward tensor calls
//! - Persistent storage of records, peers and node identity

pub mod config;
pub mod gossip;
pub mod oracle;
pub mod registry;
pub mod server;
pub mod storage;
pub mod tensor;

pub use config::Config;
pub use gossip::GossipExchanger;
pub use oracle::{HeightOracle, ManualHeightOracle};
pub use registry::SynapseRegistry;
pub use server::Server;
pub use storage::Storage;
pub use tensor::{ComputeExecutor, EchoExecutor, TensorTransport};

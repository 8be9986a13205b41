//! Configuration for metagraphd

use clap::{Parser, ValueEnum};
use metagraph_core::pow::DifficultyParams;
use metagraph_core::types::BlockHash;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// What the registry does when the height oracle cannot answer
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum OraclePolicy {
    /// Reject the record with `HeightOracleUnavailable`
    #[default]
    FailClosed,
    /// Admit against the difficulty demanded at `max_block_age`, also for
    /// anchors the oracle does not know
    FailOpen,
}

/// A known block, given on the command line as `HASH:HEIGHT`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockAnchor {
    pub hash: BlockHash,
    pub height: u64,
}

fn parse_anchor(value: &str) -> Result<BlockAnchor, String> {
    let (hash, height) = value
        .split_once(':')
        .ok_or_else(|| format!("expected HASH:HEIGHT, got {value}"))?;
    let mut bytes = [0u8; 32];
    hex::decode_to_slice(hash, &mut bytes).map_err(|e| format!("bad block hash {hash}: {e}"))?;
    let height = height
        .parse()
        .map_err(|e| format!("bad block height {height}: {e}"))?;
    Ok(BlockAnchor {
        hash: BlockHash(bytes),
        height,
    })
}

/// metagraphd - Metagraph synapse registry and tensor RPC daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "metagraphd")]
#[command(about = "Metagraph synapse registry, gossip and tensor RPC daemon")]
pub struct Config {
    /// Listen address for gossip and tensor RPC connections
    #[arg(short, long, default_value = "0.0.0.0:8091")]
    pub listen: SocketAddr,

    /// Address advertised to peers in gossip batches
    #[arg(long, env = "METAGRAPH_ADVERTISE")]
    pub advertise: Option<String>,

    /// Data directory for persistent storage
    #[arg(short, long, default_value = "./data/metagraphd")]
    pub data_dir: PathBuf,

    /// Bootstrap peers (comma-separated addresses)
    #[arg(long, value_delimiter = ',', env = "METAGRAPH_BOOTSTRAP")]
    pub bootstrap: Vec<String>,

    /// Maximum number of synapses held in the registry
    #[arg(long, default_value = "4096")]
    pub capacity: usize,

    /// Candidates ranked per eviction
    #[arg(long, default_value = "64")]
    pub eviction_sample: usize,

    /// Leading zero bits required for a fresh anchor
    #[arg(long, default_value = "12")]
    pub base_difficulty: u32,

    /// Extra bits required per difficulty step
    #[arg(long, default_value = "1")]
    pub bits_per_step: u32,

    /// Blocks per difficulty step
    #[arg(long, default_value = "10")]
    pub difficulty_step_blocks: u64,

    /// Oldest acceptable block anchor, in blocks
    #[arg(long, default_value = "100")]
    pub max_block_age: u64,

    /// Current chain height seeding the built-in height oracle
    #[arg(long, default_value = "0", env = "METAGRAPH_CHAIN_HEIGHT")]
    pub chain_height: u64,

    /// Known block anchors as HASH:HEIGHT (comma-separated, hex hash)
    #[arg(long = "anchor", value_delimiter = ',', value_parser = parse_anchor, env = "METAGRAPH_ANCHORS")]
    pub anchors: Vec<BlockAnchor>,

    /// Behaviour when the chain height cannot be determined
    #[arg(long, value_enum, default_value_t = OraclePolicy::FailClosed)]
    pub oracle_policy: OraclePolicy,

    /// Gossip interval in seconds
    #[arg(long, default_value = "12")]
    pub gossip_interval_secs: u64,

    /// Peers contacted per gossip round
    #[arg(long, default_value = "3")]
    pub fanout: usize,

    /// Maximum synapses per gossip batch
    #[arg(long, default_value = "256")]
    pub max_batch_records: usize,

    /// Maximum peer addresses per gossip batch
    #[arg(long, default_value = "64")]
    pub max_batch_peers: usize,

    /// Maximum known peers
    #[arg(long, default_value = "1024")]
    pub max_peers: usize,

    /// Consecutive failed pushes before a peer is dropped
    #[arg(long, default_value = "3")]
    pub max_peer_failures: u32,

    /// Idle tensor connections are dropped after this many seconds
    #[arg(long, default_value = "3600")]
    pub connection_idle_secs: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.capacity == 0 {
            anyhow::bail!("Registry capacity must be at least 1");
        }
        if self.eviction_sample == 0 {
            anyhow::bail!("Eviction sample must be at least 1");
        }
        if self.difficulty_step_blocks == 0 {
            anyhow::bail!("Difficulty step must be at least 1 block");
        }
        if self.base_difficulty > metagraph_core::pow::MAX_DIFFICULTY_BITS {
            anyhow::bail!(
                "Base difficulty cannot exceed {} bits",
                metagraph_core::pow::MAX_DIFFICULTY_BITS
            );
        }
        if self.gossip_interval_secs == 0 {
            anyhow::bail!("Gossip interval must be at least 1 second");
        }
        if self.fanout == 0 {
            anyhow::bail!("Fanout must be at least 1");
        }
        if self.max_peer_failures == 0 {
            anyhow::bail!("Max peer failures must be at least 1");
        }
        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            anyhow::bail!("Log format must be json or pretty, got {}", self.log_format);
        }
        Ok(())
    }

    /// Difficulty schedule for the proof-of-work validator
    pub fn difficulty(&self) -> DifficultyParams {
        DifficultyParams {
            base_bits: self.base_difficulty,
            bits_per_step: self.bits_per_step,
            step_blocks: self.difficulty_step_blocks,
            max_block_age: self.max_block_age,
        }
    }

    pub fn gossip_interval(&self) -> Duration {
        Duration::from_secs(self.gossip_interval_secs)
    }

    pub fn connection_idle(&self) -> Duration {
        Duration::from_secs(self.connection_idle_secs)
    }
}

/// Persisted node state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    /// Our identity keypair seed (deterministic recovery)
    pub identity_seed: [u8; 32],
}

//! Chain height lookups used to age block anchors

use metagraph_core::types::BlockHash;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use thiserror::Error;

/// Height oracle errors
#[derive(Debug, Error)]
pub enum OracleError {
    #[error("Height oracle unavailable: {0}")]
    Unavailable(String),
}

/// Source of chain heights.
///
/// `height_of` returns `Ok(None)` for a hash the chain does not know.
pub trait HeightOracle: Send + Sync {
    fn current_height(&self) -> Result<u64, OracleError>;
    fn height_of(&self, hash: &BlockHash) -> Result<Option<u64>, OracleError>;
}

/// In-memory oracle fed by whoever follows the chain
#[derive(Debug, Default)]
pub struct ManualHeightOracle {
    current: AtomicU64,
    anchors: RwLock<HashMap<BlockHash, u64>>,
    offline: AtomicBool,
}

impl ManualHeightOracle {
    pub fn new(current_height: u64) -> Self {
        Self {
            current: AtomicU64::new(current_height),
            ..Default::default()
        }
    }

    /// Record a block at `height`. Advances the current height if needed.
    pub fn add_block(&self, hash: BlockHash, height: u64) {
        self.anchors.write().insert(hash, height);
        self.current.fetch_max(height, Ordering::SeqCst);
    }

    pub fn set_height(&self, height: u64) {
        self.current.store(height, Ordering::SeqCst);
    }

    /// Simulate the chain backend going away
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<(), OracleError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(OracleError::Unavailable("manual oracle offline".into()));
        }
        Ok(())
    }
}

impl HeightOracle for ManualHeightOracle {
    fn current_height(&self) -> Result<u64, OracleError> {
        self.check_online()?;
        Ok(self.current.load(Ordering::SeqCst))
    }

    fn height_of(&self, hash: &BlockHash) -> Result<Option<u64>, OracleError> {
        self.check_online()?;
        Ok(self.anchors.read().get(hash).copied())
    }
}

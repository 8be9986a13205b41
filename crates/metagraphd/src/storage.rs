//! Persistent storage using sled
//!
//! Holds the record tier of the synapse registry (full records keyed by
//! synapse key), the peer directory snapshot and node metadata.

use crate::config::NodeState;
use metagraph_core::types::*;
use serde::{Deserialize, Serialize};
use sled::Db;
use std::path::Path;
use thiserror::Error;

const NODE_STATE_KEY: &str = "node_state";

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),
}

/// Full record as kept in the record tier
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StoredSynapse {
    /// Chain height of `synapse.block_hash` at admission time
    pub anchor_height: u64,
    pub synapse: Synapse,
}

/// Storage backend for metagraphd
pub struct Storage {
    db: Db,
    /// Synapse tree: synapse_key -> StoredSynapse
    synapses: sled::Tree,
    /// Peer tree: address -> ()
    peers: sled::Tree,
    /// Metadata tree: key -> value
    metadata: sled::Tree,
}

impl Storage {
    /// Open storage at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        let synapses = db.open_tree("synapses")?;
        let peers = db.open_tree("peers")?;
        let metadata = db.open_tree("metadata")?;

        Ok(Self {
            db,
            synapses,
            peers,
            metadata,
        })
    }

    /// Open a throwaway in-memory database
    pub fn temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        let synapses = db.open_tree("synapses")?;
        let peers = db.open_tree("peers")?;
        let metadata = db.open_tree("metadata")?;

        Ok(Self {
            db,
            synapses,
            peers,
            metadata,
        })
    }

    /// Store a synapse record
    pub fn put_synapse(&self, stored: &StoredSynapse) -> Result<(), StorageError> {
        let key = stored.synapse.synapse_key.0;
        let value = postcard::to_allocvec(stored)?;
        self.synapses.insert(key, value)?;
        Ok(())
    }

    /// Get a synapse record by key
    pub fn get_synapse(&self, key: &SynapseKey) -> Result<Option<StoredSynapse>, StorageError> {
        match self.synapses.get(key.0)? {
            Some(bytes) => {
                let stored: StoredSynapse = postcard::from_bytes(&bytes)?;
                Ok(Some(stored))
            }
            None => Ok(None),
        }
    }

    /// Remove a synapse record
    pub fn remove_synapse(&self, key: &SynapseKey) -> Result<bool, StorageError> {
        Ok(self.synapses.remove(key.0)?.is_some())
    }

    /// Get all synapse records (for index rebuild)
    pub fn all_synapses(&self) -> impl Iterator<Item = Result<StoredSynapse, StorageError>> + '_ {
        self.synapses.iter().map(|result| {
            let (_, bytes) = result?;
            let stored: StoredSynapse = postcard::from_bytes(&bytes)?;
            Ok(stored)
        })
    }

    /// Replace the persisted peer list
    pub fn put_peers(&self, addrs: &[String]) -> Result<(), StorageError> {
        self.peers.clear()?;
        for addr in addrs {
            self.peers.insert(addr.as_bytes(), Vec::<u8>::new())?;
        }
        Ok(())
    }

    /// Load the persisted peer list
    pub fn all_peers(&self) -> Result<Vec<String>, StorageError> {
        let mut addrs = Vec::new();
        for result in self.peers.iter() {
            let (key, _) = result?;
            addrs.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(addrs)
    }

    /// Store metadata
    pub fn put_metadata(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.metadata.insert(key, value)?;
        Ok(())
    }

    /// Get metadata
    pub fn get_metadata(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.metadata.get(key)?.map(|v| v.to_vec()))
    }

    /// Load persisted node state
    pub fn load_node_state(&self) -> Result<Option<NodeState>, StorageError> {
        match self.get_metadata(NODE_STATE_KEY)? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Persist node state
    pub fn save_node_state(&self, state: &NodeState) -> Result<(), StorageError> {
        let bytes = postcard::to_allocvec(state)?;
        self.put_metadata(NODE_STATE_KEY, &bytes)
    }

    /// Flush all pending writes
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

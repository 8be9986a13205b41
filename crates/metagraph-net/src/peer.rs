//! Peer directory: known reachable gossip candidates
//!
//! Entries are bare address strings with no ownership semantics. Addresses
//! are deduplicated, the directory is bounded, and a peer that fails
//! `max_failures` pushes in a row is dropped.

use metagraph_core::canonical::MAX_ADDRESS_LEN;
use parking_lot::RwLock;
use rand::seq::IteratorRandom;
use std::collections::HashMap;
use tracing::debug;

/// State kept for one known peer
#[derive(Debug, Clone, Default)]
struct PeerEntry {
    /// Consecutive failed pushes
    consecutive_failures: u32,
}

/// Outcome of recording a failed push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Still in the directory with this many consecutive failures
    Retained(u32),
    /// Marked stale and removed
    Dropped,
    /// Address was not in the directory
    Unknown,
}

/// Deduplicated, bounded set of peer addresses
pub struct PeerDirectory {
    /// Our own advertised address (never stored)
    own_address: Option<String>,
    entries: RwLock<HashMap<String, PeerEntry>>,
    max_peers: usize,
    max_failures: u32,
}

/// Trim and bound an address received from the network.
pub fn normalize_address(addr: &str) -> Option<String> {
    let trimmed = addr.trim();
    if trimmed.is_empty() || trimmed.len() > MAX_ADDRESS_LEN {
        return None;
    }
    Some(trimmed.to_string())
}

impl PeerDirectory {
    pub fn new(own_address: Option<String>, max_peers: usize, max_failures: u32) -> Self {
        Self {
            own_address: own_address.as_deref().and_then(normalize_address),
            entries: RwLock::new(HashMap::new()),
            max_peers,
            max_failures: max_failures.max(1),
        }
    }

    /// Our own advertised address
    pub fn own_address(&self) -> Option<&str> {
        self.own_address.as_deref()
    }

    /// Merge one address. Returns true if it was new.
    pub fn merge(&self, addr: &str) -> bool {
        let Some(addr) = normalize_address(addr) else {
            return false;
        };
        if self.own_address.as_deref() == Some(addr.as_str()) {
            return false;
        }

        let mut entries = self.entries.write();
        if entries.contains_key(&addr) || entries.len() >= self.max_peers {
            return false;
        }
        debug!(peer = %addr, "New peer");
        entries.insert(addr, PeerEntry::default());
        true
    }

    /// Merge many addresses. Returns the number of new entries.
    pub fn merge_all<'a>(&self, addrs: impl IntoIterator<Item = &'a String>) -> usize {
        addrs.into_iter().filter(|a| self.merge(a)).count()
    }

    /// Reset the failure count after a successful exchange
    pub fn record_success(&self, addr: &str) {
        if let Some(entry) = self.entries.write().get_mut(addr) {
            entry.consecutive_failures = 0;
        }
    }

    /// Count a failed push, dropping the peer once it reaches the limit
    pub fn record_failure(&self, addr: &str) -> FailureOutcome {
        let mut entries = self.entries.write();
        let Some(entry) = entries.get_mut(addr) else {
            return FailureOutcome::Unknown;
        };
        entry.consecutive_failures += 1;
        if entry.consecutive_failures >= self.max_failures {
            entries.remove(addr);
            FailureOutcome::Dropped
        } else {
            FailureOutcome::Retained(entry.consecutive_failures)
        }
    }

    /// Check if a peer is known
    pub fn contains(&self, addr: &str) -> bool {
        self.entries.read().contains_key(addr)
    }

    /// Up to `n` distinct peers chosen uniformly at random
    pub fn sample(&self, n: usize) -> Vec<String> {
        let entries = self.entries.read();
        entries
            .keys()
            .cloned()
            .choose_multiple(&mut rand::thread_rng(), n)
    }

    /// All known addresses
    pub fn addresses(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

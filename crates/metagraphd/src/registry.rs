//! Synapse registry: proof-of-work gated, capacity bounded
//!
//! Two tiers keyed by synapse key:
//! - a sharded in-memory index of compact [`IndexEntry`] values, used for
//!   conflict resolution, eviction ranking and sampling;
//! - the sled record tier holding full records (see [`Storage`]).
//!
//! Validation (structure, signature, anchor height, proof of work) runs
//! before any lock is taken. The commit for a key happens under that key's
//! shard write lock, sled write and length update included, so both tiers
//! and the length always agree on the winner.
//!
//! The length never stays above capacity once an insert returns: eviction
//! only removes entries while the registry is over capacity, and an insert
//! that finds nothing else to evict withdraws its own record and reports
//! `CapacityExceeded`.

use crate::config::OraclePolicy;
use crate::oracle::HeightOracle;
use crate::storage::{Storage, StorageError, StoredSynapse};
use metagraph_core::canonical::validate_synapse;
use metagraph_core::crypto::{leading_zero_bits, verify_synapse_signature};
use metagraph_core::pow::{DifficultyParams, ProofOfWorkValidator};
use metagraph_core::types::*;
use metagraph_core::Error;
use parking_lot::{Mutex, RwLock};
use rand::seq::{IteratorRandom, SliceRandom};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Number of index shards (power of two)
pub const SHARD_COUNT: usize = 64;

/// Sampled eviction attempts before falling back to a full scan
const SAMPLED_ATTEMPTS: usize = 4;

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Protocol(#[from] Error),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Blocking task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl RegistryError {
    /// The protocol error, if this is one
    pub fn protocol(&self) -> Option<&Error> {
        match self {
            RegistryError::Protocol(e) => Some(e),
            _ => None,
        }
    }
}

/// Registry tuning
#[derive(Clone, Copy, Debug)]
pub struct RegistryConfig {
    /// Maximum number of indexed synapses
    pub capacity: usize,
    /// Candidates ranked per eviction
    pub eviction_sample: usize,
    pub difficulty: DifficultyParams,
    pub oracle_policy: OraclePolicy,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            capacity: 4096,
            eviction_sample: 64,
            difficulty: DifficultyParams::default(),
            oracle_policy: OraclePolicy::FailClosed,
        }
    }
}

/// Compact per-key index record
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    pub neuron_key: NeuronKey,
    pub nounce: i32,
    /// Height of the record's block anchor (assumed `max_block_age` old when
    /// admitted without one)
    pub anchor_height: u64,
    /// Leading zero bits of the proof of work
    pub pow_bits: u32,
    /// Synapse digest (equal to the proof of work)
    pub digest: Bytes32,
}

impl IndexEntry {
    fn from_record(record: &Synapse, anchor_height: u64) -> Self {
        Self {
            neuron_key: record.neuron_key,
            nounce: record.nounce,
            anchor_height,
            pow_bits: leading_zero_bits(&record.proof_of_work),
            digest: record.proof_of_work,
        }
    }
}

/// Eviction order: oldest anchor first, then weakest proof, then lowest key
pub fn eviction_rank(key: &SynapseKey, entry: &IndexEntry) -> (u64, u32, Bytes32) {
    (entry.anchor_height, entry.pow_bits, key.0)
}

/// Outcome of a successful validation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// New key
    Inserted,
    /// Replaced a record with a lower nounce
    Replaced { previous: i32 },
    /// Same record already held
    Duplicate,
    /// A record with an equal or higher nounce is held; nothing changed
    Stale { current: i32 },
}

/// Registry statistics
#[derive(Debug, Clone, Default)]
pub struct RegistryStats {
    pub len: usize,
    pub capacity: usize,
    pub inserted: u64,
    pub replaced: u64,
    pub evicted: u64,
    pub pruned: u64,
}

type Shard = RwLock<HashMap<SynapseKey, IndexEntry>>;

/// Proof-of-work gated synapse directory
pub struct SynapseRegistry {
    shards: Vec<Shard>,
    storage: Arc<Storage>,
    oracle: Arc<dyn HeightOracle>,
    validator: ProofOfWorkValidator,
    config: RegistryConfig,
    len: AtomicUsize,
    /// Highest chain height the oracle has reported
    last_known_height: AtomicU64,
    /// Keys with an insert in progress, never eviction candidates
    admitting: Mutex<HashMap<SynapseKey, usize>>,
    inserted: AtomicU64,
    replaced: AtomicU64,
    evicted: AtomicU64,
    pruned: AtomicU64,
}

fn shard_index(key: &SynapseKey) -> usize {
    key.0[0] as usize & (SHARD_COUNT - 1)
}

impl SynapseRegistry {
    /// Open the registry, rebuilding the index from the record tier
    pub fn open(
        storage: Arc<Storage>,
        oracle: Arc<dyn HeightOracle>,
        config: RegistryConfig,
    ) -> Result<Self, RegistryError> {
        let registry = Self {
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
            storage,
            oracle,
            validator: ProofOfWorkValidator::new(config.difficulty),
            config,
            len: AtomicUsize::new(0),
            last_known_height: AtomicU64::new(0),
            admitting: Mutex::new(HashMap::new()),
            inserted: AtomicU64::new(0),
            replaced: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
            pruned: AtomicU64::new(0),
        };

        for stored in registry.storage.all_synapses() {
            let stored = stored?;
            let key = stored.synapse.synapse_key;
            let entry = IndexEntry::from_record(&stored.synapse, stored.anchor_height);
            let mut shard = registry.shards[shard_index(&key)].write();
            if shard.insert(key, entry).is_none() {
                registry.len.fetch_add(1, Ordering::SeqCst);
            }
        }

        // capacity may have been lowered since the last run
        while registry.evict_one()?.is_some() {}

        info!(
            synapses = registry.len(),
            capacity = registry.config.capacity,
            "Synapse registry loaded"
        );
        Ok(registry)
    }

    fn shard(&self, key: &SynapseKey) -> &Shard {
        &self.shards[shard_index(key)]
    }

    /// Check a record and resolve its anchor height and proof strength.
    fn validate(&self, record: &Synapse) -> Result<(u64, u32), Error> {
        validate_synapse(record)?;
        verify_synapse_signature(record)?;

        let heights = self.oracle.current_height().and_then(|current| {
            let anchor = self.oracle.height_of(&record.block_hash)?;
            Ok((current, anchor))
        });

        match heights {
            Ok((current, Some(anchor))) => {
                self.last_known_height.fetch_max(current, Ordering::Relaxed);
                let bits = self.validator.validate(record, current, anchor)?;
                Ok((anchor, bits))
            }
            Ok((current, None)) => {
                self.last_known_height.fetch_max(current, Ordering::Relaxed);
                match self.config.oracle_policy {
                    OraclePolicy::FailClosed => Err(Error::StaleBlockReference(format!(
                        "unknown block {}",
                        record.block_hash
                    ))),
                    OraclePolicy::FailOpen => self.admit_unanchored(record, current),
                }
            }
            Err(e) => match self.config.oracle_policy {
                OraclePolicy::FailClosed => Err(Error::HeightOracleUnavailable(e.to_string())),
                OraclePolicy::FailOpen => {
                    self.admit_unanchored(record, self.last_known_height.load(Ordering::Relaxed))
                }
            },
        }
    }

    /// Admit a record whose anchor height is unknown as if its anchor were
    /// `max_block_age` old: the oldest difficulty is demanded and the record
    /// expires with the next block.
    fn admit_unanchored(&self, record: &Synapse, current: u64) -> Result<(u64, u32), Error> {
        let difficulty = &self.config.difficulty;
        let bits = self.validator.check_work(record, difficulty.max_required_bits())?;
        let anchor = current.saturating_sub(difficulty.max_block_age);
        warn!(
            synapse = %record.synapse_key.short(),
            anchor_height = anchor,
            "Admitted without a known anchor height"
        );
        Ok((anchor, bits))
    }

    fn admitting(&self, key: SynapseKey) -> AdmittingGuard<'_> {
        *self.admitting.lock().entry(key).or_insert(0) += 1;
        AdmittingGuard { registry: self, key }
    }

    /// Validate and merge one record
    pub fn insert(&self, record: Synapse) -> Result<Admission, RegistryError> {
        if self.config.capacity == 0 {
            return Err(Error::CapacityExceeded { capacity: 0 }.into());
        }

        let (anchor_height, _) = self.validate(&record)?;
        let key = record.synapse_key;
        let entry = IndexEntry::from_record(&record, anchor_height);
        let _admitting = self.admitting(key);

        let admission = {
            let mut shard = self.shard(&key).write();
            let admission = match shard.get(&key) {
                None => Admission::Inserted,
                Some(existing) if existing.neuron_key != record.neuron_key => {
                    return Err(Error::InvalidSignature.into());
                }
                Some(existing) if existing.nounce < record.nounce => Admission::Replaced {
                    previous: existing.nounce,
                },
                Some(existing) if existing.nounce == record.nounce && existing.digest == entry.digest => {
                    return Ok(Admission::Duplicate);
                }
                Some(existing) => {
                    return Ok(Admission::Stale {
                        current: existing.nounce,
                    });
                }
            };
            self.storage.put_synapse(&StoredSynapse {
                anchor_height,
                synapse: record,
            })?;
            shard.insert(key, entry);
            if admission == Admission::Inserted {
                self.len.fetch_add(1, Ordering::SeqCst);
            }
            admission
        };

        while self.evict_one()?.is_some() {}

        // still over capacity: everything left is mid-insert
        if admission == Admission::Inserted && self.remove_over_capacity(&key, &entry)? {
            debug!(synapse = %key.short(), "Synapse withdrawn, registry full");
            return Err(Error::CapacityExceeded {
                capacity: self.config.capacity,
            }
            .into());
        }

        match admission {
            Admission::Inserted => {
                self.inserted.fetch_add(1, Ordering::Relaxed);
                debug!(synapse = %key.short(), nounce = entry.nounce, "Synapse inserted");
            }
            Admission::Replaced { previous } => {
                self.replaced.fetch_add(1, Ordering::Relaxed);
                debug!(synapse = %key.short(), previous, nounce = entry.nounce, "Synapse replaced");
            }
            _ => {}
        }
        Ok(admission)
    }

    /// Remove the lowest-ranked entry while the registry is over capacity.
    ///
    /// Candidates come from a bounded sample of `eviction_sample` entries,
    /// falling back to a full scan when the sample yields nothing usable.
    /// Keys with an insert in progress are never candidates. Returns the
    /// evicted key, or `None` when the registry is within capacity or no
    /// candidate is left.
    pub fn evict_one(&self) -> Result<Option<SynapseKey>, RegistryError> {
        let sample_size = self.config.eviction_sample.max(1);
        let mut attempt = 0;

        while self.len() > self.config.capacity {
            let protected: HashSet<SynapseKey> = self.admitting.lock().keys().copied().collect();
            // a candidate can change between sampling and locking its shard
            let sampled = if attempt < SAMPLED_ATTEMPTS {
                self.sample(sample_size + protected.len())
                    .filter(|(key, _)| !protected.contains(key))
                    .take(sample_size)
                    .min_by_key(|(key, entry)| eviction_rank(key, entry))
            } else {
                None
            };
            attempt += 1;

            let Some((key, entry)) = sampled.or_else(|| self.lowest_ranked(&protected)) else {
                return Ok(None);
            };
            if self.remove_over_capacity(&key, &entry)? {
                self.evicted.fetch_add(1, Ordering::Relaxed);
                debug!(
                    synapse = %key.short(),
                    anchor_height = entry.anchor_height,
                    pow_bits = entry.pow_bits,
                    "Synapse evicted"
                );
                return Ok(Some(key));
            }
        }
        Ok(None)
    }

    /// Full scan for the lowest-ranked unprotected entry
    fn lowest_ranked(&self, protected: &HashSet<SynapseKey>) -> Option<(SynapseKey, IndexEntry)> {
        self.shards
            .iter()
            .filter_map(|shard| {
                shard
                    .read()
                    .iter()
                    .filter(|&(key, _)| !protected.contains(key))
                    .map(|(key, entry)| (*key, *entry))
                    .min_by_key(|(key, entry)| eviction_rank(key, entry))
            })
            .min_by_key(|(key, entry)| eviction_rank(key, entry))
    }

    /// Drop `key` if it still holds `expected` and the registry is over
    /// capacity, both decided under the shard lock.
    fn remove_over_capacity(&self, key: &SynapseKey, expected: &IndexEntry) -> Result<bool, RegistryError> {
        let capacity = self.config.capacity;
        let mut shard = self.shard(key).write();
        if shard.get(key) != Some(expected) {
            return Ok(false);
        }
        if self
            .len
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n > capacity).then(|| n - 1))
            .is_err()
        {
            return Ok(false);
        }
        if let Err(e) = self.storage.remove_synapse(key) {
            self.len.fetch_add(1, Ordering::SeqCst);
            return Err(e.into());
        }
        shard.remove(key);
        Ok(true)
    }

    /// Full record for a key
    pub fn lookup(&self, key: &SynapseKey) -> Result<Synapse, RegistryError> {
        if !self.shard(key).read().contains_key(key) {
            return Err(Error::NotFound(format!("synapse {}", key)).into());
        }
        match self.storage.get_synapse(key)? {
            Some(stored) => Ok(stored.synapse),
            None => Err(Error::NotFound(format!("synapse {}", key)).into()),
        }
    }

    /// `lookup` on the blocking pool
    pub async fn fetch(self: &Arc<Self>, key: SynapseKey) -> Result<Synapse, RegistryError> {
        let registry = self.clone();
        tokio::task::spawn_blocking(move || registry.lookup(&key)).await?
    }

    /// Index entry for a key
    pub fn entry(&self, key: &SynapseKey) -> Option<IndexEntry> {
        self.shard(key).read().get(key).copied()
    }

    pub fn contains(&self, key: &SynapseKey) -> bool {
        self.shard(key).read().contains_key(key)
    }

    /// Random subset of at most `n` index entries.
    ///
    /// Lazy: shards are read one at a time as the iterator advances. Call
    /// again for a fresh sample.
    pub fn sample(&self, n: usize) -> Sample<'_> {
        let mut order: Vec<usize> = (0..SHARD_COUNT).collect();
        order.shuffle(&mut rand::thread_rng());
        let total = self.len();
        Sample {
            registry: self,
            order: order.into_iter(),
            buffer: Vec::new().into_iter(),
            requested: n,
            total,
            remaining: if total == 0 { 0 } else { n },
        }
    }

    /// Full records for a random subset of at most `n` keys
    pub fn sample_records(&self, n: usize) -> Result<Vec<Synapse>, RegistryError> {
        let mut records = Vec::new();
        for (key, _) in self.sample(n) {
            // evicted since sampling
            if let Some(stored) = self.storage.get_synapse(&key)? {
                records.push(stored.synapse);
            }
        }
        Ok(records)
    }

    /// Remove records whose anchor is older than `max_block_age`
    pub fn prune_expired(&self, current_height: u64) -> Result<usize, RegistryError> {
        let max_age = self.config.difficulty.max_block_age;
        let expired = |entry: &IndexEntry| current_height.saturating_sub(entry.anchor_height) > max_age;
        let mut removed = 0;

        for shard in &self.shards {
            let candidates: Vec<SynapseKey> = shard
                .read()
                .iter()
                .filter(|&(_, entry)| expired(entry))
                .map(|(key, _)| *key)
                .collect();
            if candidates.is_empty() {
                continue;
            }

            let mut shard = shard.write();
            for key in candidates {
                // replaced by a fresher record in the meantime
                if !shard.get(&key).is_some_and(|entry| expired(entry)) {
                    continue;
                }
                self.storage.remove_synapse(&key)?;
                shard.remove(&key);
                self.len.fetch_sub(1, Ordering::SeqCst);
                removed += 1;
            }
        }

        if removed > 0 {
            self.pruned.fetch_add(removed as u64, Ordering::Relaxed);
            info!(removed, current_height, "Pruned expired synapses");
        }
        Ok(removed)
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get registry statistics
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            len: self.len(),
            capacity: self.config.capacity,
            inserted: self.inserted.load(Ordering::Relaxed),
            replaced: self.replaced.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            pruned: self.pruned.load(Ordering::Relaxed),
        }
    }
}

/// Marks a key as mid-insert for as long as it lives
struct AdmittingGuard<'a> {
    registry: &'a SynapseRegistry,
    key: SynapseKey,
}

impl Drop for AdmittingGuard<'_> {
    fn drop(&mut self) {
        if let Entry::Occupied(mut pending) = self.registry.admitting.lock().entry(self.key) {
            *pending.get_mut() -= 1;
            if *pending.get() == 0 {
                pending.remove();
            }
        }
    }
}

/// Lazy random sample over the index, see [`SynapseRegistry::sample`]
pub struct Sample<'a> {
    registry: &'a SynapseRegistry,
    order: std::vec::IntoIter<usize>,
    buffer: std::vec::IntoIter<(SynapseKey, IndexEntry)>,
    requested: usize,
    total: usize,
    remaining: usize,
}

impl Iterator for Sample<'_> {
    type Item = (SynapseKey, IndexEntry);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.remaining == 0 {
                return None;
            }
            if let Some(item) = self.buffer.next() {
                self.remaining -= 1;
                return Some(item);
            }

            let index = self.order.next()?;
            let mut rng = rand::thread_rng();
            let mut picked = {
                let shard = self.registry.shards[index].read();
                let quota = (self.requested.saturating_mul(shard.len())).div_ceil(self.total);
                shard
                    .iter()
                    .map(|(key, entry)| (*key, *entry))
                    .choose_multiple(&mut rng, quota)
            };
            picked.shuffle(&mut rng);
            self.buffer = picked.into_iter();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::ManualHeightOracle;
    use metagraph_core::pow::mine;
    use metagraph_net::KeyPair;

    const ANCHOR_OLD: BlockHash = BlockHash([0xa1; 32]);
    const ANCHOR_MID: BlockHash = BlockHash([0xa2; 32]);
    const ANCHOR_NEW: BlockHash = BlockHash([0xa3; 32]);

    fn free_difficulty() -> DifficultyParams {
        DifficultyParams {
            base_bits: 0,
            bits_per_step: 0,
            step_blocks: 10,
            max_block_age: 100,
        }
    }

    fn oracle() -> Arc<ManualHeightOracle> {
        let oracle = ManualHeightOracle::new(50);
        oracle.add_block(ANCHOR_OLD, 10);
        oracle.add_block(ANCHOR_MID, 20);
        oracle.add_block(ANCHOR_NEW, 30);
        Arc::new(oracle)
    }

    fn registry_with(oracle: Arc<ManualHeightOracle>, config: RegistryConfig) -> SynapseRegistry {
        let storage = Arc::new(Storage::temporary().unwrap());
        SynapseRegistry::open(storage, oracle, config).unwrap()
    }

    fn registry(capacity: usize) -> SynapseRegistry {
        registry_with(
            oracle(),
            RegistryConfig {
                capacity,
                difficulty: free_difficulty(),
                ..Default::default()
            },
        )
    }

    fn record(owner: &KeyPair, key: u8, nounce: i32, anchor: BlockHash) -> Synapse {
        let mut synapse = Synapse {
            version: PROTOCOL_VERSION.into(),
            neuron_key: owner.neuron_key(),
            synapse_key: SynapseKey([key; 32]),
            address: "10.0.0.1".into(),
            port: "8091".into(),
            indef: vec![TensorDef::new(vec![-1, 4], DType::Float32, false)],
            outdef: vec![TensorDef::new(vec![-1, 2], DType::Float32, false)],
            block_hash: anchor,
            nounce,
            proof_of_work: [0; 32],
            signature: vec![],
        };
        assert!(mine(&mut synapse, 0, 1).unwrap().is_some());
        owner.sign_synapse(&mut synapse).unwrap();
        synapse
    }

    fn protocol_error(result: Result<Admission, RegistryError>) -> Error {
        match result {
            Err(RegistryError::Protocol(e)) => e,
            other => panic!("expected protocol error, got {:?}", other),
        }
    }

    #[test]
    fn test_insert_then_lookup() {
        let registry = registry(16);
        let owner = KeyPair::from_seed(&[1; 32]);
        let synapse = record(&owner, 7, 1, ANCHOR_NEW);

        assert_eq!(registry.insert(synapse.clone()).unwrap(), Admission::Inserted);
        assert_eq!(registry.lookup(&synapse.synapse_key).unwrap(), synapse);
        assert_eq!(registry.len(), 1);

        let entry = registry.entry(&synapse.synapse_key).unwrap();
        assert_eq!(entry.anchor_height, 30);
        assert_eq!(entry.nounce, 1);
    }

    #[test]
    fn test_lookup_missing() {
        let registry = registry(16);
        let err = registry.lookup(&SynapseKey([9; 32])).unwrap_err();
        assert!(matches!(err.protocol(), Some(Error::NotFound(_))));
    }

    #[test]
    fn test_nounce_order_converges() {
        let owner = KeyPair::from_seed(&[1; 32]);
        let older = record(&owner, 7, 1, ANCHOR_NEW);
        let newer = record(&owner, 7, 2, ANCHOR_NEW);

        let a = registry(16);
        assert_eq!(a.insert(older.clone()).unwrap(), Admission::Inserted);
        assert_eq!(a.insert(newer.clone()).unwrap(), Admission::Replaced { previous: 1 });

        let b = registry(16);
        assert_eq!(b.insert(newer.clone()).unwrap(), Admission::Inserted);
        assert_eq!(b.insert(older).unwrap(), Admission::Stale { current: 2 });

        let key = newer.synapse_key;
        assert_eq!(a.lookup(&key).unwrap(), newer);
        assert_eq!(b.lookup(&key).unwrap(), newer);
    }

    #[test]
    fn test_resubmit_is_idempotent() {
        let registry = registry(16);
        let owner = KeyPair::from_seed(&[1; 32]);
        let synapse = record(&owner, 7, 3, ANCHOR_NEW);

        registry.insert(synapse.clone()).unwrap();
        assert_eq!(registry.insert(synapse.clone()).unwrap(), Admission::Duplicate);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.stats().inserted, 1);
    }

    #[test]
    fn test_equal_nounce_different_record_is_stale() {
        let registry = registry(16);
        let owner = KeyPair::from_seed(&[1; 32]);
        let first = record(&owner, 7, 3, ANCHOR_NEW);
        let mut second = first.clone();
        second.address = "10.0.0.2".into();
        mine(&mut second, 0, 1).unwrap();
        owner.sign_synapse(&mut second).unwrap();

        registry.insert(first.clone()).unwrap();
        assert_eq!(registry.insert(second).unwrap(), Admission::Stale { current: 3 });
        assert_eq!(registry.lookup(&first.synapse_key).unwrap(), first);
    }

    #[test]
    fn test_invalid_records_leave_state_unchanged() {
        let registry = registry(16);
        let owner = KeyPair::from_seed(&[1; 32]);
        let held = record(&owner, 7, 1, ANCHOR_NEW);
        registry.insert(held.clone()).unwrap();

        let mut forged = record(&owner, 7, 5, ANCHOR_NEW);
        forged.port = "9999".into();
        assert!(matches!(protocol_error(registry.insert(forged)), Error::InvalidSignature));

        let mut malformed = record(&owner, 8, 1, ANCHOR_NEW);
        malformed.address = String::new();
        assert!(matches!(protocol_error(registry.insert(malformed)), Error::MalformedRecord(_)));

        let unknown = record(&owner, 9, 1, BlockHash([0xff; 32]));
        assert!(matches!(
            protocol_error(registry.insert(unknown)),
            Error::StaleBlockReference(_)
        ));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.lookup(&held.synapse_key).unwrap(), held);
    }

    #[test]
    fn test_other_owner_cannot_replace() {
        let registry = registry(16);
        let owner = KeyPair::from_seed(&[1; 32]);
        let intruder = KeyPair::from_seed(&[2; 32]);
        let held = record(&owner, 7, 1, ANCHOR_NEW);
        registry.insert(held.clone()).unwrap();

        let takeover = record(&intruder, 7, 9, ANCHOR_NEW);
        assert!(matches!(protocol_error(registry.insert(takeover)), Error::InvalidSignature));
        assert_eq!(registry.lookup(&held.synapse_key).unwrap(), held);
    }

    #[test]
    fn test_stale_anchor_rejected() {
        let oracle = oracle();
        oracle.set_height(200);
        let registry = registry_with(
            oracle,
            RegistryConfig {
                difficulty: free_difficulty(),
                ..Default::default()
            },
        );
        let owner = KeyPair::from_seed(&[1; 32]);
        assert!(matches!(
            protocol_error(registry.insert(record(&owner, 7, 1, ANCHOR_OLD))),
            Error::StaleBlockReference(_)
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_capacity_evicts_oldest_anchor() {
        let registry = registry(2);
        let owner = KeyPair::from_seed(&[1; 32]);

        registry.insert(record(&owner, 1, 1, ANCHOR_OLD)).unwrap();
        registry.insert(record(&owner, 2, 1, ANCHOR_NEW)).unwrap();
        registry.insert(record(&owner, 3, 1, ANCHOR_MID)).unwrap();

        assert_eq!(registry.len(), 2);
        assert!(!registry.contains(&SynapseKey([1; 32])));
        assert!(registry.contains(&SynapseKey([2; 32])));
        assert!(registry.contains(&SynapseKey([3; 32])));
        assert_eq!(registry.stats().evicted, 1);
    }

    #[test]
    fn test_inserted_key_never_evicted() {
        let registry = registry(2);
        let owner = KeyPair::from_seed(&[1; 32]);

        registry.insert(record(&owner, 1, 1, ANCHOR_MID)).unwrap();
        registry.insert(record(&owner, 2, 1, ANCHOR_NEW)).unwrap();
        // the newcomer has the oldest anchor but must survive its own insert
        registry.insert(record(&owner, 3, 1, ANCHOR_OLD)).unwrap();

        assert_eq!(registry.len(), 2);
        assert!(registry.contains(&SynapseKey([3; 32])));
        assert!(!registry.contains(&SynapseKey([1; 32])));
    }

    #[test]
    fn test_eviction_rank_order() {
        let entry = |anchor_height, pow_bits| IndexEntry {
            neuron_key: NeuronKey([0; 32]),
            nounce: 0,
            anchor_height,
            pow_bits,
            digest: [0; 32],
        };
        let low = SynapseKey([1; 32]);
        let high = SynapseKey([2; 32]);

        assert!(eviction_rank(&high, &entry(5, 20)) < eviction_rank(&low, &entry(6, 0)));
        assert!(eviction_rank(&high, &entry(5, 3)) < eviction_rank(&low, &entry(5, 4)));
        assert!(eviction_rank(&low, &entry(5, 3)) < eviction_rank(&high, &entry(5, 3)));
    }

    #[test]
    fn test_zero_capacity() {
        let registry = registry(0);
        let owner = KeyPair::from_seed(&[1; 32]);
        assert!(matches!(
            protocol_error(registry.insert(record(&owner, 1, 1, ANCHOR_NEW))),
            Error::CapacityExceeded { capacity: 0 }
        ));
    }

    #[test]
    fn test_concurrent_same_key_single_winner() {
        let registry = Arc::new(registry(16));
        let owner = KeyPair::from_seed(&[1; 32]);
        let records: Vec<Synapse> = (0..8)
            .map(|i| {
                let mut synapse = record(&owner, 7, 4, ANCHOR_NEW);
                synapse.address = format!("10.0.1.{}", i);
                mine(&mut synapse, 0, 1).unwrap();
                owner.sign_synapse(&mut synapse).unwrap();
                synapse
            })
            .collect();

        let outcomes: Vec<Admission> = std::thread::scope(|scope| {
            let handles: Vec<_> = records
                .iter()
                .cloned()
                .map(|synapse| {
                    let registry = registry.clone();
                    scope.spawn(move || registry.insert(synapse).unwrap())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let winners = outcomes.iter().filter(|a| **a == Admission::Inserted).count();
        assert_eq!(winners, 1);
        assert_eq!(registry.len(), 1);
        let held = registry.lookup(&SynapseKey([7; 32])).unwrap();
        assert!(records.contains(&held));
    }

    #[test]
    fn test_oracle_fail_closed() {
        let oracle = oracle();
        oracle.set_offline(true);
        let registry = registry_with(
            oracle,
            RegistryConfig {
                difficulty: free_difficulty(),
                ..Default::default()
            },
        );
        let owner = KeyPair::from_seed(&[1; 32]);
        assert!(matches!(
            protocol_error(registry.insert(record(&owner, 1, 1, ANCHOR_NEW))),
            Error::HeightOracleUnavailable(_)
        ));
    }

    #[test]
    fn test_oracle_fail_open() {
        const ANCHOR_RECENT: BlockHash = BlockHash([0xa4; 32]);
        let oracle = oracle();
        oracle.add_block(ANCHOR_RECENT, 140);
        oracle.set_height(150);
        let registry = registry_with(
            oracle.clone(),
            RegistryConfig {
                difficulty: free_difficulty(),
                oracle_policy: OraclePolicy::FailOpen,
                ..Default::default()
            },
        );
        let owner = KeyPair::from_seed(&[1; 32]);

        let anchored = record(&owner, 1, 1, ANCHOR_RECENT);
        registry.insert(anchored).unwrap();

        // unknown anchor while the oracle answers
        let unknown = record(&owner, 2, 1, BlockHash([0xff; 32]));
        assert_eq!(registry.insert(unknown).unwrap(), Admission::Inserted);
        assert_eq!(registry.entry(&SynapseKey([2; 32])).unwrap().anchor_height, 50);

        oracle.set_offline(true);
        let offline = record(&owner, 3, 1, ANCHOR_RECENT);
        assert_eq!(registry.insert(offline).unwrap(), Admission::Inserted);
        assert_eq!(registry.entry(&SynapseKey([3; 32])).unwrap().anchor_height, 50);

        // assumed max_block_age old: kept at the current height, gone one block later
        assert_eq!(registry.prune_expired(150).unwrap(), 0);
        assert_eq!(registry.prune_expired(151).unwrap(), 2);
        assert!(registry.contains(&SynapseKey([1; 32])));
    }

    #[test]
    fn test_fail_open_demands_oldest_difficulty() {
        let oracle = oracle();
        oracle.set_offline(true);
        let registry = registry_with(
            oracle,
            RegistryConfig {
                difficulty: DifficultyParams {
                    base_bits: 0,
                    bits_per_step: 8,
                    step_blocks: 10,
                    max_block_age: 100,
                },
                oracle_policy: OraclePolicy::FailOpen,
                ..Default::default()
            },
        );
        let owner = KeyPair::from_seed(&[1; 32]);
        let mut weak = record(&owner, 1, 1, ANCHOR_NEW);
        while leading_zero_bits(&weak.proof_of_work) >= 80 {
            weak = record(&owner, 1, weak.nounce + 1, ANCHOR_NEW);
        }
        assert!(matches!(
            protocol_error(registry.insert(weak)),
            Error::InvalidProofOfWork { required: 80, .. }
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_small_eviction_sample_keeps_capacity() {
        let owner = KeyPair::from_seed(&[1; 32]);
        let records = [
            record(&owner, 1, 1, ANCHOR_OLD),
            record(&owner, 2, 1, ANCHOR_NEW),
            record(&owner, 3, 1, ANCHOR_MID),
        ];

        for _ in 0..64 {
            let registry = registry_with(
                oracle(),
                RegistryConfig {
                    capacity: 2,
                    eviction_sample: 1,
                    difficulty: free_difficulty(),
                    ..Default::default()
                },
            );
            for synapse in &records {
                assert_eq!(registry.insert(synapse.clone()).unwrap(), Admission::Inserted);
                assert!(registry.len() <= 2);
            }
            assert_eq!(registry.len(), 2);
            assert!(registry.contains(&SynapseKey([3; 32])));
            assert_eq!(registry.sample_records(8).unwrap().len(), 2);
            assert_eq!(registry.stats().evicted, 1);
        }
    }

    #[test]
    fn test_concurrent_distinct_inserts_at_capacity() {
        let owner = KeyPair::from_seed(&[1; 32]);
        let anchors = [ANCHOR_OLD, ANCHOR_MID, ANCHOR_NEW];
        let records: Vec<Synapse> = (0..24u8)
            .map(|key| record(&owner, key, 1, anchors[key as usize % 3]))
            .collect();

        for _ in 0..8 {
            let registry = Arc::new(registry_with(
                oracle(),
                RegistryConfig {
                    capacity: 4,
                    eviction_sample: 1,
                    difficulty: free_difficulty(),
                    ..Default::default()
                },
            ));

            let outcomes: Vec<Result<Admission, RegistryError>> = std::thread::scope(|scope| {
                let handles: Vec<_> = records
                    .iter()
                    .cloned()
                    .map(|synapse| {
                        let registry = registry.clone();
                        scope.spawn(move || registry.insert(synapse))
                    })
                    .collect();
                handles.into_iter().map(|h| h.join().unwrap()).collect()
            });

            for outcome in outcomes {
                match outcome {
                    Ok(admission) => assert_eq!(admission, Admission::Inserted),
                    Err(e) => assert!(matches!(e.protocol(), Some(Error::CapacityExceeded { capacity: 4 }))),
                }
            }
            let held = (0..24u8).filter(|key| registry.contains(&SynapseKey([*key; 32]))).count();
            assert_eq!(registry.len(), 4);
            assert_eq!(held, 4);
            assert_eq!(registry.sample_records(64).unwrap().len(), 4);
        }
    }

    #[test]
    fn test_weaker_proof_evicted_on_equal_anchor() {
        let registry = registry(2);
        let owner = KeyPair::from_seed(&[1; 32]);

        let mut strong = record(&owner, 1, 1, ANCHOR_MID);
        let strong_bits = mine(&mut strong, 8, 1 << 20).unwrap().unwrap();
        owner.sign_synapse(&mut strong).unwrap();

        // higher key, so only the proof strength can make it the victim
        let mut weak = record(&owner, 2, 1, ANCHOR_MID);
        while leading_zero_bits(&weak.proof_of_work) >= strong_bits {
            weak = record(&owner, 2, weak.nounce + 1, ANCHOR_MID);
        }

        registry.insert(strong).unwrap();
        registry.insert(weak).unwrap();
        assert!(
            registry.entry(&SynapseKey([2; 32])).unwrap().pow_bits
                < registry.entry(&SynapseKey([1; 32])).unwrap().pow_bits
        );

        registry.insert(record(&owner, 3, 1, ANCHOR_NEW)).unwrap();
        assert!(registry.contains(&SynapseKey([1; 32])));
        assert!(!registry.contains(&SynapseKey([2; 32])));
        assert!(registry.contains(&SynapseKey([3; 32])));
    }

    #[test]
    fn test_sample_bounded_and_distinct() {
        let registry = registry(256);
        let owner = KeyPair::from_seed(&[1; 32]);
        for key in 0..40u8 {
            registry.insert(record(&owner, key, 1, ANCHOR_NEW)).unwrap();
        }

        let mut keys: Vec<SynapseKey> = registry.sample(10).map(|(key, _)| key).collect();
        assert_eq!(keys.len(), 10);
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), 10);

        assert_eq!(registry.sample(100).count(), 40);
        assert_eq!(registry.sample_records(5).unwrap().len(), 5);
        assert_eq!(registry.sample(0).count(), 0);
    }

    #[test]
    fn test_prune_expired() {
        let oracle = oracle();
        let registry = registry_with(
            oracle,
            RegistryConfig {
                difficulty: free_difficulty(),
                ..Default::default()
            },
        );
        let owner = KeyPair::from_seed(&[1; 32]);
        registry.insert(record(&owner, 1, 1, ANCHOR_OLD)).unwrap();
        registry.insert(record(&owner, 2, 1, ANCHOR_NEW)).unwrap();

        // ANCHOR_OLD at 10 is 101 blocks old, ANCHOR_NEW at 30 is 81
        assert_eq!(registry.prune_expired(111).unwrap(), 1);
        assert!(!registry.contains(&SynapseKey([1; 32])));
        assert!(registry.contains(&SynapseKey([2; 32])));
        assert_eq!(registry.stats().pruned, 1);
    }

    #[test]
    fn test_reopen_rebuilds_index() {
        let dir = tempfile::tempdir().unwrap();
        let owner = KeyPair::from_seed(&[1; 32]);
        let synapse = record(&owner, 5, 2, ANCHOR_MID);
        let config = RegistryConfig {
            difficulty: free_difficulty(),
            ..Default::default()
        };
        {
            let storage = Arc::new(Storage::open(dir.path()).unwrap());
            let registry = SynapseRegistry::open(storage.clone(), oracle(), config).unwrap();
            registry.insert(synapse.clone()).unwrap();
            storage.flush().unwrap();
        }

        let storage = Arc::new(Storage::open(dir.path()).unwrap());
        let registry = SynapseRegistry::open(storage, oracle(), config).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.lookup(&synapse.synapse_key).unwrap(), synapse);
        assert_eq!(registry.entry(&synapse.synapse_key).unwrap().anchor_height, 20);
    }

    #[tokio::test]
    async fn test_fetch() {
        let registry = Arc::new(registry(16));
        let owner = KeyPair::from_seed(&[1; 32]);
        let synapse = record(&owner, 7, 1, ANCHOR_NEW);
        registry.insert(synapse.clone()).unwrap();
        assert_eq!(registry.fetch(synapse.synapse_key).await.unwrap(), synapse);
    }
}

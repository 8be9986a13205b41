//! Push-pull gossip of synapse records and peer addresses

use crate::registry::{Admission, RegistryError, SynapseRegistry};
use metagraph_core::types::*;
use metagraph_core::Error;
use metagraph_net::peer::{FailureOutcome, PeerDirectory};
use metagraph_net::transport::GossipClient;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Gossip tuning
#[derive(Debug, Clone)]
pub struct GossipConfig {
    /// Peers contacted per round
    pub fanout: usize,
    /// Maximum synapses per batch, both directions
    pub max_batch_records: usize,
    /// Maximum peer addresses per batch, both directions
    pub max_batch_peers: usize,
    /// Seeds merged whenever the directory runs empty
    pub bootstrap: Vec<String>,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            fanout: 3,
            max_batch_records: 256,
            max_batch_peers: 64,
            bootstrap: Vec::new(),
        }
    }
}

/// Per-record outcome counts for one ingested batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub admitted: usize,
    pub replaced: usize,
    pub duplicates: usize,
    pub stale: usize,
    pub rejected: usize,
    pub new_peers: usize,
}

impl IngestReport {
    fn absorb(&mut self, other: IngestReport) {
        self.admitted += other.admitted;
        self.replaced += other.replaced;
        self.duplicates += other.duplicates;
        self.stale += other.stale;
        self.rejected += other.rejected;
        self.new_peers += other.new_peers;
    }
}

/// Outcome of one outbound gossip round
#[derive(Debug, Clone, Default)]
pub struct RoundReport {
    pub contacted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub dropped: usize,
    pub ingested: IngestReport,
}

/// Gossip statistics
#[derive(Debug, Clone)]
pub struct GossipStats {
    pub peer_count: usize,
    pub rounds: u64,
    pub batches_received: u64,
}

/// Merges inbound batches and pushes samples of the registry to peers
pub struct GossipExchanger {
    registry: Arc<SynapseRegistry>,
    peers: Arc<PeerDirectory>,
    config: GossipConfig,
    rounds: AtomicU64,
    batches_received: AtomicU64,
}

impl GossipExchanger {
    pub fn new(registry: Arc<SynapseRegistry>, peers: Arc<PeerDirectory>, config: GossipConfig) -> Self {
        Self {
            registry,
            peers,
            config,
            rounds: AtomicU64::new(0),
            batches_received: AtomicU64::new(0),
        }
    }

    pub fn peers(&self) -> &Arc<PeerDirectory> {
        &self.peers
    }

    /// Merge a batch. Records are admitted independently and in parallel;
    /// a bad record only counts as rejected.
    ///
    /// At most `max_batch_records` records and `max_batch_peers` addresses
    /// are taken from one batch; surplus records count as rejected.
    pub async fn handle_batch(&self, mut batch: GossipBatch) -> IngestReport {
        self.batches_received.fetch_add(1, Ordering::Relaxed);
        if batch.version != GOSSIP_VERSION {
            debug!(version = batch.version, "Gossip batch from a different protocol version");
        }

        batch.peers.truncate(self.config.max_batch_peers);
        let surplus = batch.synapses.len().saturating_sub(self.config.max_batch_records);
        if surplus > 0 {
            debug!(surplus, "Oversized gossip batch truncated");
            batch.synapses.truncate(self.config.max_batch_records);
        }

        let mut report = IngestReport {
            new_peers: self.peers.merge_all(&batch.peers),
            rejected: surplus,
            ..Default::default()
        };

        let mut tasks = JoinSet::new();
        for record in batch.synapses {
            let registry = self.registry.clone();
            tasks.spawn_blocking(move || {
                let key = record.synapse_key;
                (key, registry.insert(record))
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(Admission::Inserted))) => report.admitted += 1,
                Ok((_, Ok(Admission::Replaced { .. }))) => report.replaced += 1,
                Ok((_, Ok(Admission::Duplicate))) => report.duplicates += 1,
                Ok((_, Ok(Admission::Stale { .. }))) => report.stale += 1,
                Ok((key, Err(e))) => {
                    report.rejected += 1;
                    debug!(synapse = %key.short(), error = %e, "Gossip record rejected");
                }
                Err(e) => {
                    report.rejected += 1;
                    warn!(error = %e, "Admission task failed");
                }
            }
        }

        if report.admitted + report.replaced > 0 {
            debug!(
                admitted = report.admitted,
                replaced = report.replaced,
                rejected = report.rejected,
                "Gossip batch merged"
            );
        }
        report
    }

    /// Serve one Gossip RPC: ingest, then answer with our own sample
    pub async fn respond(&self, batch: GossipBatch) -> Result<GossipBatch, RegistryError> {
        self.handle_batch(batch).await;
        self.build_batch().await
    }

    /// Sample records and peers (plus our own address) into a batch
    pub async fn build_batch(&self) -> Result<GossipBatch, RegistryError> {
        let registry = self.registry.clone();
        let n = self.config.max_batch_records;
        let synapses = tokio::task::spawn_blocking(move || registry.sample_records(n)).await??;

        let mut peers = self.peers.sample(self.config.max_batch_peers);
        if let Some(own) = self.peers.own_address() {
            peers.push(own.to_string());
        }
        Ok(GossipBatch::new(peers, synapses))
    }

    /// Push a batch to `fanout` random peers and ingest their replies
    pub async fn run_round<C: GossipClient>(&self, client: &C) -> Result<RoundReport, RegistryError> {
        self.rounds.fetch_add(1, Ordering::Relaxed);
        let mut report = RoundReport::default();

        if self.peers.is_empty() && !self.config.bootstrap.is_empty() {
            let merged = self.peers.merge_all(&self.config.bootstrap);
            info!(merged, "Peer directory empty, merged bootstrap peers");
        }

        let targets = self.peers.sample(self.config.fanout);
        if targets.is_empty() {
            debug!("No peers to gossip with");
            return Ok(report);
        }

        let batch = self.build_batch().await?;
        let exchanges = targets.iter().map(|addr| {
            let batch = batch.clone();
            async move { (addr, client.exchange(addr, batch).await) }
        });
        let results = futures::future::join_all(exchanges).await;
        report.contacted = targets.len();

        for (addr, result) in results {
            match result {
                Ok(reply) => {
                    self.peers.record_success(addr);
                    report.succeeded += 1;
                    let ingested = self.handle_batch(reply).await;
                    report.ingested.absorb(ingested);
                }
                Err(e) => {
                    report.failed += 1;
                    let error = Error::PeerUnreachable(format!("{}: {}", addr, e));
                    match self.peers.record_failure(addr) {
                        FailureOutcome::Dropped => {
                            report.dropped += 1;
                            info!(peer = %addr, error = %error, "Dropped stale peer");
                        }
                        FailureOutcome::Retained(failures) => {
                            debug!(peer = %addr, failures, error = %error, "Gossip push failed");
                        }
                        FailureOutcome::Unknown => {}
                    }
                }
            }
        }

        debug!(
            contacted = report.contacted,
            succeeded = report.succeeded,
            admitted = report.ingested.admitted,
            peers = self.peers.len(),
            "Gossip round complete"
        );
        Ok(report)
    }

    /// Get gossip statistics
    pub fn stats(&self) -> GossipStats {
        GossipStats {
            peer_count: self.peers.len(),
            rounds: self.rounds.load(Ordering::Relaxed),
            batches_received: self.batches_received.load(Ordering::Relaxed),
        }
    }
}

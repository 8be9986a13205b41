//! Signed, nounce-ordered Forward/Backward calls
//!
//! Every `(neuron_key, synapse_key)` pair gets its own connection state:
//!
//! ```text
//! New --(valid call reserved)--> Verified --(call committed)--> Active
//!  any state --(replayed nounce)--> Rejected
//!  Rejected --(signed handshake)--> New
//! ```
//!
//! Only messages carrying a valid signature for their `neuron_key` reach a
//! connection: a bad signature fails the call and neither creates nor
//! changes any connection state. Calls naming an unregistered synapse are
//! refused before a connection is created as well.
//!
//! A nounce is reserved when a call passes the ordering check and only
//! becomes `last_seen_nounce` once the call completes. Failed or dropped
//! calls release their reservation, so they never advance the connection.

use crate::registry::{RegistryError, SynapseRegistry};
use metagraph_core::crypto::verify_message_signature;
use metagraph_core::schema;
use metagraph_core::types::*;
use metagraph_core::Error;
use metagraph_net::KeyPair;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Tensor call errors
#[derive(Debug, Error)]
pub enum CallError {
    #[error(transparent)]
    Protocol(#[from] Error),
    #[error("Registry error: {0}")]
    Registry(RegistryError),
    #[error("Blocking task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl From<RegistryError> for CallError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::Protocol(e) => CallError::Protocol(e),
            other => CallError::Registry(other),
        }
    }
}

impl CallError {
    /// The protocol error, if this is one
    pub fn protocol(&self) -> Option<&Error> {
        match self {
            CallError::Protocol(e) => Some(e),
            _ => None,
        }
    }
}

/// Runs the tensor math behind a synapse
pub trait ComputeExecutor: Send + Sync {
    /// `tensors` already match the synapse schema for `kind`
    fn execute(&self, kind: CallKind, synapse: &Synapse, tensors: Vec<Tensor>) -> Result<Vec<Tensor>, Error>;
}

/// Identity executor.
///
/// Forward returns the inputs; Backward returns one gradient slot per input
/// (the first `indef.len()` tensors it was given).
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoExecutor;

impl ComputeExecutor for EchoExecutor {
    fn execute(&self, kind: CallKind, synapse: &Synapse, mut tensors: Vec<Tensor>) -> Result<Vec<Tensor>, Error> {
        if kind == CallKind::Backward {
            tensors.truncate(synapse.indef.len());
        }
        Ok(tensors)
    }
}

/// Connection lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Verified,
    Active,
    Rejected,
}

#[derive(Debug)]
struct Connection {
    state: ConnectionState,
    last_seen_nounce: Option<i64>,
    in_flight: HashSet<i64>,
    last_activity: Instant,
}

impl Connection {
    fn new() -> Self {
        Self {
            state: ConnectionState::New,
            last_seen_nounce: None,
            in_flight: HashSet::new(),
            last_activity: Instant::now(),
        }
    }
}

/// Holds a nounce in flight; releases it on drop
struct Reservation {
    connection: Arc<Mutex<Connection>>,
    nounce: i64,
}

impl Reservation {
    /// Advance the connection past this nounce
    fn commit(self) {
        {
            let mut conn = self.connection.lock();
            let nounce = self.nounce;
            conn.last_seen_nounce = Some(conn.last_seen_nounce.map_or(nounce, |last| last.max(nounce)));
            // a concurrent violation may have rejected the connection meanwhile
            if conn.state != ConnectionState::Rejected {
                conn.state = ConnectionState::Active;
            }
            conn.last_activity = Instant::now();
        }
        // drop releases the in-flight slot
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.connection.lock().in_flight.remove(&self.nounce);
    }
}

type ConnectionKey = (NeuronKey, SynapseKey);

/// Transport statistics
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    pub connections: usize,
    pub active: usize,
    pub rejected: usize,
    pub in_flight: usize,
    pub calls_completed: u64,
    pub calls_failed: u64,
}

/// Forward/Backward call handler
pub struct TensorTransport {
    keypair: KeyPair,
    registry: Arc<SynapseRegistry>,
    executor: Arc<dyn ComputeExecutor>,
    connections: RwLock<HashMap<ConnectionKey, Arc<Mutex<Connection>>>>,
    calls_completed: AtomicU64,
    calls_failed: AtomicU64,
}

impl TensorTransport {
    pub fn new(keypair: KeyPair, registry: Arc<SynapseRegistry>, executor: Arc<dyn ComputeExecutor>) -> Self {
        Self {
            keypair,
            registry,
            executor,
            connections: RwLock::new(HashMap::new()),
            calls_completed: AtomicU64::new(0),
            calls_failed: AtomicU64::new(0),
        }
    }

    fn connection(&self, key: ConnectionKey) -> Arc<Mutex<Connection>> {
        if let Some(conn) = self.connections.read().get(&key) {
            return conn.clone();
        }
        self.connections
            .write()
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(Connection::new())))
            .clone()
    }

    pub async fn forward(&self, message: TensorMessage) -> Result<TensorMessage, CallError> {
        self.call(CallKind::Forward, message).await
    }

    pub async fn backward(&self, message: TensorMessage) -> Result<TensorMessage, CallError> {
        self.call(CallKind::Backward, message).await
    }

    /// Run one call and return the signed reply
    pub async fn call(&self, kind: CallKind, message: TensorMessage) -> Result<TensorMessage, CallError> {
        let result = self.run_call(kind, message).await;
        match &result {
            Ok(_) => self.calls_completed.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.calls_failed.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    async fn run_call(&self, kind: CallKind, message: TensorMessage) -> Result<TensorMessage, CallError> {
        let key = (message.neuron_key, message.synapse_key);
        verify_message_signature(&message)?;
        if !self.registry.contains(&message.synapse_key) {
            return Err(Error::NotFound(format!("synapse {}", message.synapse_key)).into());
        }
        let reservation = self.reserve(key, message.nounce)?;

        let synapse = self.registry.fetch(message.synapse_key).await?;
        schema::check_call(kind, &synapse, &message.tensors)?;

        let executor = self.executor.clone();
        let tensors = message.tensors;
        let outputs = tokio::task::spawn_blocking(move || executor.execute(kind, &synapse, tensors)).await??;

        reservation.commit();
        debug!(
            neuron = %key.0.short(),
            synapse = %key.1.short(),
            nounce = message.nounce,
            %kind,
            "Call completed"
        );
        Ok(self.keypair.sign_message(message.synapse_key, message.nounce, outputs))
    }

    /// Connection-level checks for an authenticated call: rejection, nounce ordering
    fn reserve(&self, key: ConnectionKey, nounce: i64) -> Result<Reservation, Error> {
        let connection = self.connection(key);
        let mut conn = connection.lock();

        // retries against a rejected connection do not count as activity
        if conn.state == ConnectionState::Rejected {
            return Err(Error::ConnectionRejected);
        }
        conn.last_activity = Instant::now();

        let fresh = conn.last_seen_nounce.map_or(true, |last| nounce > last) && !conn.in_flight.contains(&nounce);
        if !fresh {
            conn.state = ConnectionState::Rejected;
            warn!(
                neuron = %key.0.short(),
                synapse = %key.1.short(),
                nounce,
                last_seen = ?conn.last_seen_nounce,
                "Connection rejected: replayed nounce"
            );
            return Err(Error::ReplayedNounce {
                offered: nounce,
                last_seen: conn.last_seen_nounce,
            });
        }

        conn.in_flight.insert(nounce);
        if conn.state == ConnectionState::New {
            conn.state = ConnectionState::Verified;
        }
        drop(conn);

        Ok(Reservation { connection, nounce })
    }

    /// Reopen a rejected connection. Returns true if one was rejected.
    ///
    /// The nounce high-water mark is kept, so old nounces stay unusable.
    pub fn handshake(&self, neuron_key: NeuronKey, synapse_key: SynapseKey) -> bool {
        let Some(connection) = self.connections.read().get(&(neuron_key, synapse_key)).cloned() else {
            return false;
        };
        let mut conn = connection.lock();
        if conn.state != ConnectionState::Rejected {
            return false;
        }
        conn.state = ConnectionState::New;
        conn.last_activity = Instant::now();
        info!(neuron = %neuron_key.short(), synapse = %synapse_key.short(), "Connection re-handshaken");
        true
    }

    /// Handle a signed handshake received over the wire.
    ///
    /// The signature proves the caller owns `neuron_key`. The nounce must
    /// exceed the connection's high-water mark and becomes the new one, so
    /// a handshake cannot be replayed. Reopens a Rejected connection and
    /// returns the acknowledgement, signed by the local key.
    pub fn accept_handshake(&self, message: &TensorMessage) -> Result<TensorMessage, Error> {
        verify_message_signature(message)?;
        let key = (message.neuron_key, message.synapse_key);

        let connection = self.connections.read().get(&key).cloned();
        if let Some(connection) = connection {
            let mut conn = connection.lock();
            if conn.last_seen_nounce.is_some_and(|last| message.nounce <= last) {
                return Err(Error::ReplayedNounce {
                    offered: message.nounce,
                    last_seen: conn.last_seen_nounce,
                });
            }
            conn.last_seen_nounce = Some(message.nounce);
            conn.last_activity = Instant::now();
            if conn.state == ConnectionState::Rejected {
                conn.state = ConnectionState::New;
                info!(
                    neuron = %key.0.short(),
                    synapse = %key.1.short(),
                    nounce = message.nounce,
                    "Connection reopened by handshake"
                );
            }
        }
        Ok(self.keypair.sign_message(message.synapse_key, message.nounce, Vec::new()))
    }

    /// Current state of a connection
    pub fn state(&self, neuron_key: NeuronKey, synapse_key: SynapseKey) -> Option<ConnectionState> {
        let connection = self.connections.read().get(&(neuron_key, synapse_key)).cloned()?;
        let state = connection.lock().state;
        Some(state)
    }

    /// Highest committed nounce of a connection
    pub fn last_seen_nounce(&self, neuron_key: NeuronKey, synapse_key: SynapseKey) -> Option<i64> {
        let connection = self.connections.read().get(&(neuron_key, synapse_key)).cloned()?;
        let last = connection.lock().last_seen_nounce;
        last
    }

    /// Drop connections idle for longer than `max_idle` with nothing in flight
    pub fn prune_idle(&self, max_idle: Duration) -> usize {
        let mut connections = self.connections.write();
        let before = connections.len();
        connections.retain(|_, connection| {
            let conn = connection.lock();
            !conn.in_flight.is_empty() || conn.last_activity.elapsed() <= max_idle
        });
        let removed = before - connections.len();
        if removed > 0 {
            debug!(removed, "Pruned idle connections");
        }
        removed
    }

    /// Get transport statistics
    pub fn stats(&self) -> TransportStats {
        let connections = self.connections.read();
        let mut stats = TransportStats {
            connections: connections.len(),
            calls_completed: self.calls_completed.load(Ordering::Relaxed),
            calls_failed: self.calls_failed.load(Ordering::Relaxed),
            ..Default::default()
        };
        for connection in connections.values() {
            let conn = connection.lock();
            match conn.state {
                ConnectionState::Active => stats.active += 1,
                ConnectionState::Rejected => stats.rejected += 1,
                _ => {}
            }
            stats.in_flight += conn.in_flight.len();
        }
        stats
    }
}

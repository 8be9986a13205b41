//! metagraphd server - main service loop

use crate::config::{Config, NodeState, OraclePolicy};
use crate::gossip::{GossipConfig, GossipExchanger, GossipStats};
use crate::oracle::{HeightOracle, ManualHeightOracle};
use crate::registry::{RegistryConfig, RegistryError, RegistryStats, SynapseRegistry};
use crate::storage::Storage;
use crate::tensor::{CallError, ComputeExecutor, EchoExecutor, TensorTransport, TransportStats};
use futures::{SinkExt, StreamExt};
use metagraph_core::types::*;
use metagraph_core::Error;
use metagraph_net::crypto::KeyPair;
use metagraph_net::framing::{Frame, FrameCodec, FrameError, FrameType, RpcFailure};
use metagraph_net::peer::PeerDirectory;
use metagraph_net::transport::TcpTransport;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::interval;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

/// Code for failures outside the protocol taxonomy (storage, task panics)
pub const INTERNAL_ERROR_CODE: u16 = 0;

const PRUNE_INTERVAL: Duration = Duration::from_secs(3600);

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Bind failed on {0}: {1}")]
    BindFailed(SocketAddr, #[source] std::io::Error),
}

/// Server state
pub struct Server {
    config: Config,
    keypair: KeyPair,
    storage: Arc<Storage>,
    oracle: Arc<dyn HeightOracle>,
    registry: Arc<SynapseRegistry>,
    exchanger: Arc<GossipExchanger>,
    transport: Arc<TensorTransport>,
    client: TcpTransport,
    /// Shutdown signal
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Create a server with the default collaborators: a manual height
    /// oracle seeded from `--chain-height` and `--anchor`, and the echo
    /// executor.
    pub fn new(config: Config) -> Result<Self, ServerError> {
        let oracle = ManualHeightOracle::new(config.chain_height);
        for anchor in &config.anchors {
            oracle.add_block(anchor.hash, anchor.height);
        }
        if config.anchors.is_empty() && config.oracle_policy == OraclePolicy::FailClosed {
            warn!("No block anchors configured; every record will be refused as stale");
        }
        Self::with_collaborators(config, Arc::new(oracle), Arc::new(EchoExecutor))
    }

    /// Create a server with an external height oracle and compute executor
    pub fn with_collaborators(
        config: Config,
        oracle: Arc<dyn HeightOracle>,
        executor: Arc<dyn ComputeExecutor>,
    ) -> Result<Self, ServerError> {
        // Open storage
        let storage = Arc::new(Storage::open(&config.data_dir)?);

        // Load or generate identity
        let keypair = match storage.load_node_state()? {
            Some(state) => KeyPair::from_seed(&state.identity_seed),
            None => {
                let keypair = KeyPair::generate();
                storage.save_node_state(&NodeState {
                    identity_seed: keypair.seed(),
                })?;
                info!(neuron = %keypair.neuron_key(), "Generated new identity");
                keypair
            }
        };

        let registry = Arc::new(SynapseRegistry::open(
            storage.clone(),
            oracle.clone(),
            RegistryConfig {
                capacity: config.capacity,
                eviction_sample: config.eviction_sample,
                difficulty: config.difficulty(),
                oracle_policy: config.oracle_policy,
            },
        )?);

        let peers = Arc::new(PeerDirectory::new(
            config.advertise.clone(),
            config.max_peers,
            config.max_peer_failures,
        ));
        let restored = peers.merge_all(&storage.all_peers()?);
        let seeded = peers.merge_all(&config.bootstrap);
        debug!(restored, seeded, "Peer directory loaded");

        let exchanger = Arc::new(GossipExchanger::new(
            registry.clone(),
            peers,
            GossipConfig {
                fanout: config.fanout,
                max_batch_records: config.max_batch_records,
                max_batch_peers: config.max_batch_peers,
                bootstrap: config.bootstrap.clone(),
            },
        ));

        let transport = Arc::new(TensorTransport::new(keypair.clone(), registry.clone(), executor));

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            keypair,
            storage,
            oracle,
            registry,
            exchanger,
            transport,
            client: TcpTransport::default(),
            shutdown_tx,
        })
    }

    /// Get the server's identity
    pub fn neuron_key(&self) -> NeuronKey {
        self.keypair.neuron_key()
    }

    pub fn registry(&self) -> &Arc<SynapseRegistry> {
        &self.registry
    }

    pub fn exchanger(&self) -> &Arc<GossipExchanger> {
        &self.exchanger
    }

    pub fn transport(&self) -> &Arc<TensorTransport> {
        &self.transport
    }

    /// Bind the configured listen address
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        TcpListener::bind(self.config.listen)
            .await
            .map_err(|e| ServerError::BindFailed(self.config.listen, e))
    }

    /// Run the server
    pub async fn run(self: Arc<Self>) -> Result<(), ServerError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serve connections on an already bound listener until shutdown
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), ServerError> {
        info!(
            listen = %listener.local_addr()?,
            neuron = %self.neuron_key(),
            synapses = self.registry.len(),
            "Starting metagraphd"
        );

        // Spawn background tasks
        let gossip_handle = self.spawn_gossip_task();
        let prune_handle = self.spawn_prune_task();

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            debug!("Accepted connection from {}", addr);
                            let server = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream).await {
                                    warn!("Connection error from {}: {}", addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutting down...");
                    break;
                }
            }
        }

        // Stop background tasks; a gossip round may be mid-flight
        gossip_handle.abort();
        prune_handle.abort();
        let _ = gossip_handle.await;
        let _ = prune_handle.await;

        self.persist()
    }

    /// Persist the peer directory and flush storage
    pub fn persist(&self) -> Result<(), ServerError> {
        self.storage.put_peers(&self.exchanger.peers().addresses())?;
        self.storage.flush()?;
        Ok(())
    }

    /// Answer frames on one connection until the peer hangs up
    async fn handle_connection(self: Arc<Self>, stream: TcpStream) -> Result<(), ServerError> {
        let mut framed = Framed::new(stream, FrameCodec::new());
        while let Some(frame) = framed.next().await {
            let reply = self.dispatch(frame?).await;
            framed.send(reply).await?;
        }
        Ok(())
    }

    /// Route one request frame to its handler
    pub async fn dispatch(&self, frame: Frame) -> Frame {
        match frame.frame_type {
            FrameType::Ping => Frame::pong(),
            FrameType::GossipRequest => {
                let batch: GossipBatch = match postcard::from_bytes(&frame.payload) {
                    Ok(batch) => batch,
                    Err(e) => return Frame::failure(&Error::Serialization(e)),
                };
                match self.exchanger.respond(batch).await {
                    Ok(reply) => encode_reply(FrameType::GossipResponse, &reply),
                    Err(e) => registry_failure(&e),
                }
            }
            FrameType::ForwardRequest => self.tensor_call(CallKind::Forward, &frame).await,
            FrameType::BackwardRequest => self.tensor_call(CallKind::Backward, &frame).await,
            FrameType::HandshakeRequest => {
                let message: TensorMessage = match postcard::from_bytes(&frame.payload) {
                    Ok(message) => message,
                    Err(e) => return Frame::failure(&Error::Serialization(e)),
                };
                match self.transport.accept_handshake(&message) {
                    Ok(ack) => encode_reply(FrameType::HandshakeResponse, &ack),
                    Err(e) => {
                        debug!(code = e.code(), error = %e, "Handshake refused");
                        Frame::failure(&e)
                    }
                }
            }
            other => Frame::failure(&Error::MalformedRecord(format!(
                "unexpected request frame {:?}",
                other
            ))),
        }
    }

    async fn tensor_call(&self, kind: CallKind, frame: &Frame) -> Frame {
        let message: TensorMessage = match postcard::from_bytes(&frame.payload) {
            Ok(message) => message,
            Err(e) => return Frame::failure(&Error::Serialization(e)),
        };
        let response_type = match kind {
            CallKind::Forward => FrameType::ForwardResponse,
            CallKind::Backward => FrameType::BackwardResponse,
        };

        match self.transport.call(kind, message).await {
            Ok(reply) => encode_reply(response_type, &reply),
            Err(CallError::Protocol(e)) => {
                debug!(%kind, code = e.code(), error = %e, "Call failed");
                Frame::failure(&e)
            }
            Err(e) => {
                warn!(%kind, error = %e, "Call failed");
                internal_failure(e.to_string())
            }
        }
    }

    /// Spawn background gossip task
    fn spawn_gossip_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let server = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = interval(server.config.gossip_interval());

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = server.exchanger.run_round(&server.client).await {
                            warn!("Gossip round failed: {}", e);
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        })
    }

    /// Spawn background prune task
    fn spawn_prune_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let server = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = interval(PRUNE_INTERVAL); // Hourly

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        debug!("Running prune cycle");
                        server.prune().await;
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        })
    }

    /// Drop expired synapses and idle connections
    pub async fn prune(&self) {
        match self.oracle.current_height() {
            Ok(height) => {
                let registry = self.registry.clone();
                match tokio::task::spawn_blocking(move || registry.prune_expired(height)).await {
                    Ok(Err(e)) => warn!("Registry prune failed: {}", e),
                    Err(e) => warn!("Registry prune task failed: {}", e),
                    Ok(Ok(_)) => {}
                }
            }
            Err(e) => debug!("Skipping registry prune: {}", e),
        }
        self.transport.prune_idle(self.config.connection_idle());
    }

    /// Shutdown the server
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get server statistics
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            registry: self.registry.stats(),
            gossip: self.exchanger.stats(),
            transport: self.transport.stats(),
        }
    }
}

fn encode_reply<T: Serialize>(frame_type: FrameType, body: &T) -> Frame {
    Frame::encode(frame_type, body).unwrap_or_else(|e| internal_failure(e.to_string()))
}

fn internal_failure(message: String) -> Frame {
    let failure = RpcFailure {
        code: INTERNAL_ERROR_CODE,
        message,
    };
    Frame::encode(FrameType::Error, &failure).unwrap_or_else(|_| Frame::new(FrameType::Error, Vec::new()))
}

fn registry_failure(e: &RegistryError) -> Frame {
    match e.protocol() {
        Some(protocol) => Frame::failure(protocol),
        None => internal_failure(e.to_string()),
    }
}

/// Server statistics
#[derive(Debug, Clone)]
pub struct ServerStats {
    pub registry: RegistryStats,
    pub gossip: GossipStats,
    pub transport: TransportStats,
}

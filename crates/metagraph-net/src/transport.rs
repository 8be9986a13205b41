//! Framed TCP client for the Metagraph RPC surface
//!
//! One request/response exchange per connection. Call-level timeouts are
//! owned here; the server side never tracks them.

use crate::framing::{Frame, FrameCodec, FrameError, FrameType, RpcFailure};
use futures::{SinkExt, StreamExt};
use metagraph_core::types::*;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::debug;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Timed out talking to {0}")]
    Timeout(String),
    #[error("Connection closed by {0}")]
    ConnectionClosed(String),
    #[error("Remote error {}: {}", .0.code, .0.message)]
    Remote(RpcFailure),
    #[error("Unexpected frame {0:?}")]
    UnexpectedFrame(FrameType),
}

/// Anything that can run one Gossip exchange with a peer address
pub trait GossipClient: Send + Sync {
    /// Push `batch` to `addr` and return the peer's reply batch
    fn exchange(
        &self,
        addr: &str,
        batch: GossipBatch,
    ) -> impl Future<Output = Result<GossipBatch, TransportError>> + Send;
}

/// Request/response client over framed TCP
#[derive(Debug, Clone)]
pub struct TcpTransport {
    connect_timeout: Duration,
    call_timeout: Duration,
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(30))
    }
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration, call_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            call_timeout,
        }
    }

    /// Send one frame and wait for the reply frame
    pub async fn request(&self, addr: &str, frame: Frame) -> Result<Frame, TransportError> {
        let stream = timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout(addr.to_string()))??;
        let mut framed = Framed::new(stream, FrameCodec::new());

        let reply = timeout(self.call_timeout, roundtrip(&mut framed, frame, addr))
            .await
            .map_err(|_| TransportError::Timeout(addr.to_string()))??;

        if reply.frame_type == FrameType::Error {
            let failure: RpcFailure = reply.decode()?;
            debug!(peer = %addr, code = failure.code, "Remote call failed");
            return Err(TransportError::Remote(failure));
        }
        Ok(reply)
    }

    /// Issue a Forward or Backward call
    pub async fn call(
        &self,
        addr: &str,
        kind: CallKind,
        message: &TensorMessage,
    ) -> Result<TensorMessage, TransportError> {
        let (request_type, response_type) = match kind {
            CallKind::Forward => (FrameType::ForwardRequest, FrameType::ForwardResponse),
            CallKind::Backward => (FrameType::BackwardRequest, FrameType::BackwardResponse),
        };
        let reply = self.request(addr, Frame::encode(request_type, message)?).await?;
        if reply.frame_type != response_type {
            return Err(TransportError::UnexpectedFrame(reply.frame_type));
        }
        Ok(reply.decode()?)
    }

    /// Ask a peer to reopen our rejected connection to one of its synapses.
    ///
    /// `message` carries no tensors; its nounce must be fresh for the pair.
    pub async fn handshake(&self, addr: &str, message: &TensorMessage) -> Result<TensorMessage, TransportError> {
        let reply = self
            .request(addr, Frame::encode(FrameType::HandshakeRequest, message)?)
            .await?;
        if reply.frame_type != FrameType::HandshakeResponse {
            return Err(TransportError::UnexpectedFrame(reply.frame_type));
        }
        Ok(reply.decode()?)
    }

    /// Liveness check
    pub async fn ping(&self, addr: &str) -> Result<(), TransportError> {
        let reply = self.request(addr, Frame::ping()).await?;
        match reply.frame_type {
            FrameType::Pong => Ok(()),
            other => Err(TransportError::UnexpectedFrame(other)),
        }
    }
}

async fn roundtrip(
    framed: &mut Framed<TcpStream, FrameCodec>,
    frame: Frame,
    addr: &str,
) -> Result<Frame, TransportError> {
    framed.send(frame).await?;
    match framed.next().await {
        Some(reply) => Ok(reply?),
        None => Err(TransportError::ConnectionClosed(addr.to_string())),
    }
}

impl GossipClient for TcpTransport {
    async fn exchange(&self, addr: &str, batch: GossipBatch) -> Result<GossipBatch, TransportError> {
        let reply = self
            .request(addr, Frame::encode(FrameType::GossipRequest, &batch)?)
            .await?;
        if reply.frame_type != FrameType::GossipResponse {
            return Err(TransportError::UnexpectedFrame(reply.frame_type));
        }
        Ok(reply.decode()?)
    }
}

// SPDX-License-Identifier: MIT OR Apache-2.0
//! TCP transport with length-prefixed bincode frames.
//!
//! One frame per connection, fire-and-forget: a failed send is simply
//! dropped, matching the best-effort delivery the protocol assumes. The
//! retry engine, not the socket, provides reliability. Peers are addressed
//! by opaque node name through a routing table, so source references stay
//! `<name>:<filename>` regardless of where a node actually listens.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{CommitError, Result};
use crate::message::{Message, NodeId};
use crate::transport::Transport;

/// Largest frame accepted off the wire.
const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

/// Configuration for a `TcpTransport`.
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    /// This node's name.
    pub node_id: NodeId,
    /// Listen address.
    pub bind_addr: SocketAddr,
    /// Peer name -> socket address.
    pub peers: HashMap<NodeId, SocketAddr>,
    /// Connect timeout for outbound sends.
    pub connect_timeout: Duration,
}

impl TcpTransportConfig {
    pub fn new(node_id: impl Into<NodeId>, bind_addr: SocketAddr) -> Self {
        Self {
            node_id: node_id.into(),
            bind_addr,
            peers: HashMap::new(),
            connect_timeout: Duration::from_secs(1),
        }
    }

    /// Add a peer to the routing table.
    pub fn with_peer(mut self, id: impl Into<NodeId>, addr: SocketAddr) -> Self {
        self.peers.insert(id.into(), addr);
        self
    }
}

/// Parse a `name=host:port,name=host:port` peer table, the format the
/// daemons accept via `COLLAGE_PEERS`.
pub fn parse_peer_table(spec: &str) -> Result<HashMap<NodeId, SocketAddr>> {
    let mut peers = HashMap::new();
    for entry in spec.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let Some((name, addr)) = entry.split_once('=') else {
            return Err(CommitError::Config(format!("invalid peer entry: {entry}")));
        };
        let parsed: SocketAddr = addr.parse().map_err(|e| {
            CommitError::Config(format!("invalid peer address {addr}: {e}"))
        })?;
        peers.insert(name.trim().to_string(), parsed);
    }
    Ok(peers)
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    from: NodeId,
    msg: Message,
}

/// Blocking TCP transport.
pub struct TcpTransport {
    local_id: NodeId,
    local_addr: SocketAddr,
    peers: RwLock<HashMap<NodeId, SocketAddr>>,
    incoming: Receiver<(NodeId, Message)>,
    connect_timeout: Duration,
    shutdown: Arc<AtomicBool>,
    accept_handle: Option<JoinHandle<()>>,
}

impl TcpTransport {
    /// Bind the listener and start the accept thread.
    pub fn bind(config: TcpTransportConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_addr)
            .map_err(|e| CommitError::Network(format!("bind {}: {}", config.bind_addr, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| CommitError::Network(e.to_string()))?;

        let (sender, incoming) = unbounded();
        let shutdown = Arc::new(AtomicBool::new(false));
        let accept_shutdown = Arc::clone(&shutdown);
        let accept_handle = thread::spawn(move || accept_loop(listener, sender, accept_shutdown));

        tracing::info!(node_id = %config.node_id, addr = %local_addr, "transport listening");
        Ok(Self {
            local_id: config.node_id,
            local_addr,
            peers: RwLock::new(config.peers),
            incoming,
            connect_timeout: config.connect_timeout,
            shutdown,
            accept_handle: Some(accept_handle),
        })
    }

    /// The bound listen address (useful with an ephemeral port).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Add or replace a peer route.
    pub fn add_peer(&self, id: impl Into<NodeId>, addr: SocketAddr) {
        self.peers.write().insert(id.into(), addr);
    }

    /// Receive with a timeout; test helper.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<(NodeId, Message)> {
        self.incoming
            .recv_timeout(timeout)
            .map_err(|_| CommitError::ChannelClosed)
    }
}

fn accept_loop(
    listener: TcpListener,
    sender: Sender<(NodeId, Message)>,
    shutdown: Arc<AtomicBool>,
) {
    for stream in listener.incoming() {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match stream {
            Ok(stream) => match read_envelope(stream) {
                Ok(envelope) => {
                    if sender.send((envelope.from, envelope.msg)).is_err() {
                        break;
                    }
                },
                Err(e) => tracing::debug!(error = %e, "dropping malformed frame"),
            },
            Err(e) => tracing::debug!(error = %e, "accept failed"),
        }
    }
}

fn read_envelope(mut stream: TcpStream) -> Result<Envelope> {
    let mut len_buf = [0u8; 4];
    stream
        .read_exact(&mut len_buf)
        .map_err(|e| CommitError::Network(e.to_string()))?;
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(CommitError::Network(format!("frame too large: {len} bytes")));
    }

    let mut data = vec![0u8; len as usize];
    stream
        .read_exact(&mut data)
        .map_err(|e| CommitError::Network(e.to_string()))?;
    Ok(bincode::deserialize(&data)?)
}

impl Transport for TcpTransport {
    fn send(&self, to: &NodeId, msg: Message) -> Result<()> {
        let Some(addr) = self.peers.read().get(to).copied() else {
            return Err(CommitError::Network(format!("peer not found: {}", to)));
        };

        let envelope = Envelope {
            from: self.local_id.clone(),
            msg,
        };
        let bytes = bincode::serialize(&envelope)?;

        let mut stream = TcpStream::connect_timeout(&addr, self.connect_timeout)
            .map_err(|e| CommitError::Network(format!("connect {}: {}", addr, e)))?;
        stream
            .write_all(&(bytes.len() as u32).to_le_bytes())
            .map_err(|e| CommitError::Network(e.to_string()))?;
        stream
            .write_all(&bytes)
            .map_err(|e| CommitError::Network(e.to_string()))?;
        Ok(())
    }

    fn recv(&self) -> Result<(NodeId, Message)> {
        self.incoming.recv().map_err(|_| CommitError::ChannelClosed)
    }

    fn local_id(&self) -> &NodeId {
        &self.local_id
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // Poke the listener so the accept thread observes the flag.
        let poke = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), self.local_addr.port());
        let _ = TcpStream::connect_timeout(&poke, Duration::from_millis(100));
        if let Some(handle) = self.accept_handle.take() {
            let _ = handle.join();
        }
    }
}

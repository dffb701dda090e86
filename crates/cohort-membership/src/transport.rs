//! Message transports between cluster nodes.
//!
//! A transport hands outgoing messages to the network and feeds incoming
//! ones into an [`Inbound`] channel that the daemon drains. Delivery is
//! best effort: the protocol tolerates loss, duplication and reordering.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::{MembershipError, Result};
use crate::message::ClusterMessage;

/// Capacity of the inbound queue of a node.
const INBOUND_BUFFER: usize = 1024;

/// Largest payload that fits in a single UDP datagram.
const MAX_DATAGRAM: usize = 65_507;

/// Messages received by a node, tagged with the sending socket address.
pub type Inbound = mpsc::Receiver<(SocketAddr, ClusterMessage)>;

/// Outgoing side of a transport.
pub trait Transport: Send + Sync + 'static {
    /// Address other nodes use to reach this one.
    fn local_address(&self) -> SocketAddr;

    /// Queues a message for delivery. Never blocks; returns an error only
    /// when the transport itself is closed.
    fn send(&self, to: SocketAddr, msg: ClusterMessage) -> Result<()>;
}

/// UDP transport using the binary message codec.
pub struct UdpTransport {
    local: SocketAddr,
    outbound: mpsc::UnboundedSender<(SocketAddr, Bytes)>,
    tasks: Vec<JoinHandle<()>>,
}

impl UdpTransport {
    /// Binds a UDP socket and starts the send and receive loops.
    pub async fn bind(addr: SocketAddr) -> Result<(Self, Inbound)> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| MembershipError::Transport(format!("failed to bind {addr}: {e}")))?;
        let socket = Arc::new(socket);
        let local = socket
            .local_addr()
            .map_err(|e| MembershipError::Transport(format!("no local address: {e}")))?;
        info!("cluster transport listening on {local}");

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<(SocketAddr, Bytes)>();

        let recv_sock = Arc::clone(&socket);
        let recv_task = tokio::spawn(async move {
            let mut recv_buf = vec![0u8; 65535];
            loop {
                match recv_sock.recv_from(&mut recv_buf).await {
                    Ok((len, from)) => match ClusterMessage::decode(&recv_buf[..len]) {
                        Ok(msg) => {
                            if inbound_tx.send((from, msg)).await.is_err() {
                                debug!("inbound queue closed, stopping receive loop");
                                break;
                            }
                        }
                        Err(e) => {
                            debug!("cluster message decode error from {from}: {e}");
                        }
                    },
                    Err(e) => {
                        warn!("cluster transport recv error: {e}");
                    }
                }
            }
        });

        let send_sock = Arc::clone(&socket);
        let send_task = tokio::spawn(async move {
            while let Some((to, payload)) = outbound_rx.recv().await {
                if let Err(e) = send_sock.send_to(&payload, to).await {
                    debug!("cluster send error to {to}: {e}");
                }
            }
        });

        Ok((
            Self {
                local,
                outbound: outbound_tx,
                tasks: vec![recv_task, send_task],
            },
            inbound_rx,
        ))
    }
}

impl Transport for UdpTransport {
    fn local_address(&self) -> SocketAddr {
        self.local
    }

    fn send(&self, to: SocketAddr, msg: ClusterMessage) -> Result<()> {
        let payload = match msg.encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(to = %to, "dropping unencodable {} message: {e}", msg.name());
                return Ok(());
            }
        };
        if payload.len() > MAX_DATAGRAM {
            warn!(
                to = %to,
                size = payload.len(),
                "dropping {} message larger than a datagram",
                msg.name()
            );
            return Ok(());
        }
        self.outbound
            .send((to, payload))
            .map_err(|_| MembershipError::Transport("udp transport closed".into()))
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[derive(Default)]
struct NetworkState {
    endpoints: HashMap<SocketAddr, mpsc::Sender<(SocketAddr, ClusterMessage)>>,
    /// Directed links that currently drop everything.
    blocked: HashSet<(SocketAddr, SocketAddr)>,
}

/// In-process network connecting any number of nodes, with controllable
/// partitions. Used to run multi-node clusters inside one test.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Attaches a node at `addr`. Binding an address again replaces the
    /// previous endpoint, as a restarted process would.
    pub fn bind(&self, addr: SocketAddr) -> (LocalTransport, Inbound) {
        let (tx, rx) = mpsc::channel(INBOUND_BUFFER);
        self.lock().endpoints.insert(addr, tx);
        (
            LocalTransport {
                local: addr,
                network: self.clone(),
            },
            rx,
        )
    }

    /// Cuts both directions between `a` and `b`.
    pub fn partition(&self, a: SocketAddr, b: SocketAddr) {
        let mut state = self.lock();
        state.blocked.insert((a, b));
        state.blocked.insert((b, a));
    }

    /// Cuts `node` off from every other endpoint.
    pub fn isolate(&self, node: SocketAddr) {
        let mut state = self.lock();
        let others: Vec<SocketAddr> = state.endpoints.keys().copied().filter(|a| *a != node).collect();
        for other in others {
            state.blocked.insert((node, other));
            state.blocked.insert((other, node));
        }
    }

    /// Restores both directions between `a` and `b`.
    pub fn heal(&self, a: SocketAddr, b: SocketAddr) {
        let mut state = self.lock();
        state.blocked.remove(&(a, b));
        state.blocked.remove(&(b, a));
    }

    pub fn heal_all(&self) {
        self.lock().blocked.clear();
    }

    /// Detaches the endpoint at `addr`; messages to it are dropped.
    pub fn unbind(&self, addr: SocketAddr) {
        self.lock().endpoints.remove(&addr);
    }

    fn deliver(&self, from: SocketAddr, to: SocketAddr, msg: ClusterMessage) {
        let state = self.lock();
        if state.blocked.contains(&(from, to)) {
            trace!(%from, %to, "dropping {} across partition", msg.name());
            return;
        }
        let Some(endpoint) = state.endpoints.get(&to) else {
            trace!(%to, "no endpoint, dropping {}", msg.name());
            return;
        };
        if let Err(e) = endpoint.try_send((from, msg)) {
            trace!(%to, "local delivery failed: {e}");
        }
    }
}

/// A node's handle onto a [`LocalNetwork`].
#[derive(Clone)]
pub struct LocalTransport {
    local: SocketAddr,
    network: LocalNetwork,
}

impl Transport for LocalTransport {
    fn local_address(&self) -> SocketAddr {
        self.local
    }

    fn send(&self, to: SocketAddr, msg: ClusterMessage) -> Result<()> {
        self.network.deliver(self.local, to, msg);
        Ok(())
    }
}

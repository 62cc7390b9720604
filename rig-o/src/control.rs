/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Controller end of the provisioning protocol.
//!
//! Every node opens one `Control.Session` stream tagged with its node id.
//! [`ControlChannel`] folds all of them into a single inbound queue of
//! [`Envelope`]s and routes replies back by node id, so the controller can
//! treat the fleet as one mailbox.
//!
//! ```text
//!  node01 ─┐  Session   ┌─ reader ─┐
//!  node02 ─┼───────────►├─ reader ─┼──► inbound (node_id, NodeMessage) ──► controller
//!  node03 ─┘            └─ reader ─┘
//!                       ◄── peers[node_id].send(ControllerMessage) ◄── controller
//! ```
//!
//! The peer table is the only structure shared with the server tasks.  It
//! holds the only sender of each session's reply stream, so removing a peer
//! ends that session from the controller side.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rig_proto::rig_v1::control_server::{Control, ControlServer};
use rig_proto::{ControllerMessage, NodeMessage, NODE_ID_HEADER};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};

const SESSION_BUFFER: usize = 16;
const SERVER_STOP_TIMEOUT: Duration = Duration::from_secs(1);

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("failed to bind control endpoint on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("node '{node}' has no open control session")]
    NotConnected { node: String },

    #[error("control session of node '{node}' closed while sending")]
    Closed { node: String },
}

// ── Envelope ──────────────────────────────────────────────────────────────────

/// One message received from a node.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub node_id: String,
    pub message: NodeMessage,
}

// ── Peer table ────────────────────────────────────────────────────────────────

type Reply = Result<ControllerMessage, Status>;

struct Peer {
    session: u64,
    tx: mpsc::Sender<Reply>,
}

#[derive(Clone, Default)]
struct Peers(Arc<Mutex<HashMap<String, Peer>>>);

impl Peers {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Peer>> {
        // A panic while holding the lock leaves a consistent map behind.
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn sender(&self, node_id: &str) -> Option<mpsc::Sender<Reply>> {
        self.lock().get(node_id).map(|p| p.tx.clone())
    }
}

// ── gRPC service ──────────────────────────────────────────────────────────────

struct ControlService {
    peers: Peers,
    inbound: mpsc::UnboundedSender<Envelope>,
    next_session: AtomicU64,
}

#[tonic::async_trait]
impl Control for ControlService {
    type SessionStream = ReceiverStream<Reply>;

    async fn session(
        &self,
        request: Request<Streaming<NodeMessage>>,
    ) -> Result<Response<Self::SessionStream>, Status> {
        let node_id = request
            .metadata()
            .get(NODE_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .ok_or_else(|| Status::invalid_argument(format!("missing {NODE_ID_HEADER} metadata")))?;

        let mut stream = request.into_inner();
        let (tx, rx) = mpsc::channel(SESSION_BUFFER);
        let session = self.next_session.fetch_add(1, Ordering::Relaxed);

        if self
            .peers
            .lock()
            .insert(node_id.clone(), Peer { session, tx })
            .is_some()
        {
            warn!(node = %node_id, "Node reconnected, replacing its previous session");
        }
        debug!(node = %node_id, session, "Control session opened");

        let peers = self.peers.clone();
        let inbound = self.inbound.clone();
        tokio::spawn(async move {
            loop {
                match stream.message().await {
                    Ok(Some(message)) => {
                        let envelope = Envelope {
                            node_id: node_id.clone(),
                            message,
                        };
                        if inbound.send(envelope).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(status) => {
                        debug!(node = %node_id, "Control session error: {status}");
                        break;
                    }
                }
            }

            let mut peers = peers.lock();
            if peers.get(&node_id).is_some_and(|p| p.session == session) {
                peers.remove(&node_id);
            }
            debug!(node = %node_id, session, "Control session closed");
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

// ── ControlChannel ────────────────────────────────────────────────────────────

pub struct ControlChannel {
    local_addr: SocketAddr,
    inbound: mpsc::UnboundedReceiver<Envelope>,
    peers: Peers,
    shutdown: Option<oneshot::Sender<()>>,
    server: Option<JoinHandle<()>>,
}

impl ControlChannel {
    /// Binds the control endpoint and starts accepting sessions.
    pub async fn bind(addr: SocketAddr) -> Result<Self, ControlError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ControlError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ControlError::Bind { addr, source })?;

        let peers = Peers::default();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let service = ControlService {
            peers: peers.clone(),
            inbound: inbound_tx,
            next_session: AtomicU64::new(0),
        };

        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let router = Server::builder().add_service(ControlServer::new(service));
        let incoming = TcpListenerStream::new(listener);
        let server = tokio::spawn(async move {
            let signal = async move {
                let _ = shutdown_rx.await;
            };
            if let Err(e) = router.serve_with_incoming_shutdown(incoming, signal).await {
                warn!("Control endpoint terminated: {e}");
            }
        });

        info!(addr = %local_addr, "Control endpoint bound");

        Ok(Self {
            local_addr,
            inbound,
            peers,
            shutdown: Some(shutdown),
            server: Some(server),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `host:port` handed to local nodes.  A wildcard bind is reached over
    /// loopback.
    pub fn endpoint(&self) -> String {
        let mut addr = self.local_addr;
        if addr.ip().is_unspecified() {
            addr.set_ip(IpAddr::V4(Ipv4Addr::LOCALHOST));
        }
        addr.to_string()
    }

    /// Next message from any node.  `None` once the channel is closed and
    /// every session has ended.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.inbound.recv().await
    }

    pub async fn send(&self, node_id: &str, message: ControllerMessage) -> Result<(), ControlError> {
        let tx = self.peers.sender(node_id).ok_or_else(|| ControlError::NotConnected {
            node: node_id.to_string(),
        })?;
        debug!(node = %node_id, kind = message.kind(), "→ node");
        tx.send(Ok(message)).await.map_err(|_| ControlError::Closed {
            node: node_id.to_string(),
        })
    }

    pub fn is_connected(&self, node_id: &str) -> bool {
        self.peers.lock().contains_key(node_id)
    }

    pub fn connected_nodes(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self.peers.lock().keys().cloned().collect();
        nodes.sort();
        nodes
    }

    /// Ends the session of `node_id` from the controller side.
    pub fn disconnect(&self, node_id: &str) {
        if self.peers.lock().remove(node_id).is_some() {
            debug!(node = %node_id, "Control session dropped by controller");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_none()
    }

    /// Ends every session and stops the endpoint.  Idempotent.
    pub async fn close(&mut self) {
        let Some(shutdown) = self.shutdown.take() else {
            return;
        };

        self.peers.lock().clear();
        let _ = shutdown.send(());

        if let Some(mut server) = self.server.take() {
            if tokio::time::timeout(SERVER_STOP_TIMEOUT, &mut server)
                .await
                .is_err()
            {
                debug!("Control endpoint still draining, aborting");
                server.abort();
            }
        }
        self.inbound.close();
        info!(addr = %self.local_addr, "Control endpoint closed");
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        if let Some(server) = self.server.take() {
            server.abort();
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Node side of the provisioning protocol.
//!
//! ```text
//!  Connecting ──► AwaitingConfig ──► Building ──► Serving ──► ShuttingDown ──► Closed
//!       │               │                                         ▲
//!       └───────────────┴──────── session lost / cancelled ───────┘
//! ```
//!
//! 1. Open a `Control.Session` stream tagged with the node id and send
//!    `ProvisionRequest`.
//! 2. On `ProvisionResponse`: build the device graph, start one
//!    [`DeviceServer`] per built device, reply `ProvisionComplete` with the
//!    addresses and the build errors.
//! 3. On `Shutdown`: close every server, reply `ShutdownComplete`, close the
//!    session.
//!
//! Losing the session or being cancelled (SIGINT / SIGTERM in the binary) also
//! closes every server before `run()` returns.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use rig_proto::rig_v1::control_client::ControlClient;
use rig_proto::{
    BuildErrorKind, ControllerMessage, DeviceBuildError, NodeConfig, NodeMessage,
    ProvisionedDeviceAddress, NODE_ID_HEADER,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::metadata::MetadataValue;
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Status, Streaming};
use tracing::{debug, error, info, warn};

use crate::graph::DeviceGraphBuilder;
use crate::registry::DeviceRegistry;
use crate::server::{DeviceServer, ServerOptions};

/// How long to wait for the controller to close its side after
/// `ShutdownComplete`.
const SESSION_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

// ── State / options / errors ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Connecting,
    AwaitingConfig,
    Building,
    Serving,
    ShuttingDown,
    Closed,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeState::Connecting => "connecting",
            NodeState::AwaitingConfig => "awaiting_config",
            NodeState::Building => "building",
            NodeState::Serving => "serving",
            NodeState::ShuttingDown => "shutting_down",
            NodeState::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct NodeAgentOptions {
    pub node_id: String,
    /// `host:port` or a full `http://host:port` URI.
    pub controller_addr: String,
    /// First device port; device *i* gets `start + 2i` (rpc) and
    /// `start + 2i + 1` (pub).  `0` means OS-assigned ports.
    pub start_port: u16,
    pub heartbeat_interval: Duration,
    pub connect_attempts: u32,
    pub connect_backoff: Duration,
}

impl NodeAgentOptions {
    pub fn new(
        node_id: impl Into<String>,
        controller_addr: impl Into<String>,
        start_port: u16,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            controller_addr: controller_addr.into(),
            start_port,
            heartbeat_interval: Duration::from_secs(1),
            connect_attempts: 10,
            connect_backoff: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("invalid controller address '{addr}': {source}")]
    InvalidAddress {
        addr: String,
        #[source]
        source: tonic::transport::Error,
    },

    #[error("could not reach controller at '{addr}' after {attempts} attempt(s): {source}")]
    Connect {
        addr: String,
        attempts: u32,
        #[source]
        source: tonic::transport::Error,
    },

    #[error("node id '{0}' cannot be sent as session metadata")]
    InvalidNodeId(String),

    #[error("control session failed: {0}")]
    Session(#[from] Status),
}

// ── NodeAgent ─────────────────────────────────────────────────────────────────

pub struct NodeAgent {
    options: NodeAgentOptions,
    registry: DeviceRegistry,
    state: NodeState,
    servers: BTreeMap<String, DeviceServer>,
}

impl NodeAgent {
    pub fn new(options: NodeAgentOptions, registry: DeviceRegistry) -> Self {
        Self {
            options,
            registry,
            state: NodeState::Connecting,
            servers: BTreeMap::new(),
        }
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn node_id(&self) -> &str {
        &self.options.node_id
    }

    /// Runs the whole node lifecycle until shutdown, session loss or `cancel`.
    ///
    /// Device servers are always closed before this returns.
    pub async fn run<F>(mut self, cancel: F) -> Result<(), AgentError>
    where
        F: Future<Output = ()>,
    {
        let node_id = self.options.node_id.clone();
        info!(node = %node_id, controller = %self.options.controller_addr, "Node agent starting");

        let mut client = self.connect().await?;

        let (tx, rx) = mpsc::channel::<NodeMessage>(16);
        let mut request = Request::new(ReceiverStream::new(rx));
        let header = MetadataValue::try_from(node_id.as_str())
            .map_err(|_| AgentError::InvalidNodeId(node_id.clone()))?;
        request.metadata_mut().insert(NODE_ID_HEADER, header);

        // Buffered until the stream is open.
        let _ = tx.send(NodeMessage::ProvisionRequest).await;
        let mut inbound = client.session(request).await?.into_inner();
        self.set_state(NodeState::AwaitingConfig);

        tokio::pin!(cancel);
        let result = loop {
            tokio::select! {
                _ = &mut cancel => {
                    info!(node = %node_id, "Cancelled, shutting down");
                    break Ok(());
                }
                msg = inbound.message() => match msg {
                    Ok(Some(ControllerMessage::ProvisionResponse { config })) => {
                        self.provision(config, &tx).await;
                    }
                    Ok(Some(ControllerMessage::Shutdown)) => {
                        self.shutdown(tx, &mut inbound).await;
                        break Ok(());
                    }
                    Ok(None) => {
                        warn!(node = %node_id, "Controller closed the session");
                        break Ok(());
                    }
                    Err(status) => {
                        error!(node = %node_id, "Control session error: {status}");
                        break Err(AgentError::Session(status));
                    }
                },
            }
        };

        self.close_servers().await;
        self.set_state(NodeState::Closed);
        info!(node = %node_id, "Node agent stopped");
        result
    }

    // ── Connection ────────────────────────────────────────────────────────────

    async fn connect(&mut self) -> Result<ControlClient<Channel>, AgentError> {
        self.set_state(NodeState::Connecting);

        let addr = controller_uri(&self.options.controller_addr);
        let endpoint = Endpoint::from_shared(addr.clone()).map_err(|source| {
            AgentError::InvalidAddress {
                addr: addr.clone(),
                source,
            }
        })?;

        let attempts = self.options.connect_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match endpoint.connect().await {
                Ok(channel) => {
                    debug!(controller = %addr, attempt, "Connected to controller");
                    return Ok(ControlClient::new(channel));
                }
                Err(e) if attempt < attempts => {
                    debug!(controller = %addr, attempt, "Connect failed, retrying: {e}");
                    tokio::time::sleep(self.options.connect_backoff).await;
                }
                Err(source) => {
                    return Err(AgentError::Connect {
                        addr,
                        attempts,
                        source,
                    })
                }
            }
        }
    }

    // ── Provisioning ──────────────────────────────────────────────────────────

    async fn provision(&mut self, mut config: NodeConfig, tx: &mpsc::Sender<NodeMessage>) {
        if self.state != NodeState::AwaitingConfig {
            warn!(node = %self.options.node_id, state = %self.state, "Already provisioned, ignoring repeated config");
            return;
        }
        if config.node_id.is_empty() {
            config.node_id = self.options.node_id.clone();
        }

        self.set_state(NodeState::Building);
        let outcome = DeviceGraphBuilder::new(&self.registry).build(&config);
        let mut errors = outcome.errors;
        let mut devices: BTreeMap<String, ProvisionedDeviceAddress> = BTreeMap::new();

        let bind_ip = config
            .loopback_ip()
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

        for (index, (uid, built)) in outcome.built.into_iter().enumerate() {
            let device = std::sync::Arc::clone(&built.device);
            let Some((rpc_port, pub_port)) = port_pair(self.options.start_port, index) else {
                if let Err(e) = device.close() {
                    warn!(uid = %uid, "device close failed: {e}");
                }
                errors.insert(
                    uid.clone(),
                    DeviceBuildError::new(
                        uid,
                        BuildErrorKind::Instantiation,
                        "no free port pair left above the node's start port",
                    ),
                );
                continue;
            };

            let options = ServerOptions {
                advertise_host: config.hostname.clone(),
                bind_ip,
                rpc_port,
                pub_port,
                heartbeat_interval: self.options.heartbeat_interval,
            };

            match DeviceServer::start(&uid, built, &options).await {
                Ok(server) => {
                    devices.insert(uid.clone(), server.address().clone());
                    self.servers.insert(uid, server);
                }
                Err(e) => {
                    if let Err(close_err) = device.close() {
                        warn!(uid = %uid, "device close failed: {close_err}");
                    }
                    errors.insert(
                        uid.clone(),
                        DeviceBuildError::new(uid, BuildErrorKind::Instantiation, e.to_string()),
                    );
                }
            }
        }

        info!(
            node = %self.options.node_id,
            serving = devices.len(),
            failed = errors.len(),
            "Provisioning complete"
        );

        if tx
            .send(NodeMessage::ProvisionComplete { devices, errors })
            .await
            .is_err()
        {
            warn!(node = %self.options.node_id, "Session closed before ProvisionComplete was sent");
        }
        self.set_state(NodeState::Serving);
    }

    // ── Shutdown ──────────────────────────────────────────────────────────────

    async fn shutdown(
        &mut self,
        tx: mpsc::Sender<NodeMessage>,
        inbound: &mut Streaming<ControllerMessage>,
    ) {
        self.set_state(NodeState::ShuttingDown);
        self.close_servers().await;

        let _ = tx.send(NodeMessage::ShutdownComplete).await;
        // Half-close our side, then wait for the controller to finish.
        drop(tx);
        let drain = async {
            while let Ok(Some(_)) = inbound.message().await {}
        };
        if tokio::time::timeout(SESSION_DRAIN_TIMEOUT, drain).await.is_err() {
            debug!(node = %self.options.node_id, "Controller kept the session open after shutdown");
        }
    }

    async fn close_servers(&mut self) {
        for (uid, mut server) in std::mem::take(&mut self.servers) {
            debug!(uid = %uid, "Closing device server");
            server.close().await;
        }
    }

    fn set_state(&mut self, state: NodeState) {
        debug!(node = %self.options.node_id, from = %self.state, to = %state, "State change");
        self.state = state;
    }
}

impl fmt::Debug for NodeAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeAgent")
            .field("node_id", &self.options.node_id)
            .field("state", &self.state)
            .field("servers", &self.servers.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Adds an `http://` scheme when the address has none.
pub fn controller_uri(addr: &str) -> String {
    if addr.contains("://") {
        addr.to_string()
    } else {
        format!("http://{addr}")
    }
}

/// `(rpc, pub)` ports of the `index`-th device, or `None` past `u16::MAX`.
pub fn port_pair(start_port: u16, index: usize) -> Option<(u16, u16)> {
    if start_port == 0 {
        return Some((0, 0));
    }
    let rpc = u32::from(start_port) + 2 * u32::try_from(index).ok()?;
    let rpc = u16::try_from(rpc).ok()?;
    let publ = rpc.checked_add(1)?;
    Some((rpc, publ))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Rig controller – brings a fleet of nodes up, hands out device clients,
//! and tears everything down again.
//!
//! # Lifecycle
//!
//! ```text
//! Init ─► SpawningLocalNodes ─► Provisioning ─► ConnectingDevices ─► Ready ─► Stopping ─► Stopped
//!                                    │                                            ▲
//!                                    └──── timeout: rollback ─────────────────────┘
//! ```
//!
//! # Design decisions
//!
//! | Decision | Rationale |
//! |---|---|
//! | One mailbox for all nodes | barrier, rollback and stop drain [`ControlChannel::recv`] sequentially; no per-node tasks |
//! | Provisioning timeout is fatal | nodes that did provision are rolled back before the error returns |
//! | Liveness timeout is not | failures are collected into [`LivenessReport`], the rig still reaches `Ready` |
//! | Fixed spawn grace delay | nodes have no ready signal; a late node is covered by the provisioning deadline |
//! | Unconditional local cleanup | every rolled-back node with a local process is terminated, ack or not |
//!
//! The controller never owns device objects; it only holds addresses and
//! clients.

pub mod error;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rig_proto::{
    ControllerMessage, DeviceBuildError, NodeConfig, NodeMessage, ProvisionedDeviceAddress,
};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::client::TypedClient;
use crate::config::{ControllerSettings, RigConfigManager};
use crate::control::{ControlChannel, Envelope};
use crate::launcher::{terminate_process, NodeLauncher, NodeProcess};

pub use error::RigError;

// ── State / report ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RigState {
    Init,
    SpawningLocalNodes,
    Provisioning,
    ConnectingDevices,
    Ready,
    Stopping,
    Stopped,
}

impl fmt::Display for RigState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RigState::Init => "init",
            RigState::SpawningLocalNodes => "spawning_local_nodes",
            RigState::Provisioning => "provisioning",
            RigState::ConnectingDevices => "connecting_devices",
            RigState::Ready => "ready",
            RigState::Stopping => "stopping",
            RigState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Outcome of the liveness barrier.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LivenessReport {
    /// Number of provisioned devices.
    pub total: usize,
    /// Devices whose first heartbeat arrived in time.
    pub connected: Vec<String>,
    /// uid → reason, for every device that did not report in.
    pub failed: BTreeMap<String, String>,
}

impl LivenessReport {
    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    pub fn all_alive(&self) -> bool {
        self.failed.is_empty() && self.connected.len() == self.total
    }
}

impl fmt::Display for LivenessReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} devices failed", self.failed_count(), self.total)
    }
}

// ── RigController ─────────────────────────────────────────────────────────────

pub struct RigController {
    nodes: BTreeMap<String, NodeConfig>,
    settings: ControllerSettings,
    launcher: Arc<dyn NodeLauncher>,

    state: RigState,
    control: Option<ControlChannel>,

    expected_nodes: BTreeSet<String>,
    provisioned_nodes: BTreeSet<String>,
    local_processes: BTreeMap<String, Box<dyn NodeProcess>>,

    devices: BTreeMap<String, ProvisionedDeviceAddress>,
    build_errors: BTreeMap<String, DeviceBuildError>,
    agents: BTreeMap<String, Arc<TypedClient>>,
    liveness: Option<LivenessReport>,
}

impl RigController {
    pub fn new(
        nodes: BTreeMap<String, NodeConfig>,
        settings: ControllerSettings,
        launcher: Arc<dyn NodeLauncher>,
    ) -> Self {
        // The map key is authoritative for the node id.
        let nodes = nodes
            .into_iter()
            .map(|(id, mut cfg)| {
                cfg.node_id = id.clone();
                (id, cfg)
            })
            .collect();

        Self {
            nodes,
            settings,
            launcher,
            state: RigState::Init,
            control: None,
            expected_nodes: BTreeSet::new(),
            provisioned_nodes: BTreeSet::new(),
            local_processes: BTreeMap::new(),
            devices: BTreeMap::new(),
            build_errors: BTreeMap::new(),
            agents: BTreeMap::new(),
            liveness: None,
        }
    }

    pub fn from_config(config: RigConfigManager, launcher: Arc<dyn NodeLauncher>) -> Self {
        let (nodes, settings) = config.into_parts();
        Self::new(nodes, settings, launcher)
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn state(&self) -> RigState {
        self.state
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    pub fn nodes(&self) -> &BTreeMap<String, NodeConfig> {
        &self.nodes
    }

    pub fn expected_nodes(&self) -> &BTreeSet<String> {
        &self.expected_nodes
    }

    pub fn provisioned_nodes(&self) -> &BTreeSet<String> {
        &self.provisioned_nodes
    }

    /// Addresses of every device reported by a provisioned node.
    pub fn devices(&self) -> &BTreeMap<String, ProvisionedDeviceAddress> {
        &self.devices
    }

    /// Build failures reported by the nodes, keyed by device uid.
    pub fn build_errors(&self) -> &BTreeMap<String, DeviceBuildError> {
        &self.build_errors
    }

    pub fn liveness_report(&self) -> Option<&LivenessReport> {
        self.liveness.as_ref()
    }

    /// `host:port` of the control endpoint, once bound.
    pub fn control_endpoint(&self) -> Option<String> {
        self.control.as_ref().map(ControlChannel::endpoint)
    }

    pub fn get_agent(&self, uid: &str) -> Result<&TypedClient, RigError> {
        self.agents
            .get(uid)
            .map(Arc::as_ref)
            .ok_or_else(|| RigError::AgentNotFound {
                uid: uid.to_string(),
            })
    }

    pub fn agents(&self) -> impl Iterator<Item = (&str, &TypedClient)> {
        self.agents.iter().map(|(uid, c)| (uid.as_str(), c.as_ref()))
    }

    // ── Startup ───────────────────────────────────────────────────────────────

    /// Binds the control endpoint (once) and returns its `host:port`.
    pub async fn bind(&mut self) -> Result<String, RigError> {
        if let Some(control) = &self.control {
            return Ok(control.endpoint());
        }
        let control = ControlChannel::bind(self.settings.bind).await?;
        let endpoint = control.endpoint();
        self.control = Some(control);
        Ok(endpoint)
    }

    /// Spawns local nodes, provisions every node, connects to every device.
    ///
    /// # Errors
    /// [`RigError::ProvisioningTimeout`] if some node did not provision within
    /// `provision_timeout`.  Every node that did provision has been shut down
    /// and every local node process terminated by the time it is returned.
    pub async fn start(
        &mut self,
        connection_timeout: Duration,
        provision_timeout: Duration,
    ) -> Result<LivenessReport, RigError> {
        if self.state != RigState::Init {
            return Err(RigError::AlreadyStarted);
        }

        let endpoint = self.bind().await?;
        self.expected_nodes = self.nodes.keys().cloned().collect();
        info!(
            endpoint = %endpoint,
            nodes = self.expected_nodes.len(),
            "Starting rig"
        );

        self.set_state(RigState::SpawningLocalNodes);
        self.spawn_local_nodes(&endpoint).await;

        self.set_state(RigState::Provisioning);
        if let Err(missing) = self.provisioning_barrier(provision_timeout).await {
            error!(
                missing = ?missing,
                timeout = ?provision_timeout,
                "Provisioning failed, rolling back"
            );
            self.set_state(RigState::Stopping);

            // Provisioned nodes hold live devices; missing ones may be
            // mid-provisioning.  Shut down both and reap local processes.
            let rollback: Vec<String> = self.expected_nodes.iter().cloned().collect();
            self.shutdown_nodes(&rollback, self.settings.rollback_timeout)
                .await;

            self.close_control().await;
            self.set_state(RigState::Stopped);
            return Err(RigError::ProvisioningTimeout {
                missing,
                timeout: provision_timeout,
            });
        }

        self.set_state(RigState::ConnectingDevices);
        let report = self.connect_devices(connection_timeout).await;
        self.liveness = Some(report.clone());

        self.set_state(RigState::Ready);
        info!(
            devices = self.agents.len(),
            build_errors = self.build_errors.len(),
            "Rig ready"
        );
        Ok(report)
    }

    async fn spawn_local_nodes(&mut self, endpoint: &str) {
        let mut spawned = 0usize;
        for (node_id, config) in &self.nodes {
            if !config.is_local() {
                info!(node = %node_id, host = %config.hostname, "Remote node, waiting for it to connect");
                continue;
            }
            match self.launcher.launch(node_id, endpoint, config.start_port) {
                Ok(process) => {
                    self.local_processes.insert(node_id.clone(), process);
                    spawned += 1;
                }
                // The node will show up as missing at the provisioning deadline.
                Err(e) => error!(node = %node_id, "Failed to launch node: {e:#}"),
            }
        }

        if spawned > 0 {
            debug!(spawned, grace = ?self.settings.spawn_grace, "Waiting for local nodes");
            tokio::time::sleep(self.settings.spawn_grace).await;
        }
    }

    /// Runs until every expected node has provisioned.  On deadline (or loss
    /// of the control channel) returns the missing node ids.
    async fn provisioning_barrier(&mut self, timeout: Duration) -> Result<(), Vec<String>> {
        let deadline = Instant::now() + timeout;

        while self.provisioned_nodes.len() < self.expected_nodes.len() {
            let Some(control) = self.control.as_mut() else {
                break;
            };
            match tokio::time::timeout_at(deadline, control.recv()).await {
                Ok(Some(envelope)) => self.handle_provisioning(envelope).await,
                Ok(None) => {
                    warn!("Control channel closed during provisioning");
                    break;
                }
                Err(_) => break,
            }
        }

        let missing: Vec<String> = self
            .expected_nodes
            .difference(&self.provisioned_nodes)
            .cloned()
            .collect();
        if missing.is_empty() {
            info!(nodes = self.provisioned_nodes.len(), "All nodes provisioned");
            Ok(())
        } else {
            Err(missing)
        }
    }

    async fn handle_provisioning(&mut self, envelope: Envelope) {
        let Envelope { node_id, message } = envelope;

        let Some(config) = self.nodes.get(&node_id).cloned() else {
            warn!(node = %node_id, kind = message.kind(), "Message from unknown node ignored");
            return;
        };

        match message {
            NodeMessage::ProvisionRequest => {
                info!(node = %node_id, devices = config.devices.len(), "Provision request");
                if let Some(control) = &self.control {
                    let reply = ControllerMessage::ProvisionResponse { config };
                    if let Err(e) = control.send(&node_id, reply).await {
                        warn!(node = %node_id, "Failed to send configuration: {e}");
                    }
                }
            }
            NodeMessage::ProvisionComplete { devices, errors } => {
                if !self.provisioned_nodes.insert(node_id.clone()) {
                    warn!(node = %node_id, "Duplicate provision_complete ignored");
                    return;
                }
                info!(
                    node = %node_id,
                    devices = devices.len(),
                    errors = errors.len(),
                    "Node provisioned"
                );
                for (uid, err) in &errors {
                    warn!(node = %node_id, uid = %uid, kind = %err.kind, "Device build failed: {}", err.message);
                }
                for (uid, address) in devices {
                    if !config.devices.contains_key(&uid) {
                        warn!(node = %node_id, uid = %uid, "Node reported an undeclared device");
                    }
                    self.devices.insert(uid, address);
                }
                self.build_errors.extend(errors);
            }
            NodeMessage::ShutdownComplete => {
                debug!(node = %node_id, "Unexpected shutdown_complete during provisioning");
            }
        }
    }

    /// Creates one typed client per device and waits for every first
    /// heartbeat.  Never fails; the report carries the failures.
    async fn connect_devices(&mut self, timeout: Duration) -> LivenessReport {
        let mut report = LivenessReport {
            total: self.devices.len(),
            ..LivenessReport::default()
        };

        for (uid, address) in &self.devices {
            match TypedClient::for_address(address.clone()) {
                Ok(client) => {
                    self.agents.insert(uid.clone(), Arc::new(client));
                }
                Err(e) => {
                    warn!(uid = %uid, "Cannot create device client: {e}");
                    report.failed.insert(uid.clone(), e.to_string());
                }
            }
        }

        let mut waits = JoinSet::new();
        for (uid, client) in &self.agents {
            let uid = uid.clone();
            let client = Arc::clone(client);
            waits.spawn(async move {
                let result = client.wait_for_heartbeat(timeout).await;
                (uid, result)
            });
        }

        while let Some(joined) = waits.join_next().await {
            match joined {
                Ok((uid, Ok(()))) => {
                    debug!(uid = %uid, "✓ device alive");
                    report.connected.push(uid);
                }
                Ok((uid, Err(e))) => {
                    warn!(uid = %uid, "✗ device not alive: {e}");
                    report.failed.insert(uid, e.to_string());
                }
                Err(e) => warn!("Liveness task failed: {e}"),
            }
        }
        report.connected.sort();

        if report.failed.is_empty() {
            info!(total = report.total, "All devices alive");
        } else {
            warn!(
                failed = report.failed_count(),
                total = report.total,
                "Some devices did not report in: {report}"
            );
        }
        report
    }

    // ── Teardown ──────────────────────────────────────────────────────────────

    /// Sends `Shutdown` to `node_ids`, waits up to `timeout` for the
    /// acknowledgements, then terminates every local process among them.
    pub async fn shutdown_nodes(&mut self, node_ids: &[String], timeout: Duration) {
        let mut pending: BTreeSet<String> = BTreeSet::new();

        if let Some(control) = &self.control {
            for node_id in node_ids {
                match control.send(node_id, ControllerMessage::Shutdown).await {
                    Ok(()) => {
                        pending.insert(node_id.clone());
                    }
                    Err(e) => debug!(node = %node_id, "Shutdown not sent: {e}"),
                }
            }
        }

        let deadline = Instant::now() + timeout;
        while !pending.is_empty() {
            let Some(control) = self.control.as_mut() else {
                break;
            };
            match tokio::time::timeout_at(deadline, control.recv()).await {
                Ok(Some(Envelope {
                    node_id,
                    message: NodeMessage::ShutdownComplete,
                })) => {
                    if pending.remove(&node_id) {
                        debug!(node = %node_id, "Shutdown acknowledged");
                        control.disconnect(&node_id);
                    }
                }
                Ok(Some(Envelope { node_id, message })) => {
                    debug!(node = %node_id, kind = message.kind(), "Ignored during shutdown");
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(pending = ?pending, "Timed out waiting for shutdown acknowledgements");
                    break;
                }
            }
        }

        for node_id in node_ids {
            if let Some(mut process) = self.local_processes.remove(node_id) {
                terminate_process(node_id, process.as_mut(), self.settings.terminate_timeout).await;
            }
            self.provisioned_nodes.remove(node_id);
        }
    }

    /// Closes every client, shuts every configured node down and closes the
    /// control endpoint.  Never fails; safe to call at any time, any number
    /// of times.
    pub async fn stop(&mut self) {
        if self.state == RigState::Stopped {
            debug!("Rig already stopped");
            return;
        }
        self.set_state(RigState::Stopping);

        for client in self.agents.values() {
            client.close();
        }
        self.agents.clear();

        let all: Vec<String> = self.nodes.keys().cloned().collect();
        self.shutdown_nodes(&all, self.settings.stop_timeout).await;

        // Processes not tied to a configured node id cannot exist, but never
        // leave one behind.
        let strays: Vec<String> = self.local_processes.keys().cloned().collect();
        for node_id in strays {
            if let Some(mut process) = self.local_processes.remove(&node_id) {
                terminate_process(&node_id, process.as_mut(), self.settings.terminate_timeout).await;
            }
        }

        self.close_control().await;
        self.devices.clear();
        self.set_state(RigState::Stopped);
        info!("Rig stopped");
    }

    async fn close_control(&mut self) {
        if let Some(mut control) = self.control.take() {
            control.close().await;
        }
    }

    fn set_state(&mut self, state: RigState) {
        debug!(from = %self.state, to = %state, "Rig state change");
        self.state = state;
    }
}

impl fmt::Debug for RigController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RigController")
            .field("state", &self.state)
            .field("nodes", &self.nodes.keys().collect::<Vec<_>>())
            .field("provisioned", &self.provisioned_nodes)
            .field("devices", &self.devices.len())
            .finish()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

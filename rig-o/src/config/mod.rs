/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Rig configuration loading and management.
//!
//! The expected YAML structure is:
//! ```yaml
//! controller:
//!   bind: "127.0.0.1:5555"
//!   spawn_grace_ms: 1000
//!   node_binary: /usr/local/bin/rig-n
//! nodes:
//!   node01:
//!     hostname: localhost
//!     start_port: 6000
//!     devices:
//!       stage_ctrl: { target: sim.Generic }
//!       stage_x:
//!         target: sim.Axis
//!         kwargs:
//!           controller: { ref: stage_ctrl }
//!           speed_mm_s: 2.5
//! ```
//!
//! Everything under `controller` is optional.  Device uids key the
//! controller's client map, so they must be unique across all nodes.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rig_proto::{DeviceSpec, NodeConfig};
use serde::Deserialize;
use tracing::{debug, info, warn};

// ── Private YAML deserialization types ────────────────────────────────────────

/// Top-level wrapper that maps directly onto the YAML file layout.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RigConfigFile {
    #[serde(default)]
    controller: ControllerEntry,
    #[serde(default)]
    nodes: BTreeMap<String, NodeEntry>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ControllerEntry {
    bind: Option<String>,
    spawn_grace_ms: Option<u64>,
    rollback_timeout_ms: Option<u64>,
    stop_timeout_ms: Option<u64>,
    terminate_timeout_ms: Option<u64>,
    node_binary: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct NodeEntry {
    #[serde(default = "default_hostname")]
    hostname: String,
    #[serde(default)]
    start_port: u16,
    #[serde(default)]
    devices: BTreeMap<String, DeviceSpec>,
}

fn default_hostname() -> String {
    String::from("localhost")
}

// ── Public data structures ────────────────────────────────────────────────────

/// Controller-side timing and process settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerSettings {
    /// Address of the control endpoint.  Port `0` picks an ephemeral port.
    pub bind: SocketAddr,
    /// Fixed delay after spawning local nodes, before the provisioning barrier.
    pub spawn_grace: Duration,
    /// Acknowledgement wait of the rollback after a provisioning timeout.
    pub rollback_timeout: Duration,
    /// Acknowledgement wait of the rollback run by `stop()`.
    pub stop_timeout: Duration,
    /// Bound on each join while force-terminating a local node process.
    pub terminate_timeout: Duration,
    /// Node binary started for every local node.
    pub node_binary: PathBuf,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 5555)),
            spawn_grace: Duration::from_secs(1),
            rollback_timeout: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(2),
            terminate_timeout: Duration::from_secs(2),
            node_binary: PathBuf::from("rig-n"),
        }
    }
}

impl ControllerSettings {
    fn apply(&mut self, entry: ControllerEntry) -> Result<()> {
        if let Some(bind) = entry.bind {
            self.bind = bind
                .parse()
                .with_context(|| format!("Invalid controller bind address: {bind}"))?;
        }
        if let Some(ms) = entry.spawn_grace_ms {
            self.spawn_grace = Duration::from_millis(ms);
        }
        if let Some(ms) = entry.rollback_timeout_ms {
            self.rollback_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = entry.stop_timeout_ms {
            self.stop_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = entry.terminate_timeout_ms {
            self.terminate_timeout = Duration::from_millis(ms);
        }
        if let Some(path) = entry.node_binary {
            self.node_binary = path;
        }
        Ok(())
    }
}

// ── RigConfigManager ──────────────────────────────────────────────────────────

/// Loads and manages the rig configuration from a YAML file.
#[derive(Debug, Default)]
pub struct RigConfigManager {
    /// Map of node id → [`NodeConfig`].
    nodes: BTreeMap<String, NodeConfig>,

    settings: ControllerSettings,

    /// Set to `true` after a successful load.
    loaded: bool,
}

impl RigConfigManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses `path` and replaces any previously loaded configuration.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, the YAML is structurally
    /// invalid, or a device uid is declared on more than one node.
    pub fn load_from_file(&mut self, path: &Path) -> Result<()> {
        info!("Loading rig configuration from: {}", path.display());

        self.reset();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot open configuration file: {}", path.display()))?;

        self.load_from_str(&content)
            .with_context(|| format!("Invalid rig configuration: {}", path.display()))
    }

    /// Same as [`load_from_file`](Self::load_from_file) for in-memory YAML.
    pub fn load_from_str(&mut self, content: &str) -> Result<()> {
        self.reset();

        let file: RigConfigFile =
            serde_yaml::from_str(content).context("Failed to parse rig YAML")?;

        let mut settings = ControllerSettings::default();
        settings.apply(file.controller)?;

        // uid → owning node
        let mut owners: HashMap<String, String> = HashMap::new();
        let mut nodes = BTreeMap::new();

        for (node_id, entry) in file.nodes {
            for uid in entry.devices.keys() {
                if let Some(other) = owners.insert(uid.clone(), node_id.clone()) {
                    bail!("Device uid '{uid}' is declared on both '{other}' and '{node_id}'");
                }
            }

            let node = NodeConfig {
                node_id: node_id.clone(),
                hostname: entry.hostname,
                start_port: entry.start_port,
                devices: entry.devices,
            };

            debug!(
                "  Node: {} | host: {} | start_port: {} | devices: {}",
                node.node_id,
                node.hostname,
                node.start_port,
                node.devices.len(),
            );

            nodes.insert(node_id, node);
        }

        if nodes.is_empty() {
            warn!("No nodes found in rig configuration");
        }

        self.nodes = nodes;
        self.settings = settings;
        self.loaded = true;

        info!(
            "Successfully loaded {} node(s) with {} device(s)",
            self.nodes.len(),
            self.device_count(),
        );

        Ok(())
    }

    fn reset(&mut self) {
        self.nodes.clear();
        self.settings = ControllerSettings::default();
        self.loaded = false;
    }

    pub fn get_node_config(&self, node_id: &str) -> Option<&NodeConfig> {
        self.nodes.get(node_id)
    }

    pub fn get_all_nodes(&self) -> &BTreeMap<String, NodeConfig> {
        &self.nodes
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    /// Total number of devices over all nodes.
    pub fn device_count(&self) -> usize {
        self.nodes.values().map(|n| n.devices.len()).sum()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Hands the loaded configuration over to a controller.
    pub fn into_parts(self) -> (BTreeMap<String, NodeConfig>, ControllerSettings) {
        (self.nodes, self.settings)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

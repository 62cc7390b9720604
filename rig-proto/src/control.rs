/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Provisioning protocol between the controller and its nodes.
//!
//! | Message | Direction | Payload |
//! |---|---|---|
//! | `provision_request` | node → controller | none (identity is the session header) |
//! | `provision_response` | controller → node | [`NodeConfig`] |
//! | `provision_complete` | node → controller | addresses + build errors |
//! | `shutdown` | controller → node | none |
//! | `shutdown_complete` | node → controller | none |
//!
//! Both directions are internally tagged by `kind`, e.g.
//! `{"kind":"provision_request"}`.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::NodeConfig;
use crate::device::DeviceType;

// ── Addresses ─────────────────────────────────────────────────────────────────

/// Where the controller can reach one successfully built device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedDeviceAddress {
    pub uid: String,
    pub host: String,
    pub rpc_port: u16,
    pub pub_port: u16,
    pub device_type: DeviceType,
}

impl ProvisionedDeviceAddress {
    /// URI of the request/response endpoint.
    pub fn rpc_endpoint(&self) -> String {
        http_uri(&self.host, self.rpc_port)
    }

    /// URI of the publish (heartbeat / property change) endpoint.
    pub fn pub_endpoint(&self) -> String {
        http_uri(&self.host, self.pub_port)
    }
}

/// IPv6 literals must be bracketed inside a URI authority.
fn http_uri(host: &str, port: u16) -> String {
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V6(ip)) => format!("http://[{ip}]:{port}"),
        _ => format!("http://{host}:{port}"),
    }
}

// ── Build errors ──────────────────────────────────────────────────────────────

/// Stage of the device build that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildErrorKind {
    /// No constructor is registered for the spec's target.
    Import,
    /// The constructor returned an error or panicked.
    Instantiation,
    /// A referenced device failed, or is not declared on the node.
    Dependency,
    /// The device sits on a reference cycle.
    Circular,
}

impl fmt::Display for BuildErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BuildErrorKind::Import => "import",
            BuildErrorKind::Instantiation => "instantiation",
            BuildErrorKind::Dependency => "dependency",
            BuildErrorKind::Circular => "circular",
        };
        f.write_str(s)
    }
}

/// Why one device did not come up.
///
/// This is data, not a control-flow error: nodes collect these and report them
/// next to their successes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind} error for device '{uid}': {message}")]
pub struct DeviceBuildError {
    pub uid: String,
    pub kind: BuildErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

impl DeviceBuildError {
    pub fn new(uid: impl Into<String>, kind: BuildErrorKind, message: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            kind,
            message: message.into(),
            trace: None,
        }
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }
}

// ── Messages ──────────────────────────────────────────────────────────────────

/// Node → controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeMessage {
    ProvisionRequest,
    ProvisionComplete {
        devices: BTreeMap<String, ProvisionedDeviceAddress>,
        errors: BTreeMap<String, DeviceBuildError>,
    },
    ShutdownComplete,
}

impl NodeMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            NodeMessage::ProvisionRequest => "provision_request",
            NodeMessage::ProvisionComplete { .. } => "provision_complete",
            NodeMessage::ShutdownComplete => "shutdown_complete",
        }
    }
}

/// Controller → node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControllerMessage {
    ProvisionResponse { config: NodeConfig },
    Shutdown,
}

impl ControllerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ControllerMessage::ProvisionResponse { .. } => "provision_response",
            ControllerMessage::Shutdown => "shutdown",
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Device-level wire types: type tags, interface descriptor, and the messages
//! of the `DeviceRpc` and `DevicePub` services.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Device type ───────────────────────────────────────────────────────────────

/// Closed set of device kinds the controller has specialised clients for.
///
/// Any tag the controller does not know decodes as [`DeviceType::Generic`], so
/// a newer node never breaks an older controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Camera,
    Laser,
    Axis,
    Daq,
    #[default]
    #[serde(other)]
    Generic,
}

impl DeviceType {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceType::Camera => "camera",
            DeviceType::Laser => "laser",
            DeviceType::Axis => "axis",
            DeviceType::Daq => "daq",
            DeviceType::Generic => "generic",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Interface descriptor ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CommandInfo {
    #[serde(default)]
    pub description: String,
    /// Positional parameter names, informational only.
    #[serde(default)]
    pub params: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PropertyInfo {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub writable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
}

/// What a device offers: its commands, its properties, and free-form metadata.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DeviceInterface {
    pub uid: String,
    pub device_type: DeviceType,
    #[serde(default)]
    pub commands: BTreeMap<String, CommandInfo>,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyInfo>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

// ── DeviceRpc messages ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Empty {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeRequest {
    pub command: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetPropRequest {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetPropRequest {
    pub name: String,
    pub value: Value,
}

/// Outcome of a device operation.
///
/// A failure inside the device is an `Error` reply on a healthy transport; a
/// transport failure surfaces as a `tonic::Status` instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RpcReply {
    Ok { value: Value },
    Error { message: String },
}

impl RpcReply {
    pub fn into_result(self) -> Result<Value, String> {
        match self {
            RpcReply::Ok { value } => Ok(value),
            RpcReply::Error { message } => Err(message),
        }
    }
}

impl<E: fmt::Display> From<Result<Value, E>> for RpcReply {
    fn from(result: Result<Value, E>) -> Self {
        match result {
            Ok(value) => RpcReply::Ok { value },
            Err(e) => RpcReply::Error {
                message: e.to_string(),
            },
        }
    }
}

// ── DevicePub messages ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "topic", rename_all = "snake_case")]
pub enum PubMessage {
    /// Liveness signal; the first one is sent as soon as a subscriber attaches.
    Heartbeat {
        uid: String,
        seq: u64,
        timestamp_ms: u64,
    },
    PropertyChanged {
        uid: String,
        name: String,
        value: Value,
    },
}

// ── Tests ─────────────────────────────────────────────────────────────────────

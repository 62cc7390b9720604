/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Per-node configuration as it travels in a `provision_response`.
//!
//! The same structs are deserialised from the controller's YAML rig file, so a
//! device entry reads naturally in both places:
//!
//! ```yaml
//! stage_x:
//!   target: sim.Axis
//!   kwargs:
//!     speed_mm_s: 2.5
//!     controller: { ref: stage_ctrl }   # typed reference, not a string
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── SpecValue ─────────────────────────────────────────────────────────────────

/// Explicit reference to another device declared on the same node.
///
/// Written as `{ ref: <uid> }`.  Any other key in the map makes it an ordinary
/// [`SpecValue::Map`] instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceRef {
    #[serde(rename = "ref")]
    pub uid: String,
}

/// One constructor argument value.
///
/// A device reference is its own variant, so the string `"laser_1"` is always a
/// literal and never silently turns into a dependency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SpecValue {
    Null,
    Ref(DeviceRef),
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<SpecValue>),
    Map(BTreeMap<String, SpecValue>),
}

impl SpecValue {
    /// Shorthand for a device reference.
    pub fn reference(uid: impl Into<String>) -> Self {
        SpecValue::Ref(DeviceRef { uid: uid.into() })
    }

    /// Adds every device uid referenced by this value (recursively through
    /// lists and maps) to `out`.
    pub fn collect_refs(&self, out: &mut BTreeSet<String>) {
        match self {
            SpecValue::Ref(r) => {
                out.insert(r.uid.clone());
            }
            SpecValue::List(items) => items.iter().for_each(|v| v.collect_refs(out)),
            SpecValue::Map(map) => map.values().for_each(|v| v.collect_refs(out)),
            _ => {}
        }
    }

    /// JSON form of the value.  References become `{"ref": uid}`.
    pub fn to_json(&self) -> Value {
        match self {
            SpecValue::Null => Value::Null,
            SpecValue::Ref(r) => serde_json::json!({ "ref": r.uid }),
            SpecValue::Bool(b) => Value::Bool(*b),
            SpecValue::Int(i) => Value::from(*i),
            SpecValue::Float(f) => Value::from(*f),
            SpecValue::Str(s) => Value::String(s.clone()),
            SpecValue::List(items) => Value::Array(items.iter().map(SpecValue::to_json).collect()),
            SpecValue::Map(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for SpecValue {
    fn from(s: &str) -> Self {
        SpecValue::Str(s.to_string())
    }
}

impl From<i64> for SpecValue {
    fn from(i: i64) -> Self {
        SpecValue::Int(i)
    }
}

impl From<f64> for SpecValue {
    fn from(f: f64) -> Self {
        SpecValue::Float(f)
    }
}

impl From<bool> for SpecValue {
    fn from(b: bool) -> Self {
        SpecValue::Bool(b)
    }
}

// ── DeviceSpec ────────────────────────────────────────────────────────────────

/// Build instructions for one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSpec {
    /// Registry key of the constructor, e.g. `sim.Camera`.
    pub target: String,

    #[serde(default)]
    pub kwargs: BTreeMap<String, SpecValue>,
}

impl DeviceSpec {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            kwargs: BTreeMap::new(),
        }
    }

    pub fn with_kwarg(mut self, name: impl Into<String>, value: impl Into<SpecValue>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    /// Uids this spec references anywhere in its kwargs.
    pub fn dependencies(&self) -> BTreeSet<String> {
        let mut deps = BTreeSet::new();
        for value in self.kwargs.values() {
            value.collect_refs(&mut deps);
        }
        deps
    }
}

// ── NodeConfig ────────────────────────────────────────────────────────────────

fn default_hostname() -> String {
    String::from("localhost")
}

/// Everything a node needs to build its devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Filled from the map key when loaded from a rig file.
    #[serde(default)]
    pub node_id: String,

    /// Host the node runs on; also the host advertised in device addresses.
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// First port of the per-device port range.  `0` asks the OS for
    /// ephemeral ports.
    #[serde(default)]
    pub start_port: u16,

    #[serde(default)]
    pub devices: BTreeMap<String, DeviceSpec>,
}

impl NodeConfig {
    pub fn new(node_id: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            hostname: hostname.into(),
            start_port: 0,
            devices: BTreeMap::new(),
        }
    }

    pub fn with_device(mut self, uid: impl Into<String>, spec: DeviceSpec) -> Self {
        self.devices.insert(uid.into(), spec);
        self
    }

    /// `true` when the controller should spawn this node itself.
    pub fn is_local(&self) -> bool {
        self.loopback_ip().is_some()
    }

    /// Loopback address matching `hostname`, for local nodes only.
    pub fn loopback_ip(&self) -> Option<IpAddr> {
        match self.hostname.as_str() {
            "localhost" | "127.0.0.1" => Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            "::1" => Some(IpAddr::V6(Ipv6Addr::LOCALHOST)),
            _ => None,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! The device contract consumed by the node.
//!
//! A node does not know what a camera or a laser is.  It only needs something
//! constructible from `(uid, kwargs)` that reports a type tag, describes its
//! interface, and answers `call` / `get_prop` / `set_prop`.  How that object
//! talks to hardware is its own business.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use rig_proto::{DeviceInterface, DeviceType};
use serde_json::Value;
use thiserror::Error;

// ── Errors ────────────────────────────────────────────────────────────────────

/// Failure inside a device operation.  Travels back to the caller as an
/// `RpcReply::Error`, never as a transport failure.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DeviceError {
    #[error("device '{uid}' has no command '{command}'")]
    UnknownCommand { uid: String, command: String },

    #[error("device '{uid}' has no property '{name}'")]
    UnknownProperty { uid: String, name: String },

    #[error("property '{name}' of device '{uid}' is read-only")]
    ReadOnly { uid: String, name: String },

    #[error("invalid argument for '{operation}': {reason}")]
    InvalidArgument { operation: String, reason: String },

    #[error("device '{uid}' fault: {message}")]
    Fault { uid: String, message: String },
}

// ── Device trait ──────────────────────────────────────────────────────────────

/// A controllable unit hosted by a node.
///
/// Methods are synchronous; the device server runs them on the blocking pool,
/// so an implementation may block on I/O.
pub trait Device: Send + Sync {
    fn uid(&self) -> &str;

    fn device_type(&self) -> DeviceType;

    fn interface(&self) -> DeviceInterface;

    fn call(&self, command: &str, args: &[Value]) -> Result<Value, DeviceError>;

    fn get_prop(&self, name: &str) -> Result<Value, DeviceError>;

    fn set_prop(&self, name: &str, value: Value) -> Result<(), DeviceError>;

    /// Release hardware resources.  Called once when the node shuts down.
    fn close(&self) -> Result<(), DeviceError> {
        Ok(())
    }
}

impl fmt::Debug for dyn Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Device({}, {})", self.uid(), self.device_type())
    }
}

// ── Constructor arguments ─────────────────────────────────────────────────────

/// A constructor argument after reference resolution.
///
/// Every `{ ref: uid }` of the spec has been replaced by the built device.
#[derive(Debug, Clone)]
pub enum Arg {
    Value(Value),
    Device(Arc<dyn Device>),
    List(Vec<Arg>),
    Map(BTreeMap<String, Arg>),
}

impl Arg {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Arg::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_device(&self) -> Option<&Arc<dyn Device>> {
        match self {
            Arg::Device(d) => Some(d),
            _ => None,
        }
    }

    /// JSON view of the argument.  Devices render as `{"ref": uid}`.
    pub fn to_json(&self) -> Value {
        match self {
            Arg::Value(v) => v.clone(),
            Arg::Device(d) => serde_json::json!({ "ref": d.uid() }),
            Arg::List(items) => Value::Array(items.iter().map(Arg::to_json).collect()),
            Arg::Map(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

/// Keyword arguments handed to a device constructor.
pub type Kwargs = BTreeMap<String, Arg>;

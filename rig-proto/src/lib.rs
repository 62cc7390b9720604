/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Rig control plane – shared wire model.
//!
//! Everything that crosses a process boundary lives here so that the node
//! (`rig-n`) and the controller (`rig-o`) agree on one definition.
//!
//! ```text
//! lib.rs
//! ├── config/    – NodeConfig, DeviceSpec, SpecValue (typed device references)
//! ├── control/   – provisioning protocol messages, addresses, build errors
//! ├── device/    – device type tags, interface descriptor, RPC/pub messages
//! ├── codec/     – JSON codec plugged into tonic
//! └── rig_v1     – generated service stubs (Control, DeviceRpc, DevicePub)
//! ```

pub mod codec;
pub mod config;
pub mod control;
pub mod device;

pub use config::{DeviceRef, DeviceSpec, NodeConfig, SpecValue};
pub use control::{
    BuildErrorKind, ControllerMessage, DeviceBuildError, NodeMessage, ProvisionedDeviceAddress,
};
pub use device::{DeviceInterface, DeviceType, PubMessage, RpcReply};

/// Metadata key carrying the node identity on a control session.
///
/// The controller multiplexes every node over a single endpoint; this header
/// is how it tells the sessions apart.
pub const NODE_ID_HEADER: &str = "x-rig-node-id";

/// Generated gRPC service stubs.
///
/// `build.rs` writes one file per service into `OUT_DIR`, named
/// `<package>.<Service>.rs`.
pub mod rig_v1 {
    include!(concat!(env!("OUT_DIR"), "/rig.v1.Control.rs"));
    include!(concat!(env!("OUT_DIR"), "/rig.v1.DeviceRpc.rs"));
    include!(concat!(env!("OUT_DIR"), "/rig.v1.DevicePub.rs"));
}

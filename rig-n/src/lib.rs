/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Rig node agent.
//!
//! One process per node.  It asks the controller for its configuration,
//! builds the declared devices in dependency order, and exposes each one on
//! its own rpc / pub endpoints until told to shut down.
//!
//! ```text
//! lib.rs
//! ├── device/    – Device trait, constructor arguments, DeviceError
//! ├── registry/  – target string → constructor map
//! ├── sim/       – simulated devices (sim.Camera, sim.Laser, …)
//! ├── graph/     – dependency-ordered construction, failure containment
//! ├── server/    – per-device DeviceRpc / DevicePub endpoints
//! └── agent/     – control session state machine
//! ```

pub mod agent;
pub mod device;
pub mod graph;
pub mod registry;
pub mod server;
pub mod sim;

pub use agent::{AgentError, NodeAgent, NodeAgentOptions, NodeState};
pub use device::{Arg, Device, DeviceError, Kwargs};
pub use graph::{BuildOutcome, BuiltDevice, DeviceGraphBuilder};
pub use registry::DeviceRegistry;

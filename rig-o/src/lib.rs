/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Rig-O – rig orchestration controller
//!
//! Module layout:
//!
//! ```text
//! lib.rs
//! ├── config/       – YAML rig configuration (nodes, devices, controller settings)
//! ├── control/      – control endpoint; one bidirectional session per node
//! ├── launcher/     – local node process spawning and termination
//! ├── client/       – generic and typed device clients
//! └── controller/   – startup barriers, rollback, stop
//! ```

pub mod client;
pub mod config;
pub mod control;
pub mod controller;
pub mod launcher;

pub use client::{ClientError, DeviceClient, TypedClient};
pub use config::{ControllerSettings, RigConfigManager};
pub use controller::{LivenessReport, RigController, RigError, RigState};
pub use launcher::{NodeLauncher, NodeProcess, ProcessLauncher};

/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Structured error type of the rig controller.
//!
//! Only startup can fail.  A provisioning timeout is fatal and is returned
//! after the rollback has already released every node that did provision;
//! a liveness timeout is not an error at all, it shows up in the
//! [`LivenessReport`](super::LivenessReport).

use std::time::Duration;

use thiserror::Error;

use crate::control::ControlError;

#[derive(Debug, Error)]
pub enum RigError {
    #[error("controller has already been started")]
    AlreadyStarted,

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error(
        "provisioning timed out after {timeout:?}; nodes never provisioned: {}",
        missing.join(", ")
    )]
    ProvisioningTimeout {
        missing: Vec<String>,
        timeout: Duration,
    },

    #[error("no device client for uid '{uid}'")]
    AgentNotFound { uid: String },
}

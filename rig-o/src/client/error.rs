/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

use std::time::Duration;

use thiserror::Error;

/// Failure of a device client operation.
///
/// [`Device`](ClientError::Device) is the device refusing or failing the
/// operation on a healthy connection; every other variant is about reaching
/// the device at all.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("client for device '{uid}' is closed")]
    Closed { uid: String },

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("rpc failed: {0}")]
    Status(#[from] tonic::Status),

    #[error("device '{uid}' reported: {message}")]
    Device { uid: String, message: String },

    #[error("no heartbeat from device '{uid}' within {timeout:?}")]
    Timeout { uid: String, timeout: Duration },

    #[error("publish stream of device '{uid}' ended")]
    StreamEnded { uid: String },

    #[error("device '{uid}' returned {value} where {expected} was expected")]
    Decode {
        uid: String,
        expected: &'static str,
        value: serde_json::Value,
    },
}

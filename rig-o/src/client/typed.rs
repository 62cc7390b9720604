/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Typed device clients, selected by the device type tag.
//!
//! | Tag | Client | Operations |
//! |---|---|---|
//! | `camera` | [`CameraClient`] | exposure, snap |
//! | `laser` | [`LaserClient`] | power, enable / disable |
//! | `axis` | [`AxisClient`] | position, move_abs / move_rel, home |
//! | `daq` | [`DaqClient`] | sample rate, start / stop |
//! | anything else | [`DeviceClient`] | generic call / get_prop / set_prop |
//!
//! Every typed client derefs to its [`DeviceClient`], so the generic
//! operations stay available.

use std::ops::Deref;

use rig_proto::{DeviceType, ProvisionedDeviceAddress};
use serde_json::Value;

use super::{ClientError, DeviceClient};

// ── Value helpers ─────────────────────────────────────────────────────────────

fn as_f64(client: &DeviceClient, value: Value) -> Result<f64, ClientError> {
    value.as_f64().ok_or_else(|| ClientError::Decode {
        uid: client.uid().to_string(),
        expected: "a number",
        value,
    })
}

fn as_bool(client: &DeviceClient, value: Value) -> Result<bool, ClientError> {
    value.as_bool().ok_or_else(|| ClientError::Decode {
        uid: client.uid().to_string(),
        expected: "a boolean",
        value,
    })
}

macro_rules! typed_client {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug)]
        pub struct $name(DeviceClient);

        impl $name {
            pub fn new(inner: DeviceClient) -> Self {
                Self(inner)
            }

            pub fn into_inner(self) -> DeviceClient {
                self.0
            }
        }

        impl Deref for $name {
            type Target = DeviceClient;

            fn deref(&self) -> &DeviceClient {
                &self.0
            }
        }
    };
}

// ── Camera ────────────────────────────────────────────────────────────────────

typed_client!(
    /// Camera handle.
    CameraClient
);

/// Result of one [`CameraClient::snap`].
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub frame: u64,
    pub exposure_ms: f64,
}

impl CameraClient {
    pub async fn exposure_ms(&self) -> Result<f64, ClientError> {
        let v = self.get_prop("exposure_ms").await?;
        as_f64(self, v)
    }

    pub async fn set_exposure_ms(&self, exposure_ms: f64) -> Result<(), ClientError> {
        self.set_prop("exposure_ms", exposure_ms).await
    }

    pub async fn snap(&self) -> Result<Frame, ClientError> {
        let v = self.call("snap", Vec::new()).await?;
        match (v.get("frame").and_then(Value::as_u64), v.get("exposure_ms").and_then(Value::as_f64)) {
            (Some(frame), Some(exposure_ms)) => Ok(Frame { frame, exposure_ms }),
            _ => Err(ClientError::Decode {
                uid: self.uid().to_string(),
                expected: "a frame descriptor",
                value: v,
            }),
        }
    }
}

// ── Laser ─────────────────────────────────────────────────────────────────────

typed_client!(
    /// Laser handle.
    LaserClient
);

impl LaserClient {
    pub async fn power_mw(&self) -> Result<f64, ClientError> {
        let v = self.get_prop("power_mw").await?;
        as_f64(self, v)
    }

    pub async fn set_power_mw(&self, power_mw: f64) -> Result<(), ClientError> {
        self.set_prop("power_mw", power_mw).await
    }

    pub async fn is_enabled(&self) -> Result<bool, ClientError> {
        let v = self.get_prop("enabled").await?;
        as_bool(self, v)
    }

    pub async fn enable(&self) -> Result<(), ClientError> {
        self.call("enable", Vec::new()).await.map(|_| ())
    }

    pub async fn disable(&self) -> Result<(), ClientError> {
        self.call("disable", Vec::new()).await.map(|_| ())
    }
}

// ── Axis ──────────────────────────────────────────────────────────────────────

typed_client!(
    /// Single linear axis handle.  Positions are in millimetres.
    AxisClient
);

impl AxisClient {
    pub async fn position_mm(&self) -> Result<f64, ClientError> {
        let v = self.get_prop("position_mm").await?;
        as_f64(self, v)
    }

    /// Moves to `position_mm`; returns the new position.
    pub async fn move_abs(&self, position_mm: f64) -> Result<f64, ClientError> {
        let v = self.call("move_abs", vec![Value::from(position_mm)]).await?;
        as_f64(self, v)
    }

    pub async fn move_rel(&self, delta_mm: f64) -> Result<f64, ClientError> {
        let v = self.call("move_rel", vec![Value::from(delta_mm)]).await?;
        as_f64(self, v)
    }

    pub async fn home(&self) -> Result<(), ClientError> {
        self.call("home", Vec::new()).await.map(|_| ())
    }
}

// ── DAQ ───────────────────────────────────────────────────────────────────────

typed_client!(
    /// Data acquisition card handle.
    DaqClient
);

impl DaqClient {
    pub async fn sample_rate_hz(&self) -> Result<f64, ClientError> {
        let v = self.get_prop("sample_rate_hz").await?;
        as_f64(self, v)
    }

    pub async fn set_sample_rate_hz(&self, rate: f64) -> Result<(), ClientError> {
        self.set_prop("sample_rate_hz", rate).await
    }

    pub async fn start(&self) -> Result<(), ClientError> {
        self.call("start", Vec::new()).await.map(|_| ())
    }

    pub async fn stop(&self) -> Result<(), ClientError> {
        self.call("stop", Vec::new()).await.map(|_| ())
    }

    pub async fn is_running(&self) -> Result<bool, ClientError> {
        let v = self.get_prop("running").await?;
        as_bool(self, v)
    }
}

// ── TypedClient ───────────────────────────────────────────────────────────────

/// A device handle of the kind matching its type tag.
#[derive(Debug)]
pub enum TypedClient {
    Camera(CameraClient),
    Laser(LaserClient),
    Axis(AxisClient),
    Daq(DaqClient),
    Generic(DeviceClient),
}

impl TypedClient {
    /// Builds the client registered for `address.device_type`.
    pub fn for_address(address: ProvisionedDeviceAddress) -> Result<Self, ClientError> {
        let device_type = address.device_type;
        let base = DeviceClient::connect(address)?;
        Ok(match device_type {
            DeviceType::Camera => TypedClient::Camera(CameraClient::new(base)),
            DeviceType::Laser => TypedClient::Laser(LaserClient::new(base)),
            DeviceType::Axis => TypedClient::Axis(AxisClient::new(base)),
            DeviceType::Daq => TypedClient::Daq(DaqClient::new(base)),
            DeviceType::Generic => TypedClient::Generic(base),
        })
    }

    /// The generic handle underneath.
    pub fn base(&self) -> &DeviceClient {
        match self {
            TypedClient::Camera(c) => c,
            TypedClient::Laser(c) => c,
            TypedClient::Axis(c) => c,
            TypedClient::Daq(c) => c,
            TypedClient::Generic(c) => c,
        }
    }

    pub fn as_camera(&self) -> Option<&CameraClient> {
        match self {
            TypedClient::Camera(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_laser(&self) -> Option<&LaserClient> {
        match self {
            TypedClient::Laser(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_axis(&self) -> Option<&AxisClient> {
        match self {
            TypedClient::Axis(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_daq(&self) -> Option<&DaqClient> {
        match self {
            TypedClient::Daq(c) => Some(c),
            _ => None,
        }
    }
}

impl Deref for TypedClient {
    type Target = DeviceClient;

    fn deref(&self) -> &DeviceClient {
        self.base()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

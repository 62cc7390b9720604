/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Controller-side device handles.
//!
//! [`DeviceClient`] is the generic handle: it talks to the device's rpc and
//! pub endpoints and knows nothing about what the device is.  The typed
//! clients in [`typed`] wrap it with named operations for the device types
//! the controller understands; [`TypedClient::for_address`] picks one by the
//! type tag reported at provisioning.

pub mod error;
pub mod typed;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rig_proto::device::{Empty, GetPropRequest, InvokeRequest, SetPropRequest};
use rig_proto::rig_v1::device_pub_client::DevicePubClient;
use rig_proto::rig_v1::device_rpc_client::DeviceRpcClient;
use rig_proto::{DeviceInterface, DeviceType, ProvisionedDeviceAddress, PubMessage, RpcReply};
use serde_json::Value;
use tonic::transport::{Channel, Endpoint};
use tonic::Streaming;
use tracing::debug;

pub use error::ClientError;
pub use typed::{AxisClient, CameraClient, DaqClient, LaserClient, TypedClient};

/// Upper bound on establishing a TCP connection to a device endpoint.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// ── DeviceClient ──────────────────────────────────────────────────────────────

pub struct DeviceClient {
    address: ProvisionedDeviceAddress,
    rpc: DeviceRpcClient<Channel>,
    publisher: DevicePubClient<Channel>,
    closed: AtomicBool,
}

impl DeviceClient {
    /// Creates a handle for `address`.  Connections are opened on first use.
    pub fn connect(address: ProvisionedDeviceAddress) -> Result<Self, ClientError> {
        let rpc = lazy_channel(address.rpc_endpoint())?;
        let publisher = lazy_channel(address.pub_endpoint())?;
        debug!(uid = %address.uid, device_type = %address.device_type, "Device client created");
        Ok(Self {
            rpc: DeviceRpcClient::new(rpc),
            publisher: DevicePubClient::new(publisher),
            address,
            closed: AtomicBool::new(false),
        })
    }

    pub fn uid(&self) -> &str {
        &self.address.uid
    }

    pub fn device_type(&self) -> DeviceType {
        self.address.device_type
    }

    pub fn address(&self) -> &ProvisionedDeviceAddress {
        &self.address
    }

    // ── RPC ───────────────────────────────────────────────────────────────────

    /// Invokes `command` with positional `args`.
    pub async fn call(&self, command: &str, args: Vec<Value>) -> Result<Value, ClientError> {
        self.ensure_open()?;
        let request = InvokeRequest {
            command: command.to_string(),
            args,
        };
        let reply = self.rpc.clone().invoke(request).await?.into_inner();
        self.unpack(reply)
    }

    pub async fn get_prop(&self, name: &str) -> Result<Value, ClientError> {
        self.ensure_open()?;
        let request = GetPropRequest {
            name: name.to_string(),
        };
        let reply = self.rpc.clone().get_prop(request).await?.into_inner();
        self.unpack(reply)
    }

    pub async fn set_prop(&self, name: &str, value: impl Into<Value>) -> Result<(), ClientError> {
        self.ensure_open()?;
        let request = SetPropRequest {
            name: name.to_string(),
            value: value.into(),
        };
        let reply = self.rpc.clone().set_prop(request).await?.into_inner();
        self.unpack(reply).map(|_| ())
    }

    pub async fn interface(&self) -> Result<DeviceInterface, ClientError> {
        self.ensure_open()?;
        Ok(self.rpc.clone().interface(Empty {}).await?.into_inner())
    }

    // ── Publish stream ────────────────────────────────────────────────────────

    /// Heartbeats and property changes of the device.
    pub async fn subscribe(&self) -> Result<Streaming<PubMessage>, ClientError> {
        self.ensure_open()?;
        Ok(self.publisher.clone().subscribe(Empty {}).await?.into_inner())
    }

    /// Waits for the first heartbeat on a fresh subscription.
    pub async fn wait_for_heartbeat(&self, timeout: Duration) -> Result<(), ClientError> {
        tokio::time::timeout(timeout, self.first_heartbeat())
            .await
            .map_err(|_| ClientError::Timeout {
                uid: self.uid().to_string(),
                timeout,
            })?
    }

    async fn first_heartbeat(&self) -> Result<(), ClientError> {
        let mut stream = self.subscribe().await?;
        loop {
            match stream.message().await? {
                Some(PubMessage::Heartbeat { .. }) => return Ok(()),
                Some(PubMessage::PropertyChanged { .. }) => continue,
                None => {
                    return Err(ClientError::StreamEnded {
                        uid: self.uid().to_string(),
                    })
                }
            }
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Marks the handle closed.  Local only; the device keeps running until
    /// its node shuts down.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(uid = %self.address.uid, "Device client closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<(), ClientError> {
        if self.is_closed() {
            return Err(ClientError::Closed {
                uid: self.uid().to_string(),
            });
        }
        Ok(())
    }

    fn unpack(&self, reply: RpcReply) -> Result<Value, ClientError> {
        reply.into_result().map_err(|message| ClientError::Device {
            uid: self.uid().to_string(),
            message,
        })
    }
}

impl std::fmt::Debug for DeviceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceClient")
            .field("address", &self.address)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn lazy_channel(uri: String) -> Result<Channel, ClientError> {
    Ok(Endpoint::from_shared(uri)?
        .connect_timeout(CONNECT_TIMEOUT)
        .connect_lazy())
}

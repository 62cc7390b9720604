/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Per-device network endpoints.
//!
//! Every built device gets two listeners:
//!
//! * **rpc** – `DeviceRpc` service: `invoke`, `get_prop`, `set_prop`,
//!   `interface`.  Device methods are synchronous and may block, so each call
//!   runs on the blocking pool.
//! * **pub** – `DevicePub` service: a stream of heartbeats and property
//!   changes.  A new subscriber receives one heartbeat immediately, then the
//!   periodic ones.
//!
//! Port `0` asks the OS for an ephemeral port; the address reported back to the
//! controller always carries the port actually bound.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rig_proto::device::{Empty, GetPropRequest, InvokeRequest, SetPropRequest};
use rig_proto::rig_v1::device_pub_server::{DevicePub, DevicePubServer};
use rig_proto::rig_v1::device_rpc_server::{DeviceRpc, DeviceRpcServer};
use rig_proto::{DeviceInterface, ProvisionedDeviceAddress, PubMessage, RpcReply};
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use crate::device::Device;
use crate::graph::BuiltDevice;

/// How long `close()` waits for each serving task before aborting it.
const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Capacity of the property-change / heartbeat fan-out.
const EVENT_CAPACITY: usize = 64;

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {role} endpoint on {addr}: {source}")]
    Bind {
        role: &'static str,
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

// ── Options ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host written into the advertised address.
    pub advertise_host: String,
    /// Interface the listeners bind to.
    pub bind_ip: IpAddr,
    pub rpc_port: u16,
    pub pub_port: u16,
    pub heartbeat_interval: Duration,
}

// ── DeviceServer ──────────────────────────────────────────────────────────────

/// Running rpc + pub endpoints of one device.
pub struct DeviceServer {
    device: Arc<dyn Device>,
    address: ProvisionedDeviceAddress,
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    closed: bool,
}

impl DeviceServer {
    /// Binds both listeners and starts serving.
    ///
    /// Nothing is spawned unless both binds succeed.
    pub async fn start(
        uid: &str,
        built: BuiltDevice,
        options: &ServerOptions,
    ) -> Result<Self, ServerError> {
        let rpc_listener = bind("rpc", options.bind_ip, options.rpc_port).await?;
        let pub_listener = bind("pub", options.bind_ip, options.pub_port).await?;

        let rpc_port = bound_port(&rpc_listener, options.rpc_port);
        let pub_port = bound_port(&pub_listener, options.pub_port);

        let (stop, stop_rx) = watch::channel(false);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let seq = Arc::new(AtomicU64::new(0));

        let rpc = RpcService {
            uid: uid.to_string(),
            device: Arc::clone(&built.device),
            events: events.clone(),
        };
        let publisher = PubService {
            uid: uid.to_string(),
            events: events.clone(),
            seq: Arc::clone(&seq),
            stop: stop_rx.clone(),
        };

        let mut tasks = Vec::with_capacity(3);

        let router = Server::builder().add_service(DeviceRpcServer::new(rpc));
        let incoming = TcpListenerStream::new(rpc_listener);
        let mut shutdown = stop_rx.clone();
        let rpc_uid = uid.to_string();
        tasks.push(tokio::spawn(async move {
            let signal = async move {
                let _ = shutdown.wait_for(|stopped| *stopped).await;
            };
            if let Err(e) = router.serve_with_incoming_shutdown(incoming, signal).await {
                warn!(uid = %rpc_uid, "rpc endpoint terminated: {e}");
            }
        }));

        let router = Server::builder().add_service(DevicePubServer::new(publisher));
        let incoming = TcpListenerStream::new(pub_listener);
        let mut shutdown = stop_rx.clone();
        let pub_uid = uid.to_string();
        tasks.push(tokio::spawn(async move {
            let signal = async move {
                let _ = shutdown.wait_for(|stopped| *stopped).await;
            };
            if let Err(e) = router.serve_with_incoming_shutdown(incoming, signal).await {
                warn!(uid = %pub_uid, "pub endpoint terminated: {e}");
            }
        }));

        tasks.push(tokio::spawn(heartbeat_loop(
            uid.to_string(),
            events,
            seq,
            options.heartbeat_interval,
            stop_rx,
        )));

        let address = ProvisionedDeviceAddress {
            uid: uid.to_string(),
            host: options.advertise_host.clone(),
            rpc_port,
            pub_port,
            device_type: built.device_type,
        };

        info!(
            uid = %uid,
            device_type = %built.device_type,
            rpc_port,
            pub_port,
            "Device endpoints up"
        );

        Ok(Self {
            device: built.device,
            address,
            stop,
            tasks,
            closed: false,
        })
    }

    pub fn address(&self) -> &ProvisionedDeviceAddress {
        &self.address
    }

    pub fn uid(&self) -> &str {
        &self.address.uid
    }

    /// Stops both endpoints and releases the device.  Idempotent.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let _ = self.stop.send(true);
        for mut task in self.tasks.drain(..) {
            if tokio::time::timeout(TASK_JOIN_TIMEOUT, &mut task).await.is_err() {
                warn!(uid = %self.address.uid, "endpoint did not stop in time, aborting");
                task.abort();
            }
        }

        if let Err(e) = self.device.close() {
            warn!(uid = %self.address.uid, "device close failed: {e}");
        }
        debug!(uid = %self.address.uid, "Device server closed");
    }
}

impl Drop for DeviceServer {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.stop.send(true);
            for task in &self.tasks {
                task.abort();
            }
        }
    }
}

async fn bind(role: &'static str, ip: IpAddr, port: u16) -> Result<TcpListener, ServerError> {
    let addr = SocketAddr::new(ip, port);
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { role, addr, source })
}

fn bound_port(listener: &TcpListener, requested: u16) -> u16 {
    listener
        .local_addr()
        .map(|a| a.port())
        .unwrap_or(requested)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Resolves once the stop flag is raised (or its sender is gone).
///
/// The `watch::Ref` returned by `wait_for` is not `Send`; it is dropped here
/// so the spawning tasks stay `Send`.
async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

async fn heartbeat_loop(
    uid: String,
    events: broadcast::Sender<PubMessage>,
    seq: Arc<AtomicU64>,
    period: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = stopped(&mut stop) => break,
            _ = ticker.tick() => {
                // No subscribers is fine; the beat is simply dropped.
                let _ = events.send(PubMessage::Heartbeat {
                    uid: uid.clone(),
                    seq: seq.fetch_add(1, Ordering::Relaxed),
                    timestamp_ms: now_ms(),
                });
            }
        }
    }
}

// ── DeviceRpc ─────────────────────────────────────────────────────────────────

struct RpcService {
    uid: String,
    device: Arc<dyn Device>,
    events: broadcast::Sender<PubMessage>,
}

impl RpcService {
    /// Runs a device operation on the blocking pool.
    async fn run<T, F>(&self, op: F) -> Result<T, Status>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Device) -> T + Send + 'static,
    {
        let device = Arc::clone(&self.device);
        tokio::task::spawn_blocking(move || op(device.as_ref()))
            .await
            .map_err(|e| Status::internal(format!("device task failed: {e}")))
    }
}

#[tonic::async_trait]
impl DeviceRpc for RpcService {
    async fn invoke(
        &self,
        request: Request<InvokeRequest>,
    ) -> Result<Response<RpcReply>, Status> {
        let InvokeRequest { command, args } = request.into_inner();
        debug!(uid = %self.uid, command = %command, "invoke");
        let result = self.run(move |d| d.call(&command, &args)).await?;
        Ok(Response::new(result.into()))
    }

    async fn get_prop(
        &self,
        request: Request<GetPropRequest>,
    ) -> Result<Response<RpcReply>, Status> {
        let GetPropRequest { name } = request.into_inner();
        let result = self.run(move |d| d.get_prop(&name)).await?;
        Ok(Response::new(result.into()))
    }

    async fn set_prop(
        &self,
        request: Request<SetPropRequest>,
    ) -> Result<Response<RpcReply>, Status> {
        let SetPropRequest { name, value } = request.into_inner();
        let (prop, written) = (name.clone(), value.clone());
        let result = self.run(move |d| d.set_prop(&prop, written)).await?;

        if result.is_ok() {
            let _ = self.events.send(PubMessage::PropertyChanged {
                uid: self.uid.clone(),
                name,
                value,
            });
        }
        Ok(Response::new(result.map(|()| Value::Null).into()))
    }

    async fn interface(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<DeviceInterface>, Status> {
        let iface = self.run(|d| d.interface()).await?;
        Ok(Response::new(iface))
    }
}

// ── DevicePub ─────────────────────────────────────────────────────────────────

struct PubService {
    uid: String,
    events: broadcast::Sender<PubMessage>,
    seq: Arc<AtomicU64>,
    stop: watch::Receiver<bool>,
}

#[tonic::async_trait]
impl DevicePub for PubService {
    type SubscribeStream = ReceiverStream<Result<PubMessage, Status>>;

    async fn subscribe(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<Self::SubscribeStream>, Status> {
        let mut events = self.events.subscribe();
        let mut stop = self.stop.clone();
        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);

        let first = PubMessage::Heartbeat {
            uid: self.uid.clone(),
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            timestamp_ms: now_ms(),
        };
        let uid = self.uid.clone();

        tokio::spawn(async move {
            if tx.send(Ok(first)).await.is_err() {
                return;
            }
            loop {
                tokio::select! {
                    _ = stopped(&mut stop) => break,
                    event = events.recv() => match event {
                        Ok(msg) => {
                            if tx.send(Ok(msg)).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(uid = %uid, skipped, "subscriber lagging");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Node agent against a scripted in-process controller.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rig_n::{DeviceRegistry, NodeAgent, NodeAgentOptions};
use rig_proto::device::InvokeRequest;
use rig_proto::rig_v1::control_server::{Control, ControlServer};
use rig_proto::rig_v1::device_rpc_client::DeviceRpcClient;
use rig_proto::{
    BuildErrorKind, ControllerMessage, DeviceSpec, NodeConfig, NodeMessage, RpcReply, SpecValue,
    NODE_ID_HEADER,
};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};

const STEP: Duration = Duration::from_secs(5);

type Outbound = mpsc::Sender<Result<ControllerMessage, Status>>;

/// Answers `ProvisionRequest` with a fixed config and reports everything it
/// receives.  Further messages are pushed by the test through `outbound`.
struct ScriptedController {
    config: NodeConfig,
    seen: mpsc::UnboundedSender<(String, NodeMessage)>,
    outbound: Arc<Mutex<Option<Outbound>>>,
}

#[tonic::async_trait]
impl Control for ScriptedController {
    type SessionStream = ReceiverStream<Result<ControllerMessage, Status>>;

    async fn session(
        &self,
        request: Request<Streaming<NodeMessage>>,
    ) -> Result<Response<Self::SessionStream>, Status> {
        let node = request
            .metadata()
            .get(NODE_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let mut inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(8);
        // The only long-lived sender; dropping it ends the session.
        *self.outbound.lock().unwrap() = Some(tx);

        let config = self.config.clone();
        let seen = self.seen.clone();
        let outbound = Arc::clone(&self.outbound);
        tokio::spawn(async move {
            while let Ok(Some(msg)) = inbound.message().await {
                let provision = matches!(msg, NodeMessage::ProvisionRequest);
                let _ = seen.send((node.clone(), msg));
                if provision {
                    let sender = outbound.lock().unwrap().clone();
                    if let Some(tx) = sender {
                        let reply = ControllerMessage::ProvisionResponse {
                            config: config.clone(),
                        };
                        let _ = tx.send(Ok(reply)).await;
                    }
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

struct Harness {
    addr: String,
    seen: mpsc::UnboundedReceiver<(String, NodeMessage)>,
    outbound: Arc<Mutex<Option<Outbound>>>,
}

impl Harness {
    async fn start(config: NodeConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (seen_tx, seen) = mpsc::unbounded_channel();
        let outbound = Arc::new(Mutex::new(None));

        let controller = ScriptedController {
            config,
            seen: seen_tx,
            outbound: Arc::clone(&outbound),
        };
        tokio::spawn(
            Server::builder()
                .add_service(ControlServer::new(controller))
                .serve_with_incoming(TcpListenerStream::new(listener)),
        );

        Self {
            addr,
            seen,
            outbound,
        }
    }

    async fn next(&mut self) -> (String, NodeMessage) {
        tokio::time::timeout(STEP, self.seen.recv())
            .await
            .expect("timed out waiting for a node message")
            .expect("controller stopped")
    }

    async fn send(&self, msg: ControllerMessage) {
        let tx = self.outbound.lock().unwrap().clone().expect("no session yet");
        tx.send(Ok(msg)).await.unwrap();
    }

    fn drop_session(&self) {
        self.outbound.lock().unwrap().take();
    }

    fn agent(&self) -> NodeAgent {
        let mut options = NodeAgentOptions::new("node01", self.addr.clone(), 0);
        options.heartbeat_interval = Duration::from_millis(50);
        NodeAgent::new(options, DeviceRegistry::with_builtin())
    }
}

fn bench_config() -> NodeConfig {
    NodeConfig::new("node01", "localhost")
        .with_device("cam0", DeviceSpec::new("sim.Camera"))
        .with_device(
            "stage",
            DeviceSpec::new("sim.Axis").with_kwarg("camera", SpecValue::reference("cam0")),
        )
        .with_device("bad", DeviceSpec::new("vendor.Missing"))
}

#[tokio::test]
async fn provisions_serves_and_shuts_down() {
    let mut harness = Harness::start(bench_config()).await;
    let agent = tokio::spawn(harness.agent().run(std::future::pending()));

    let (node, first) = harness.next().await;
    assert_eq!(node, "node01");
    assert_eq!(first, NodeMessage::ProvisionRequest);

    let (_, complete) = harness.next().await;
    let NodeMessage::ProvisionComplete { devices, errors } = complete else {
        panic!("expected ProvisionComplete, got {complete:?}");
    };
    assert_eq!(devices.keys().collect::<Vec<_>>(), ["cam0", "stage"]);
    assert_eq!(errors.keys().collect::<Vec<_>>(), ["bad"]);
    assert_eq!(errors["bad"].kind, BuildErrorKind::Import);

    {
        let mut cam = DeviceRpcClient::connect(devices["cam0"].rpc_endpoint())
            .await
            .unwrap();
        let reply = cam
            .invoke(InvokeRequest {
                command: "snap".into(),
                args: vec![],
            })
            .await
            .unwrap()
            .into_inner();
        assert!(matches!(reply, RpcReply::Ok { .. }), "snap failed: {reply:?}");
    }

    harness.send(ControllerMessage::Shutdown).await;
    let (_, done) = harness.next().await;
    assert_eq!(done, NodeMessage::ShutdownComplete);
    harness.drop_session();

    let result = tokio::time::timeout(STEP, agent).await.unwrap().unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn session_loss_stops_the_agent() {
    let mut harness = Harness::start(bench_config()).await;
    let agent = tokio::spawn(harness.agent().run(std::future::pending()));

    harness.next().await; // ProvisionRequest
    harness.next().await; // ProvisionComplete
    harness.drop_session();

    let result = tokio::time::timeout(STEP, agent).await.unwrap().unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn cancellation_stops_a_serving_agent() {
    let mut harness = Harness::start(bench_config()).await;
    let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
    let agent = tokio::spawn(harness.agent().run(async move {
        let _ = cancel_rx.await;
    }));

    harness.next().await; // ProvisionRequest
    harness.next().await; // ProvisionComplete
    cancel_tx.send(()).unwrap();

    let result = tokio::time::timeout(STEP, agent).await.unwrap().unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn repeated_config_is_ignored_even_when_nothing_was_built() {
    let config = NodeConfig::new("node01", "localhost")
        .with_device("bad", DeviceSpec::new("vendor.Missing"));
    let mut harness = Harness::start(config.clone()).await;
    let agent = tokio::spawn(harness.agent().run(std::future::pending()));

    harness.next().await; // ProvisionRequest
    let (_, complete) = harness.next().await;
    let NodeMessage::ProvisionComplete { devices, errors } = complete else {
        panic!("expected ProvisionComplete, got {complete:?}");
    };
    assert!(devices.is_empty());
    assert_eq!(errors.len(), 1);

    // A second config must not trigger a second build.
    harness
        .send(ControllerMessage::ProvisionResponse { config })
        .await;
    harness.send(ControllerMessage::Shutdown).await;
    let (_, next) = harness.next().await;
    assert_eq!(next, NodeMessage::ShutdownComplete);
    harness.drop_session();

    let result = tokio::time::timeout(STEP, agent).await.unwrap().unwrap();
    assert!(result.is_ok());
}

/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Controller startup, rollback and stop against in-process nodes.
//!
//! Two kinds of node are used: scripted fake nodes speaking the raw control
//! protocol, and real `rig_n` agents running on the test runtime.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rig_n::server::{DeviceServer, ServerOptions};
use rig_n::{DeviceGraphBuilder, DeviceRegistry, NodeAgent, NodeAgentOptions};
use rig_o::config::ControllerSettings;
use rig_o::{NodeLauncher, NodeProcess, RigController, RigError, RigState};
use rig_proto::rig_v1::control_client::ControlClient;
use rig_proto::{
    BuildErrorKind, ControllerMessage, DeviceSpec, DeviceType, NodeConfig, NodeMessage,
    ProvisionedDeviceAddress, SpecValue, NODE_ID_HEADER,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tonic::metadata::MetadataValue;
use tonic::Request;

const CONNECT: Duration = Duration::from_secs(2);
const PROVISION: Duration = Duration::from_secs(5);

type Log = Arc<Mutex<Vec<(String, &'static str)>>>;

fn kinds(log: &Log, node: &str) -> Vec<&'static str> {
    log.lock()
        .unwrap()
        .iter()
        .filter(|(n, _)| n == node)
        .map(|(_, k)| *k)
        .collect()
}

fn settings() -> ControllerSettings {
    ControllerSettings {
        bind: "127.0.0.1:0".parse().unwrap(),
        spawn_grace: Duration::from_millis(20),
        rollback_timeout: Duration::from_secs(2),
        stop_timeout: Duration::from_secs(2),
        terminate_timeout: Duration::from_secs(1),
        ..ControllerSettings::default()
    }
}

fn local(node_id: &str) -> NodeConfig {
    NodeConfig::new(node_id, "localhost")
}

// ── Task-backed node process ──────────────────────────────────────────────────

struct TaskProcess {
    node_id: String,
    cancel: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
    terminated: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl NodeProcess for TaskProcess {
    fn is_alive(&mut self) -> bool {
        !self.handle.is_finished()
    }

    fn terminate(&mut self) -> std::io::Result<()> {
        self.terminated.lock().unwrap().push(self.node_id.clone());
        match self.cancel.take() {
            Some(cancel) => {
                let _ = cancel.send(());
            }
            None => self.handle.abort(),
        }
        Ok(())
    }

    async fn join(&mut self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, &mut self.handle).await.is_ok()
    }

    fn kill(&mut self) -> std::io::Result<()> {
        self.handle.abort();
        Ok(())
    }
}

// ── Scripted fake nodes ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
struct Script {
    /// Reported in `ProvisionComplete`.
    devices: BTreeMap<String, ProvisionedDeviceAddress>,
    /// Never connects at all.
    absent: bool,
    /// Connects and asks, but never completes.
    silent: bool,
    /// Delay before the provision request.
    delay: Duration,
}

async fn run_fake_node(node_id: String, endpoint: String, script: Script, log: Log) {
    if script.absent {
        return std::future::pending().await;
    }
    let Ok(mut client) = ControlClient::connect(format!("http://{endpoint}")).await else {
        return;
    };

    let (tx, rx) = mpsc::channel(8);
    let mut request = Request::new(ReceiverStream::new(rx));
    request.metadata_mut().insert(
        NODE_ID_HEADER,
        MetadataValue::try_from(node_id.as_str()).unwrap(),
    );
    let Ok(response) = client.session(request).await else {
        return;
    };
    let mut inbound = response.into_inner();

    tokio::time::sleep(script.delay).await;
    let _ = tx.send(NodeMessage::ProvisionRequest).await;

    while let Ok(Some(msg)) = inbound.message().await {
        log.lock().unwrap().push((node_id.clone(), msg.kind()));
        match msg {
            ControllerMessage::ProvisionResponse { .. } if !script.silent => {
                let complete = NodeMessage::ProvisionComplete {
                    devices: script.devices.clone(),
                    errors: BTreeMap::new(),
                };
                let _ = tx.send(complete).await;
            }
            ControllerMessage::ProvisionResponse { .. } => {}
            ControllerMessage::Shutdown => {
                let _ = tx.send(NodeMessage::ShutdownComplete).await;
            }
        }
    }
}

#[derive(Default)]
struct FakeLauncher {
    scripts: HashMap<String, Script>,
    log: Log,
    terminated: Arc<Mutex<Vec<String>>>,
}

impl FakeLauncher {
    fn node(mut self, node_id: &str, script: Script) -> Self {
        self.scripts.insert(node_id.to_string(), script);
        self
    }
}

impl NodeLauncher for FakeLauncher {
    fn launch(
        &self,
        node_id: &str,
        controller_addr: &str,
        _start_port: u16,
    ) -> anyhow::Result<Box<dyn NodeProcess>> {
        let script = self.scripts.get(node_id).cloned().unwrap_or_default();
        let handle = tokio::spawn(run_fake_node(
            node_id.to_string(),
            controller_addr.to_string(),
            script,
            Arc::clone(&self.log),
        ));
        Ok(Box::new(TaskProcess {
            node_id: node_id.to_string(),
            cancel: None,
            handle,
            terminated: Arc::clone(&self.terminated),
        }))
    }
}

// ── Real agents ───────────────────────────────────────────────────────────────

#[derive(Default)]
struct AgentLauncher {
    terminated: Arc<Mutex<Vec<String>>>,
}

impl NodeLauncher for AgentLauncher {
    fn launch(
        &self,
        node_id: &str,
        controller_addr: &str,
        start_port: u16,
    ) -> anyhow::Result<Box<dyn NodeProcess>> {
        let mut options = NodeAgentOptions::new(node_id, controller_addr, start_port);
        options.heartbeat_interval = Duration::from_millis(50);
        let agent = NodeAgent::new(options, DeviceRegistry::with_builtin());

        let (cancel, cancelled) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let _ = agent
                .run(async {
                    let _ = cancelled.await;
                })
                .await;
        });
        Ok(Box::new(TaskProcess {
            node_id: node_id.to_string(),
            cancel: Some(cancel),
            handle,
            terminated: Arc::clone(&self.terminated),
        }))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn end_to_end_with_real_agents() {
    let mut nodes = BTreeMap::new();
    nodes.insert(
        "optics".to_string(),
        local("optics")
            .with_device("cam0", DeviceSpec::new("sim.Camera"))
            .with_device("laser0", DeviceSpec::new("sim.Laser"))
            .with_device("bad", DeviceSpec::new("vendor.Missing")),
    );
    nodes.insert(
        "motion".to_string(),
        local("motion")
            .with_device("stage", DeviceSpec::new("sim.Axis"))
            .with_device(
                "loop",
                DeviceSpec::new("sim.Generic").with_kwarg("peer", SpecValue::reference("loop")),
            ),
    );

    let launcher = Arc::new(AgentLauncher::default());
    let mut rig = RigController::new(nodes, settings(), launcher.clone());

    let report = rig.start(CONNECT, PROVISION).await.unwrap();
    assert_eq!(rig.state(), RigState::Ready);
    assert_eq!(report.total, 3);
    assert!(report.all_alive(), "{report:?}");
    assert_eq!(report.connected, ["cam0", "laser0", "stage"]);

    let expected: BTreeSet<String> = ["motion", "optics"].map(String::from).into();
    assert_eq!(rig.provisioned_nodes(), &expected);

    assert_eq!(rig.build_errors()["bad"].kind, BuildErrorKind::Import);
    assert_eq!(rig.build_errors()["loop"].kind, BuildErrorKind::Circular);
    assert!(rig.get_agent("bad").is_err());

    let cam = rig.get_agent("cam0").unwrap().as_camera().unwrap();
    cam.set_exposure_ms(20.0).await.unwrap();
    let frame = cam.snap().await.unwrap();
    assert_eq!(frame.exposure_ms, 20.0);

    let laser = rig.get_agent("laser0").unwrap().as_laser().unwrap();
    laser.set_power_mw(5.0).await.unwrap();
    assert_eq!(laser.power_mw().await.unwrap(), 5.0);

    let stage = rig.get_agent("stage").unwrap().as_axis().unwrap();
    assert_eq!(stage.move_abs(12.5).await.unwrap(), 12.5);

    rig.stop().await;
    assert_eq!(rig.state(), RigState::Stopped);
    assert!(rig.provisioned_nodes().is_empty());
    assert!(rig.get_agent("cam0").is_err());

    // Idempotent.
    rig.stop().await;
    assert_eq!(rig.state(), RigState::Stopped);
}

#[tokio::test]
async fn provisioning_waits_for_every_node() {
    let launcher = Arc::new(
        FakeLauncher::default()
            .node("a", Script::default())
            .node(
                "b",
                Script {
                    delay: Duration::from_millis(300),
                    ..Script::default()
                },
            ),
    );
    let mut nodes = BTreeMap::new();
    nodes.insert("a".to_string(), local("a"));
    nodes.insert("b".to_string(), local("b"));

    let mut rig = RigController::new(nodes, settings(), launcher.clone());
    let report = rig.start(CONNECT, PROVISION).await.unwrap();
    assert_eq!(report.total, 0);
    assert_eq!(rig.provisioned_nodes().len(), 2);
    assert_eq!(kinds(&launcher.log, "b"), ["provision_response"]);

    rig.stop().await;
    assert_eq!(kinds(&launcher.log, "a"), ["provision_response", "shutdown"]);
}

#[tokio::test]
async fn provisioning_timeout_rolls_back_provisioned_nodes() {
    let launcher = Arc::new(
        FakeLauncher::default()
            .node("a", Script::default())
            .node(
                "b",
                Script {
                    absent: true,
                    ..Script::default()
                },
            ),
    );
    let mut nodes = BTreeMap::new();
    nodes.insert("a".to_string(), local("a"));
    nodes.insert("b".to_string(), local("b"));

    let mut rig = RigController::new(nodes, settings(), launcher.clone());
    let err = rig
        .start(CONNECT, Duration::from_millis(500))
        .await
        .unwrap_err();

    match err {
        RigError::ProvisioningTimeout { missing, .. } => assert_eq!(missing, ["b"]),
        other => panic!("unexpected error: {other}"),
    }
    // Rollback happened before the error was returned.
    assert_eq!(kinds(&launcher.log, "a"), ["provision_response", "shutdown"]);
    let mut terminated = launcher.terminated.lock().unwrap().clone();
    terminated.sort();
    assert_eq!(terminated, ["a", "b"]);
    assert_eq!(rig.state(), RigState::Stopped);
    assert!(rig.control_endpoint().is_none());

    rig.stop().await;
}

#[tokio::test]
async fn silent_node_is_shut_down_during_rollback() {
    let launcher = Arc::new(FakeLauncher::default().node(
        "slow",
        Script {
            silent: true,
            ..Script::default()
        },
    ));
    let mut nodes = BTreeMap::new();
    nodes.insert("slow".to_string(), local("slow"));

    let mut rig = RigController::new(nodes, settings(), launcher.clone());
    let err = rig
        .start(CONNECT, Duration::from_millis(300))
        .await
        .unwrap_err();
    assert!(matches!(err, RigError::ProvisioningTimeout { .. }));
    assert_eq!(kinds(&launcher.log, "slow"), ["provision_response", "shutdown"]);
}

#[tokio::test]
async fn stop_is_safe_in_any_state() {
    let mut never_started =
        RigController::new(BTreeMap::new(), settings(), Arc::new(FakeLauncher::default()));
    never_started.stop().await;
    never_started.stop().await;
    assert_eq!(never_started.state(), RigState::Stopped);

    let mut nodes = BTreeMap::new();
    nodes.insert("a".to_string(), local("a"));
    let mut rig = RigController::new(nodes, settings(), Arc::new(FakeLauncher::default()));
    rig.start(CONNECT, PROVISION).await.unwrap();
    rig.stop().await;
    rig.stop().await;
    assert_eq!(rig.state(), RigState::Stopped);
}

#[tokio::test]
async fn liveness_failures_are_reported_not_fatal() {
    // Two real device servers plus one address nobody listens on.
    let registry = DeviceRegistry::with_builtin();
    let bench = local("bench")
        .with_device("cam0", DeviceSpec::new("sim.Camera"))
        .with_device("daq0", DeviceSpec::new("sim.Daq"));
    let outcome = DeviceGraphBuilder::new(&registry).build(&bench);
    assert!(outcome.errors.is_empty());

    let options = ServerOptions {
        advertise_host: "127.0.0.1".into(),
        bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        rpc_port: 0,
        pub_port: 0,
        heartbeat_interval: Duration::from_millis(50),
    };
    let mut servers = Vec::new();
    let mut devices = BTreeMap::new();
    for (uid, built) in outcome.built {
        let server = DeviceServer::start(&uid, built, &options).await.unwrap();
        devices.insert(uid, server.address().clone());
        servers.push(server);
    }

    let dead_port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    devices.insert(
        "ghost".to_string(),
        ProvisionedDeviceAddress {
            uid: "ghost".into(),
            host: "127.0.0.1".into(),
            rpc_port: dead_port,
            pub_port: dead_port,
            device_type: DeviceType::Generic,
        },
    );

    let launcher = Arc::new(FakeLauncher::default().node(
        "bench",
        Script {
            devices,
            ..Script::default()
        },
    ));
    let mut nodes = BTreeMap::new();
    nodes.insert("bench".to_string(), bench);

    let mut rig = RigController::new(nodes, settings(), launcher);
    let report = rig.start(Duration::from_secs(1), PROVISION).await.unwrap();

    assert_eq!(rig.state(), RigState::Ready);
    assert_eq!(report.total, 3);
    assert_eq!(report.failed_count(), 1);
    assert!(report.failed.contains_key("ghost"));
    assert_eq!(report.connected, ["cam0", "daq0"]);
    assert_eq!(rig.liveness_report(), Some(&report));

    rig.stop().await;
    for server in &mut servers {
        server.close().await;
    }
}

#[tokio::test]
async fn unknown_node_is_ignored() {
    let launcher = Arc::new(FakeLauncher::default().node(
        "a",
        Script {
            delay: Duration::from_millis(300),
            ..Script::default()
        },
    ));
    let mut nodes = BTreeMap::new();
    nodes.insert("a".to_string(), local("a"));

    let mut rig = RigController::new(nodes, settings(), launcher.clone());
    let endpoint = rig.bind().await.unwrap();

    let intruder_log = Log::default();
    let intruder = tokio::spawn(run_fake_node(
        "intruder".to_string(),
        endpoint,
        Script::default(),
        Arc::clone(&intruder_log),
    ));

    rig.start(CONNECT, PROVISION).await.unwrap();
    assert_eq!(rig.provisioned_nodes().len(), 1);
    assert!(rig.provisioned_nodes().contains("a"));
    assert!(kinds(&intruder_log, "intruder").is_empty());

    rig.stop().await;
    intruder.abort();
}

/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};

use rig_o::config::RigConfigManager;
use rig_o::{ProcessLauncher, RigController};

// ── CLI argument definition ───────────────────────────────────────────────────

/// Rig controller.
///
/// Example:
///   rig-o --config rig.yaml --connection-timeout-s 5 --provision-timeout-s 30
#[derive(Debug, Parser)]
#[command(
    name = "rig-o",
    about = "Rig-O controller – provisions device nodes and connects to their devices",
    long_about = None,
)]
struct Cli {
    /// Path to the YAML rig configuration file.
    #[arg(short = 'c', long = "config")]
    config: PathBuf,

    /// Wait for the first heartbeat of every device, in seconds.
    #[arg(long = "connection-timeout-s", default_value_t = 5.0)]
    connection_timeout_s: f64,

    /// Wait for every node to report provisioning complete, in seconds.
    #[arg(long = "provision-timeout-s", default_value_t = 30.0)]
    provision_timeout_s: f64,

    /// Node binary for local nodes; overrides `controller.node_binary`.
    #[arg(long = "node-binary")]
    node_binary: Option<PathBuf>,

    /// Heartbeat period passed to every local node, in milliseconds.
    #[arg(long = "node-heartbeat-ms")]
    node_heartbeat_ms: Option<u64>,
}

fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    // Level is controlled by the RUST_LOG env-var (e.g. RUST_LOG=debug).
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Rig-O starting up...");

    // ── Parse CLI arguments ───────────────────────────────────────────────────
    let cli = Cli::parse();

    info!(
        config              = %cli.config.display(),
        connection_timeout  = cli.connection_timeout_s,
        provision_timeout   = cli.provision_timeout_s,
        node_binary         = ?cli.node_binary,
        node_heartbeat_ms   = ?cli.node_heartbeat_ms,
        "Configuration"
    );

    // ── Load rig configuration ────────────────────────────────────────────────
    let mut config = RigConfigManager::new();
    if let Err(e) = config.load_from_file(&cli.config) {
        error!("Failed to load rig configuration: {:#}", e);
        process::exit(1);
    }

    let nodes = config.get_all_nodes();
    info!("Loaded {} node(s), {} device(s):", nodes.len(), config.device_count());
    for (node_id, node) in nodes {
        info!(
            "  [{node_id}]  host={host}  start_port={port}  devices={devices:?}",
            host = node.hostname,
            port = node.start_port,
            devices = node.devices.keys().collect::<Vec<_>>(),
        );
    }

    // ── Launcher ──────────────────────────────────────────────────────────────
    let binary = cli
        .node_binary
        .clone()
        .unwrap_or_else(|| config.settings().node_binary.clone());
    let mut launcher = ProcessLauncher::new(binary);
    if let Some(ms) = cli.node_heartbeat_ms {
        launcher = launcher.with_args(["--heartbeat-ms".to_string(), ms.to_string()]);
    }

    // ── Start the rig ─────────────────────────────────────────────────────────
    let mut rig = RigController::from_config(config, Arc::new(launcher));

    let report = match rig
        .start(
            seconds(cli.connection_timeout_s),
            seconds(cli.provision_timeout_s),
        )
        .await
    {
        Ok(report) => report,
        Err(e) => {
            error!("Rig startup failed: {:#}", e);
            rig.stop().await;
            process::exit(1);
        }
    };

    for (uid, err) in rig.build_errors() {
        warn!("  ✗ {uid}: {} ({})", err.message, err.kind);
    }
    for (uid, client) in rig.agents() {
        let status = if report.failed.contains_key(uid) { "silent" } else { "alive" };
        info!(
            "  ✓ {uid}  type={ty}  rpc={rpc}  pub={publ}  [{status}]",
            ty = client.device_type(),
            rpc = client.address().rpc_endpoint(),
            publ = client.address().pub_endpoint(),
        );
    }
    info!("Rig ready ({report}); press Ctrl-C to stop");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to wait for Ctrl-C: {e}");
    }

    info!("Stopping rig...");
    rig.stop().await;
}

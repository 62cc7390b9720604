/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

use std::process;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use rig_n::{DeviceRegistry, NodeAgent, NodeAgentOptions};

// ── CLI argument definition ───────────────────────────────────────────────────

/// Rig node agent.
///
/// Normally launched by the controller, once per node:
///   rig-n node01 127.0.0.1:5555 6000
#[derive(Debug, Parser)]
#[command(
    name = "rig-n",
    about = "Rig node agent – builds and serves the devices of one node",
    long_about = None,
)]
struct Cli {
    /// Node identifier; must match a key of the controller's `nodes` table.
    node_id: String,

    /// Controller control-channel address (`host:port` or `http://host:port`).
    controller_addr: String,

    /// First device port.  0 lets the OS pick every port.
    start_port: u16,

    /// Heartbeat period of every device publisher, in milliseconds.
    #[arg(long = "heartbeat-ms", default_value_t = 1000)]
    heartbeat_ms: u64,

    /// Connection attempts before giving up on the controller.
    #[arg(long = "connect-attempts", default_value_t = 10)]
    connect_attempts: u32,
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

    let cli = Cli::parse();

    info!(
        node_id          = %cli.node_id,
        controller       = %cli.controller_addr,
        start_port       = cli.start_port,
        heartbeat_ms     = cli.heartbeat_ms,
        connect_attempts = cli.connect_attempts,
        "Configuration"
    );

    let mut options = NodeAgentOptions::new(cli.node_id, cli.controller_addr, cli.start_port);
    options.heartbeat_interval = Duration::from_millis(cli.heartbeat_ms.max(1));
    options.connect_attempts = cli.connect_attempts;

    let agent = NodeAgent::new(options, DeviceRegistry::with_builtin());
    if let Err(e) = agent.run(shutdown_signal()).await {
        error!("Node agent failed: {:#}", e);
        process::exit(1);
    }
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

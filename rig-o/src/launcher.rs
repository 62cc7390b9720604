/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Local node processes.
//!
//! The controller never runs device code itself.  For every node whose
//! hostname is local it asks a [`NodeLauncher`] for a process, passing the
//! node's entry point arguments `(node_id, controller_addr, start_port)`.
//! Remote nodes are expected to be started by other means.
//!
//! [`ProcessLauncher`] runs the `rig-n` binary.  Tests plug in launchers that
//! run the node in-process instead.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

// ── Traits ────────────────────────────────────────────────────────────────────

/// Handle on one running node.
#[async_trait]
pub trait NodeProcess: Send {
    fn is_alive(&mut self) -> bool;

    /// Ask the node to exit (SIGTERM for OS processes).
    fn terminate(&mut self) -> std::io::Result<()>;

    /// Wait up to `timeout` for the node to exit.  `true` if it did.
    async fn join(&mut self, timeout: Duration) -> bool;

    /// Stop the node without letting it clean up.
    fn kill(&mut self) -> std::io::Result<()>;
}

pub trait NodeLauncher: Send + Sync {
    fn launch(
        &self,
        node_id: &str,
        controller_addr: &str,
        start_port: u16,
    ) -> Result<Box<dyn NodeProcess>>;
}

/// Terminate → bounded join → kill.  Never fails; problems are logged.
pub async fn terminate_process(node_id: &str, process: &mut dyn NodeProcess, grace: Duration) {
    if !process.is_alive() {
        debug!(node = %node_id, "Node process already exited");
        return;
    }

    if let Err(e) = process.terminate() {
        warn!(node = %node_id, "Failed to signal node process: {e}");
    }
    if process.join(grace).await {
        debug!(node = %node_id, "Node process exited after terminate");
        return;
    }

    warn!(node = %node_id, "Node process ignored terminate, killing");
    if let Err(e) = process.kill() {
        warn!(node = %node_id, "Failed to kill node process: {e}");
    }
    if !process.join(grace).await {
        warn!(node = %node_id, "Node process still alive after kill");
    }
}

// ── ProcessLauncher ───────────────────────────────────────────────────────────

/// Starts nodes as `<binary> <node_id> <controller_addr> <start_port>`.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    binary: PathBuf,
    extra_args: Vec<String>,
}

impl ProcessLauncher {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            extra_args: Vec::new(),
        }
    }

    /// Arguments appended after the positional ones (e.g. `--heartbeat-ms`).
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn binary(&self) -> &PathBuf {
        &self.binary
    }
}

impl NodeLauncher for ProcessLauncher {
    fn launch(
        &self,
        node_id: &str,
        controller_addr: &str,
        start_port: u16,
    ) -> Result<Box<dyn NodeProcess>> {
        let child = Command::new(&self.binary)
            .arg(node_id)
            .arg(controller_addr)
            .arg(start_port.to_string())
            .args(&self.extra_args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| {
                format!(
                    "Failed to spawn node '{node_id}' with {}",
                    self.binary.display()
                )
            })?;

        info!(node = %node_id, pid = ?child.id(), "Spawned node process");
        Ok(Box::new(ChildProcess { child }))
    }
}

struct ChildProcess {
    child: Child,
}

#[async_trait]
impl NodeProcess for ChildProcess {
    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> std::io::Result<()> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.child.id() else {
            return Ok(()); // already reaped
        };
        let pid = i32::try_from(pid).map_err(std::io::Error::other)?;
        kill(Pid::from_raw(pid), Signal::SIGTERM).map_err(std::io::Error::from)
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> std::io::Result<()> {
        self.child.start_kill()
    }

    async fn join(&mut self, timeout: Duration) -> bool {
        matches!(
            tokio::time::timeout(timeout, self.child.wait()).await,
            Ok(Ok(_))
        )
    }

    fn kill(&mut self) -> std::io::Result<()> {
        self.child.start_kill()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_binary_is_a_launch_error() {
        let launcher = ProcessLauncher::new("/nonexistent/rig-n");
        assert!(launcher.launch("node01", "127.0.0.1:5555", 0).is_err());
    }

    #[tokio::test]
    async fn terminate_stops_a_sleeping_process() {
        let mut process: Box<dyn NodeProcess> = Box::new(ChildProcess {
            child: Command::new("sleep").arg("30").kill_on_drop(true).spawn().unwrap(),
        });

        assert!(process.is_alive());
        terminate_process("node01", process.as_mut(), Duration::from_secs(2)).await;
        assert!(!process.is_alive());
    }

    #[tokio::test]
    async fn exited_process_is_left_alone() {
        let mut process: Box<dyn NodeProcess> = Box::new(ChildProcess {
            child: Command::new("/bin/sh").args(["-c", "exit 0"]).spawn().unwrap(),
        });
        assert!(process.join(Duration::from_secs(2)).await);
        assert!(!process.is_alive());
        terminate_process("node01", process.as_mut(), Duration::from_millis(10)).await;
    }
}

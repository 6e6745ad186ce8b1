//! `ShellExecutor` — runs a node's `cmd` through the platform shell.
//!
//! The command line comes from `config.cmd`; `config.cwd` optionally sets the
//! working directory. Exit status 0 is success, anything else is a fatal
//! failure. On cancellation the child process is killed.

use std::process::Stdio;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::{NodeContext, NodeError, NodeExecutor};

#[derive(Debug, Clone, Default)]
pub struct ShellExecutor;

impl ShellExecutor {
    pub fn new() -> Self {
        Self
    }
}

fn shell_command(cmd: &str) -> Command {
    if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(cmd);
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c").arg(cmd);
        c
    }
}

#[async_trait]
impl NodeExecutor for ShellExecutor {
    async fn execute_node(&self, ctx: &NodeContext) -> Result<Value, NodeError> {
        let cmd = ctx
            .config
            .get("cmd")
            .and_then(Value::as_str)
            .ok_or_else(|| NodeError::Fatal(format!("node '{}' has no `cmd` string", ctx.node_id)))?;

        info!(node = %ctx.node_id, attempt = ctx.attempt, cmd, "starting shell node");

        let mut command = shell_command(cmd);
        if let Some(cwd) = ctx.config.get("cwd").and_then(Value::as_str) {
            command.current_dir(cwd);
        }
        command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command
            .spawn()
            .map_err(|e| NodeError::Retryable(format!("spawning '{cmd}': {e}")))?;

        // Dropping the `wait_with_output` future on cancellation kills the
        // child thanks to `kill_on_drop(true)`.
        let output = tokio::select! {
            res = child.wait_with_output() => {
                res.map_err(|e| NodeError::Fatal(format!("waiting for '{cmd}': {e}")))?
            }
            _ = ctx.cancel.cancelled() => {
                warn!(node = %ctx.node_id, "cancellation requested; killing shell process");
                return Err(NodeError::Cancelled);
            }
        };

        let code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
        debug!(node = %ctx.node_id, exit_code = code, "shell process exited");

        if output.status.success() {
            Ok(json!({ "exit_code": code, "stdout": stdout }))
        } else {
            Err(NodeError::Fatal(format!("exit code {code}: {stderr}")))
        }
    }
}

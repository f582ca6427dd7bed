//! Hook execution
//!
//! A [`HookRunner`] executes one stage's hook on one host. Every fault is
//! reported as data in the returned [`StageResult`]; nothing here returns an
//! error to the caller.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::models::deployment::{
    HookFault, Phase, StageResult, EXIT_LAUNCH_FAILURE, EXIT_SIGNALED, EXIT_TIMEOUT,
    EXIT_UNREACHABLE,
};
use crate::models::host::{HostSpec, HostTransport};
use crate::utils::{shell_quote, truncate_output};

/// Everything a runner needs to execute one hook
#[derive(Debug, Clone)]
pub struct HookInvocation {
    pub deployment_id: String,
    pub phase: Phase,
    pub stage_name: String,
    pub position: usize,
    pub command: String,
    pub env: BTreeMap<String, String>,
    pub max_output_bytes: usize,
}

/// Raw result of a hook process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookOutput {
    pub exit_code: i32,
    pub output: String,
    pub fault: Option<HookFault>,
}

impl HookOutput {
    pub fn from_exit(exit_code: i32, output: impl Into<String>) -> Self {
        Self {
            exit_code,
            output: output.into(),
            fault: (exit_code != 0).then_some(HookFault::ScriptFailure),
        }
    }

    pub fn fault(exit_code: i32, fault: HookFault, output: impl Into<String>) -> Self {
        Self {
            exit_code,
            output: output.into(),
            fault: Some(fault),
        }
    }
}

/// Hook runner trait
#[async_trait]
pub trait HookRunner: Send + Sync {
    /// Execute the hook without a deadline
    async fn execute(&self, host: &HostSpec, invocation: &HookInvocation) -> HookOutput;

    /// Execute the hook within `timeout` and record the result
    async fn run(
        &self,
        host: &HostSpec,
        invocation: &HookInvocation,
        timeout: Duration,
    ) -> StageResult {
        let started_at = Utc::now();

        let output = match tokio::time::timeout(timeout, self.execute(host, invocation)).await {
            Ok(output) => output,
            Err(_) => {
                warn!(
                    "Hook {} timed out on {} after {:?}",
                    invocation.stage_name, host.id, timeout
                );
                HookOutput::fault(
                    EXIT_TIMEOUT,
                    HookFault::Timeout,
                    format!("timed out after {}ms", timeout.as_millis()),
                )
            }
        };

        StageResult {
            stage_name: invocation.stage_name.clone(),
            position: invocation.position,
            exit_code: output.exit_code,
            started_at,
            finished_at: Utc::now(),
            output: truncate_output(&output.output, invocation.max_output_bytes),
            fault: output.fault,
        }
    }
}

/// Runs hooks through a local shell or `ssh`
#[derive(Debug, Clone)]
pub struct ShellHookRunner {
    shell: String,
    ssh_connect_timeout: Duration,
}

impl ShellHookRunner {
    pub fn new(shell: impl Into<String>, ssh_connect_timeout: Duration) -> Self {
        Self {
            shell: shell.into(),
            ssh_connect_timeout,
        }
    }

    fn local_command(&self, invocation: &HookInvocation) -> Command {
        let mut cmd = Command::new(&self.shell);
        cmd.args(["-c", invocation.command.as_str()])
            .envs(&invocation.env);
        cmd
    }

    fn ssh_command(
        &self,
        invocation: &HookInvocation,
        address: &str,
        port: u16,
        user: Option<&str>,
        identity_file: Option<&str>,
    ) -> Command {
        let mut cmd = Command::new("ssh");

        if let Some(identity_file) = identity_file {
            cmd.args(["-i", identity_file]);
        }
        if port != 22 {
            let port = port.to_string();
            cmd.args(["-p", port.as_str()]);
        }
        let connect_timeout = format!(
            "ConnectTimeout={}",
            self.ssh_connect_timeout.as_secs().max(1)
        );
        cmd.args([
            "-o",
            "BatchMode=yes",
            "-o",
            connect_timeout.as_str(),
            "-o",
            "ServerAliveInterval=15",
            "-o",
            "ServerAliveCountMax=3",
        ]);

        let destination = match user {
            Some(user) => format!("{}@{}", user, address),
            None => address.to_string(),
        };
        cmd.arg(destination).arg(remote_command_line(&self.shell, invocation));
        cmd
    }
}

impl Default for ShellHookRunner {
    fn default() -> Self {
        Self::new("sh", Duration::from_secs(10))
    }
}

#[async_trait]
impl HookRunner for ShellHookRunner {
    async fn execute(&self, host: &HostSpec, invocation: &HookInvocation) -> HookOutput {
        let (mut cmd, remote) = match &host.transport {
            HostTransport::Local => (self.local_command(invocation), false),
            HostTransport::Ssh {
                address,
                port,
                user,
                identity_file,
            } => (
                self.ssh_command(
                    invocation,
                    address,
                    *port,
                    user.as_deref(),
                    identity_file.as_deref(),
                ),
                true,
            ),
        };

        debug!(
            "Running {} hook {} on {}: {}",
            invocation.phase.as_str(),
            invocation.stage_name,
            host.id,
            invocation.command
        );

        let output = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await;

        let output = match output {
            Ok(output) => output,
            Err(e) => {
                return HookOutput::fault(
                    EXIT_LAUNCH_FAILURE,
                    HookFault::Launch,
                    format!("failed to launch hook: {}", e),
                );
            }
        };

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&stderr);
        }

        match output.status.code() {
            Some(EXIT_UNREACHABLE) if remote => {
                HookOutput::fault(EXIT_UNREACHABLE, HookFault::Unreachable, text)
            }
            Some(code) => HookOutput::from_exit(code, text),
            None => HookOutput::fault(EXIT_SIGNALED, HookFault::ScriptFailure, text),
        }
    }
}

/// Command line executed by the remote shell, with the environment passed as
/// `env` assignments since ssh does not forward arbitrary variables.
fn remote_command_line(shell: &str, invocation: &HookInvocation) -> String {
    let mut line = String::from("env");
    for (key, value) in &invocation.env {
        line.push(' ');
        line.push_str(&shell_quote(&format!("{}={}", key, value)));
    }
    line.push(' ');
    line.push_str(&shell_quote(shell));
    line.push_str(" -c ");
    line.push_str(&shell_quote(&invocation.command));
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation(command: &str) -> HookInvocation {
        HookInvocation {
            deployment_id: "d-1".to_string(),
            phase: Phase::Deploy,
            stage_name: "install".to_string(),
            position: 0,
            command: command.to_string(),
            env: BTreeMap::from([("FLEETPIPE_STAGE".to_string(), "install".to_string())]),
            max_output_bytes: 1024,
        }
    }

    #[test]
    fn test_remote_command_line_quotes_env() {
        let mut inv = invocation("echo \"$FLEETPIPE_STAGE\"");
        inv.env.insert("NOTE".to_string(), "it's fine".to_string());

        let line = remote_command_line("sh", &inv);
        assert_eq!(
            line,
            "env FLEETPIPE_STAGE=install 'NOTE=it'\\''s fine' sh -c 'echo \"$FLEETPIPE_STAGE\"'"
        );
    }

    #[test]
    fn test_hook_output_from_exit() {
        assert_eq!(HookOutput::from_exit(0, "").fault, None);
        assert_eq!(
            HookOutput::from_exit(2, "").fault,
            Some(HookFault::ScriptFailure)
        );
    }
}

//! Deployment target handle

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::debug;

use crate::deploy::hook_runner::{HookInvocation, HookRunner};
use crate::models::deployment::{HookFault, StageResult, EXIT_UNREACHABLE};
use crate::models::host::{HostSpec, HostTransport};

/// One deployment target bound to a hook runner
pub struct HostAgent {
    spec: HostSpec,
    runner: Arc<dyn HookRunner>,
    probe_timeout: Duration,
}

impl HostAgent {
    pub fn new(spec: HostSpec, runner: Arc<dyn HookRunner>, probe_timeout: Duration) -> Self {
        Self {
            spec,
            runner,
            probe_timeout,
        }
    }

    /// Run one stage's hook on this host
    pub async fn execute_stage(&self, invocation: &HookInvocation, timeout: Duration) -> StageResult {
        self.runner.run(&self.spec, invocation, timeout).await
    }

    /// Cheap liveness check done before dispatch.
    ///
    /// Local hosts are always reachable; SSH hosts must accept a TCP
    /// connection on their SSH port within the probe timeout.
    pub async fn is_reachable(&self) -> bool {
        match &self.spec.transport {
            HostTransport::Local => true,
            HostTransport::Ssh { address, port, .. } => {
                let probe = TcpStream::connect((address.as_str(), *port));
                let reachable = matches!(
                    tokio::time::timeout(self.probe_timeout, probe).await,
                    Ok(Ok(_))
                );
                debug!("Probe {}:{} reachable={}", address, port, reachable);
                reachable
            }
        }
    }

    /// Result recorded in place of running the hook on a dead host
    pub fn unreachable_result(&self, invocation: &HookInvocation) -> StageResult {
        StageResult::synthesized(
            &invocation.stage_name,
            invocation.position,
            EXIT_UNREACHABLE,
            HookFault::Unreachable,
            format!("host {} unreachable before dispatch", self.spec.id),
        )
    }
}

impl std::fmt::Debug for HostAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostAgent")
            .field("spec", &self.spec)
            .field("probe_timeout", &self.probe_timeout)
            .finish()
    }
}

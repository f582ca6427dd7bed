//! Stage fan-out and barrier
//!
//! One task is spawned per eligible host. The stage is complete only when
//! every spawned task has returned (its own timeout bounds it), so no stage
//! can start before the previous one's barrier closes.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, error, info};

use crate::deploy::host_agent::HostAgent;
use crate::deploy::hook_runner::HookInvocation;
use crate::models::deployment::{
    Deployment, HookFault, Phase, StageResult, EXIT_INTERNAL, EXIT_UNREACHABLE,
};
use crate::models::hook::HookStage;
use crate::models::host::HostId;
use crate::utils::env_key;

/// Runs one stage across hosts
#[derive(Debug, Clone)]
pub struct StageExecutor {
    default_timeout: Duration,
    max_output_bytes: usize,
}

impl StageExecutor {
    pub fn new(default_timeout: Duration, max_output_bytes: usize) -> Self {
        Self {
            default_timeout,
            max_output_bytes,
        }
    }

    /// Dispatch `stage` to every eligible host of `deployment` and wait for all.
    ///
    /// Hosts that are not eligible (failed, halted, or already past this
    /// stage) get no entry in the returned map.
    pub async fn run(
        &self,
        phase: Phase,
        position: usize,
        stage: &HookStage,
        deployment: &Deployment,
        agents: &BTreeMap<HostId, Arc<HostAgent>>,
        base_env: &BTreeMap<String, String>,
    ) -> BTreeMap<HostId, StageResult> {
        let eligible = deployment.eligible_hosts(phase, position);
        let timeout = stage.timeout(self.default_timeout);

        info!(
            "Deployment {}: dispatching {} stage {} ({}) to {} host(s)",
            deployment.id,
            phase.as_str(),
            position,
            stage.name,
            eligible.len()
        );

        let mut host_ids = Vec::with_capacity(eligible.len());
        let mut tasks = Vec::with_capacity(eligible.len());

        for host_id in eligible {
            let invocation = self.invocation(phase, position, stage, deployment, &host_id, base_env);
            let agent = agents.get(&host_id).cloned();

            tasks.push(tokio::spawn(async move {
                let Some(agent) = agent else {
                    return StageResult::synthesized(
                        &invocation.stage_name,
                        invocation.position,
                        EXIT_UNREACHABLE,
                        HookFault::Unreachable,
                        "host is not provisioned",
                    );
                };

                if !agent.is_reachable().await {
                    return agent.unreachable_result(&invocation);
                }
                agent.execute_stage(&invocation, timeout).await
            }));
            host_ids.push(host_id);
        }

        // barrier
        let joined = join_all(tasks).await;

        let mut results = BTreeMap::new();
        for (host_id, joined) in host_ids.into_iter().zip(joined) {
            let result = match joined {
                Ok(result) => result,
                Err(e) => {
                    error!("Host task for {} crashed: {}", host_id, e);
                    StageResult::synthesized(
                        &stage.name,
                        position,
                        EXIT_INTERNAL,
                        HookFault::Launch,
                        format!("host task crashed: {}", e),
                    )
                }
            };
            debug!(
                "Deployment {}: {} on {} exited {}",
                deployment.id, stage.name, host_id, result.exit_code
            );
            results.insert(host_id, result);
        }

        results
    }

    fn invocation(
        &self,
        phase: Phase,
        position: usize,
        stage: &HookStage,
        deployment: &Deployment,
        host_id: &str,
        base_env: &BTreeMap<String, String>,
    ) -> HookInvocation {
        let mut env = base_env.clone();
        env.insert("FLEETPIPE_DEPLOYMENT_ID".to_string(), deployment.id.clone());
        env.insert("FLEETPIPE_HOST_ID".to_string(), host_id.to_string());
        env.insert("FLEETPIPE_STAGE".to_string(), stage.name.clone());
        env.insert("FLEETPIPE_STAGE_POSITION".to_string(), position.to_string());
        env.insert("FLEETPIPE_PHASE".to_string(), phase.as_str().to_string());

        if let Some(outcome) = deployment.outcome(host_id) {
            for (name, output) in outcome.stage_outputs() {
                env.insert(format!("FLEETPIPE_OUTPUT_{}", env_key(name)), output.to_string());
            }
        }

        HookInvocation {
            deployment_id: deployment.id.clone(),
            phase,
            stage_name: stage.name.clone(),
            position,
            command: stage.command.clone(),
            env,
            max_output_bytes: self.max_output_bytes,
        }
    }
}

impl Default for StageExecutor {
    fn default() -> Self {
        Self::new(Duration::from_secs(300), 8192)
    }
}

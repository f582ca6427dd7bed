//! Deployment controller
//!
//! Owns the stage sequence of every deployment: validates requests, runs
//! forward stages strictly in order through the [`StageExecutor`], applies
//! the halt policy after each barrier, and runs rollback for failed
//! deployments. Each deployment runs in its own task with its own record, so
//! several deployments can be in flight at once.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::deploy::fsm::{DeploymentEvent, DeploymentStatus};
use crate::deploy::host_agent::HostAgent;
use crate::deploy::hook_runner::HookRunner;
use crate::deploy::stage_executor::StageExecutor;
use crate::errors::PipelineError;
use crate::models::artifact::{ArtifactResolver, ResolvedArtifact};
use crate::models::deployment::{
    Deployment, DeploymentId, DeploymentRequest, HaltPolicy, HookScriptRef, HostState, Phase,
    RollbackRecord,
};
use crate::models::hook::HookScript;
use crate::models::host::{HostId, HostProvider};
use crate::storage::store::DeploymentStore;
use crate::utils::generate_uuid;

/// Controller settings
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Timeout for stages that do not set one
    pub default_stage_timeout: Duration,

    /// Bound on captured hook output
    pub max_output_bytes: usize,

    /// Reachability probe timeout
    pub probe_timeout: Duration,

    /// Hook scripts by deployment type
    pub hook_scripts: BTreeMap<String, HookScript>,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            default_stage_timeout: Duration::from_secs(300),
            max_output_bytes: 8192,
            probe_timeout: Duration::from_secs(2),
            hook_scripts: BTreeMap::new(),
        }
    }
}

struct ActiveRun {
    abort: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

/// Deployment controller
pub struct DeploymentController {
    store: Arc<dyn DeploymentStore>,
    hosts: Arc<dyn HostProvider>,
    artifacts: Arc<dyn ArtifactResolver>,
    runner: Arc<dyn HookRunner>,
    hook_scripts: BTreeMap<String, HookScript>,
    executor: StageExecutor,
    probe_timeout: Duration,
    runs: Mutex<HashMap<DeploymentId, ActiveRun>>,
}

impl DeploymentController {
    /// Create a new controller
    pub fn new(
        options: ControllerOptions,
        store: Arc<dyn DeploymentStore>,
        hosts: Arc<dyn HostProvider>,
        artifacts: Arc<dyn ArtifactResolver>,
        runner: Arc<dyn HookRunner>,
    ) -> Self {
        Self {
            store,
            hosts,
            artifacts,
            runner,
            hook_scripts: options.hook_scripts,
            executor: StageExecutor::new(options.default_stage_timeout, options.max_output_bytes),
            probe_timeout: options.probe_timeout,
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// Validate and accept a deployment, then start it in the background.
    ///
    /// Validation errors are returned here and the request never enters the
    /// state machine.
    pub async fn submit(self: &Arc<Self>, request: DeploymentRequest) -> Result<DeploymentId, PipelineError> {
        let hook_script = self.resolve_hook_script(&request.hook_script)?;
        hook_script.validate()?;
        let target_hosts = self.validate_hosts(&request.hosts)?;
        let resolved = self.artifacts.resolve(&request.artifact).await?;

        let mut deployment = Deployment::new(
            generate_uuid(),
            request.artifact,
            target_hosts,
            hook_script,
            request.halt_policy,
        );

        // Registered before the first save so an abort can never miss the run.
        let Some(abort) = self.register(&deployment.id) else {
            return Err(PipelineError::Internal(format!(
                "deployment id {} already in use",
                deployment.id
            )));
        };
        if let Err(e) = self.accept(&mut deployment).await {
            self.unregister(&deployment.id);
            return Err(e);
        }

        info!(
            "Accepted deployment {} of {} {} onto {} host(s) ({:?}), stages: {}",
            deployment.id,
            deployment.artifact.location,
            deployment.artifact.version,
            deployment.target_hosts.len(),
            deployment.halt_policy,
            deployment.hook_script.stage_names().join(", ")
        );

        let id = deployment.id.clone();
        self.spawn_run(deployment, resolved, abort);
        Ok(id)
    }

    async fn accept(&self, deployment: &mut Deployment) -> Result<(), PipelineError> {
        self.store.save(deployment).await?;
        deployment.lifecycle.process(DeploymentEvent::Accept)?;
        deployment.touch();
        self.store.save(deployment).await
    }

    /// Latest persisted snapshot
    pub async fn status(&self, id: &str) -> Result<Deployment, PipelineError> {
        self.store
            .load(id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("deployment {}", id)))
    }

    /// All persisted deployments, oldest first
    pub async fn list(&self) -> Result<Vec<Deployment>, PipelineError> {
        self.store.list().await
    }

    /// Request cancellation.
    ///
    /// Hooks already dispatched are allowed to finish; no further stage is
    /// dispatched, the deployment fails and rollback runs.
    pub async fn abort(&self, id: &str) -> Result<(), PipelineError> {
        let mut deployment = self.status(id).await?;
        if deployment.status() != DeploymentStatus::InProgress {
            return Err(PipelineError::InvalidTransition(format!(
                "deployment {} is {:?}, cannot abort",
                id,
                deployment.status()
            )));
        }

        {
            let runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(run) = runs.get(id) {
                run.abort.store(true, Ordering::SeqCst);
                info!("Abort requested for deployment {}", id);
                return Ok(());
            }
        }

        // Not running in this process; the flag is honoured on resume.
        deployment.abort_requested = true;
        deployment.touch();
        self.store.save(&deployment).await?;

        // A resume may have registered the run while the record was saved.
        if let Some(run) = self.runs.lock().unwrap_or_else(|e| e.into_inner()).get(id) {
            run.abort.store(true, Ordering::SeqCst);
        }
        info!("Abort recorded for idle deployment {}", id);
        Ok(())
    }

    /// Wait for the background run of a deployment, then return its snapshot
    pub async fn wait(&self, id: &str) -> Result<Deployment, PipelineError> {
        let handle = {
            let mut runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
            runs.get_mut(id).and_then(|run| run.handle.take())
        };

        if let Some(handle) = handle {
            handle
                .await
                .map_err(|e| PipelineError::Internal(format!("deployment task failed: {}", e)))?;
        }

        self.status(id).await
    }

    /// Number of deployments currently running in this process
    pub fn active_count(&self) -> usize {
        self.runs.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Continue every deployment left unfinished by a previous process.
    ///
    /// Each host restarts at its first stage without a recorded result.
    pub async fn resume_incomplete(self: &Arc<Self>) -> Result<usize, PipelineError> {
        let mut resumed = 0;

        for listed in self.store.list().await? {
            let resumable =
                listed.status() == DeploymentStatus::InProgress || listed.needs_rollback();
            if !resumable {
                continue;
            }
            let Some(abort) = self.register(&listed.id) else {
                continue;
            };

            match self.prepare_resume(&listed.id).await {
                Ok(Some((deployment, resolved))) => {
                    info!(
                        "Resuming deployment {} ({:?})",
                        deployment.id,
                        deployment.status()
                    );
                    self.spawn_run(deployment, resolved, abort);
                    resumed += 1;
                }
                Ok(None) => self.unregister(&listed.id),
                Err(e) => {
                    self.unregister(&listed.id);
                    return Err(e);
                }
            }
        }

        Ok(resumed)
    }

    /// Reload a registered deployment and resolve its artifact.
    ///
    /// The record is read again after registration so an abort saved in the
    /// meantime is not lost.
    async fn prepare_resume(
        &self,
        id: &str,
    ) -> Result<Option<(Deployment, ResolvedArtifact)>, PipelineError> {
        let Some(mut deployment) = self.store.load(id).await? else {
            return Ok(None);
        };
        if deployment.status() != DeploymentStatus::InProgress && !deployment.needs_rollback() {
            return Ok(None);
        }

        let resolved = match self.artifacts.resolve(&deployment.artifact).await {
            Ok(resolved) => resolved,
            Err(e) => {
                error!(
                    "Deployment {}: artifact no longer resolvable: {}",
                    deployment.id, e
                );
                if deployment.status() == DeploymentStatus::InProgress {
                    self.fail(
                        &mut deployment,
                        DeploymentEvent::Fail(format!("artifact no longer resolvable: {}", e)),
                    )
                    .await?;
                }
                ResolvedArtifact::unchecked(deployment.artifact.clone())
            }
        };

        Ok(Some((deployment, resolved)))
    }

    /// Claim `id` for a run in this process; `None` if already claimed
    fn register(&self, id: &str) -> Option<Arc<AtomicBool>> {
        let mut runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        if runs.contains_key(id) {
            return None;
        }
        let abort = Arc::new(AtomicBool::new(false));
        runs.insert(
            id.to_string(),
            ActiveRun {
                abort: abort.clone(),
                handle: None,
            },
        );
        Some(abort)
    }

    fn unregister(&self, id: &str) {
        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }

    fn resolve_hook_script(&self, script: &HookScriptRef) -> Result<HookScript, PipelineError> {
        match script {
            HookScriptRef::Inline(script) => Ok(script.clone()),
            HookScriptRef::Named(name) => self.hook_scripts.get(name).cloned().ok_or_else(|| {
                PipelineError::ValidationError(format!("Unknown deployment type '{}'", name))
            }),
        }
    }

    fn validate_hosts(&self, hosts: &[HostId]) -> Result<BTreeSet<HostId>, PipelineError> {
        if hosts.is_empty() {
            return Err(PipelineError::ValidationError(
                "Deployment has no target hosts".to_string(),
            ));
        }

        let unknown: Vec<&str> = hosts
            .iter()
            .filter(|h| self.hosts.host(h).is_none())
            .map(|h| h.as_str())
            .collect();
        if !unknown.is_empty() {
            return Err(PipelineError::ValidationError(format!(
                "Unknown host(s): {}",
                unknown.join(", ")
            )));
        }

        Ok(hosts.iter().cloned().collect())
    }

    fn agents_for(&self, deployment: &Deployment) -> BTreeMap<HostId, Arc<HostAgent>> {
        deployment
            .target_hosts
            .iter()
            .filter_map(|id| {
                let spec = self.hosts.host(id)?;
                Some((
                    id.clone(),
                    Arc::new(HostAgent::new(spec, self.runner.clone(), self.probe_timeout)),
                ))
            })
            .collect()
    }

    fn spawn_run(
        self: &Arc<Self>,
        deployment: Deployment,
        resolved: ResolvedArtifact,
        abort: Arc<AtomicBool>,
    ) {
        let id = deployment.id.clone();
        if deployment.abort_requested {
            abort.store(true, Ordering::SeqCst);
        }

        let controller = Arc::clone(self);
        let task_id = id.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = controller.drive(deployment, resolved, abort).await {
                error!("Deployment {} stopped: {}", task_id, e);
            }
            controller.unregister(&task_id);
        });

        let mut runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(run) = runs.get_mut(&id) {
            run.handle = Some(handle);
        }
    }

    async fn drive(
        &self,
        mut deployment: Deployment,
        resolved: ResolvedArtifact,
        abort: Arc<AtomicBool>,
    ) -> Result<(), PipelineError> {
        let agents = self.agents_for(&deployment);
        let base_env = resolved.env_vars();

        if deployment.status() == DeploymentStatus::InProgress {
            self.run_forward(&mut deployment, &agents, &base_env, &abort)
                .await?;
        }

        if deployment.needs_rollback() {
            self.run_rollback(&mut deployment, &agents, &base_env).await?;
        }

        Ok(())
    }

    async fn run_forward(
        &self,
        deployment: &mut Deployment,
        agents: &BTreeMap<HostId, Arc<HostAgent>>,
        base_env: &BTreeMap<String, String>,
        abort: &AtomicBool,
    ) -> Result<(), PipelineError> {
        let stage_count = deployment.hook_script.stages.len();

        for position in 0..stage_count {
            if let Some(event) = self.halt_event(deployment, abort) {
                return self.fail(deployment, event).await;
            }
            if !deployment.has_running_hosts() {
                break;
            }
            if deployment.eligible_hosts(Phase::Deploy, position).is_empty() {
                debug!(
                    "Deployment {}: stage {} already recorded for every eligible host",
                    deployment.id, position
                );
                continue;
            }

            let stage = deployment.hook_script.stages[position].clone();
            let results = self
                .executor
                .run(Phase::Deploy, position, &stage, deployment, agents, base_env)
                .await;

            let failed: Vec<&str> = results
                .iter()
                .filter(|(_, r)| !r.succeeded())
                .map(|(h, _)| h.as_str())
                .collect();
            if !failed.is_empty() {
                warn!(
                    "Deployment {}: stage {} failed on {}",
                    deployment.id,
                    stage.name,
                    failed.join(", ")
                );
            }

            deployment.record(Phase::Deploy, results);
            self.store.save(deployment).await?;
        }

        if let Some(event) = self.halt_event(deployment, abort) {
            return self.fail(deployment, event).await;
        }
        self.finish(deployment).await
    }

    /// Event that must stop the forward pipeline, if any
    fn halt_event(&self, deployment: &mut Deployment, abort: &AtomicBool) -> Option<DeploymentEvent> {
        if abort.load(Ordering::SeqCst) || deployment.abort_requested {
            deployment.abort_requested = true;
            return Some(DeploymentEvent::Abort);
        }

        if deployment.halt_policy == HaltPolicy::AllOrNothing {
            let failed = deployment.failed_hosts();
            if !failed.is_empty() {
                return Some(DeploymentEvent::Fail(format!(
                    "halted: host(s) {} failed",
                    failed.join(", ")
                )));
            }
        }

        None
    }

    async fn fail(&self, deployment: &mut Deployment, event: DeploymentEvent) -> Result<(), PipelineError> {
        deployment.halt_running_hosts();
        deployment.lifecycle.process(event)?;
        deployment.finished_at = Some(Utc::now());
        deployment.touch();
        self.store.save(deployment).await?;

        warn!(
            "Deployment {} failed: {}",
            deployment.id,
            deployment.lifecycle.error().unwrap_or("unknown")
        );
        Ok(())
    }

    async fn finish(&self, deployment: &mut Deployment) -> Result<(), PipelineError> {
        deployment.halt_running_hosts();

        let total = deployment.per_host_status.len();
        let succeeded = deployment
            .per_host_status
            .values()
            .filter(|o| o.outcome == HostState::Succeeded)
            .count();

        let complete = match deployment.halt_policy {
            HaltPolicy::AllOrNothing => succeeded == total,
            HaltPolicy::PerHost => succeeded > 0,
        };

        if !complete {
            return self
                .fail(
                    deployment,
                    DeploymentEvent::Fail(format!("{} of {} host(s) succeeded", succeeded, total)),
                )
                .await;
        }

        deployment.lifecycle.process(DeploymentEvent::Complete)?;
        deployment.finished_at = Some(Utc::now());
        deployment.touch();
        self.store.save(deployment).await?;

        info!(
            "Deployment {} succeeded on {}/{} host(s)",
            deployment.id, succeeded, total
        );
        Ok(())
    }

    async fn run_rollback(
        &self,
        deployment: &mut Deployment,
        agents: &BTreeMap<HostId, Arc<HostAgent>>,
        base_env: &BTreeMap<String, String>,
    ) -> Result<(), PipelineError> {
        if deployment.rollback.is_none() {
            let targets = deployment.rollback_targets();
            info!(
                "Deployment {}: rolling back {} host(s)",
                deployment.id,
                targets.len()
            );
            deployment.rollback = Some(RollbackRecord {
                targets,
                started_at: Utc::now(),
                finished_at: None,
                succeeded: None,
            });
            deployment.touch();
            self.store.save(deployment).await?;
        }

        let stages = deployment.hook_script.rollback.clone();
        for (position, stage) in stages.iter().enumerate() {
            if deployment.eligible_hosts(Phase::Rollback, position).is_empty() {
                continue;
            }

            let results = self
                .executor
                .run(Phase::Rollback, position, stage, deployment, agents, base_env)
                .await;

            for (host_id, result) in results.iter().filter(|(_, r)| !r.succeeded()) {
                warn!(
                    "Deployment {}: rollback stage {} failed on {} (exit {})",
                    deployment.id, stage.name, host_id, result.exit_code
                );
            }

            deployment.record(Phase::Rollback, results);
            self.store.save(deployment).await?;
        }

        let succeeded = deployment.rollback_succeeded();
        if let Some(record) = deployment.rollback.as_mut() {
            record.finished_at = Some(Utc::now());
            record.succeeded = Some(succeeded);
        }
        if succeeded {
            deployment.lifecycle.process(DeploymentEvent::RollbackSucceeded)?;
            info!("Deployment {} rolled back", deployment.id);
        } else {
            warn!(
                "Deployment {}: rollback incomplete, status stays failed",
                deployment.id
            );
        }
        deployment.touch();
        self.store.save(deployment).await
    }
}

//! Shared test fixtures
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use fleetpipe::deploy::controller::{ControllerOptions, DeploymentController};
use fleetpipe::deploy::hook_runner::{HookInvocation, HookOutput, HookRunner};
use fleetpipe::errors::PipelineError;
use fleetpipe::models::artifact::{
    ArtifactReference, ArtifactResolver, ResolvedArtifact, UrlArtifactResolver,
};
use fleetpipe::models::deployment::{DeploymentRequest, HaltPolicy, HookScriptRef, Phase};
use fleetpipe::models::hook::{HookScript, HookStage};
use fleetpipe::models::host::{HostSpec, StaticInventory};
use fleetpipe::storage::store::{DeploymentStore, MemoryDeploymentStore};

pub const DIGEST: &str =
    "sha256:9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

/// What a scripted hook does
#[derive(Debug, Clone, Default)]
pub struct Behavior {
    pub exit_code: i32,
    pub delay: Duration,
}

/// One hook start or finish seen by the runner
#[derive(Debug, Clone)]
pub struct HookEvent {
    pub seq: usize,
    pub host: String,
    pub phase: Phase,
    pub stage: String,
    pub finished: bool,
    pub env: BTreeMap<String, String>,
}

/// Hook runner driven by a table of (host, stage) behaviors
#[derive(Default)]
pub struct ScriptedRunner {
    behaviors: Mutex<HashMap<(String, String), Behavior>>,
    events: Mutex<Vec<HookEvent>>,
    seq: AtomicUsize,
}

impl ScriptedRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, host: &str, stage: &str, exit_code: i32, delay: Duration) {
        self.behaviors.lock().unwrap().insert(
            (host.to_string(), stage.to_string()),
            Behavior { exit_code, delay },
        );
    }

    pub fn fail(&self, host: &str, stage: &str, exit_code: i32) {
        self.set(host, stage, exit_code, Duration::ZERO);
    }

    pub fn slow(&self, host: &str, stage: &str, delay: Duration) {
        self.set(host, stage, 0, delay);
    }

    pub fn events(&self) -> Vec<HookEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Number of times `stage` was started on `host`
    pub fn runs(&self, host: &str, stage: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| !e.finished && e.host == host && e.stage == stage)
            .count()
    }

    /// Number of hosts that started `stage`
    pub fn started(&self, stage: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| !e.finished && e.stage == stage)
            .count()
    }

    fn push(&self, host: &str, invocation: &HookInvocation, finished: bool) {
        let event = HookEvent {
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            host: host.to_string(),
            phase: invocation.phase,
            stage: invocation.stage_name.clone(),
            finished,
            env: invocation.env.clone(),
        };
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl HookRunner for ScriptedRunner {
    async fn execute(&self, host: &HostSpec, invocation: &HookInvocation) -> HookOutput {
        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(&(host.id.clone(), invocation.stage_name.clone()))
            .cloned()
            .unwrap_or_default();

        self.push(&host.id, invocation, false);
        if !behavior.delay.is_zero() {
            tokio::time::sleep(behavior.delay).await;
        }
        self.push(&host.id, invocation, true);

        HookOutput::from_exit(
            behavior.exit_code,
            format!("{} on {}", invocation.stage_name, host.id),
        )
    }
}

/// Artifact store that takes a while to answer
pub struct SlowResolver {
    delay: Duration,
    inner: UrlArtifactResolver,
}

impl SlowResolver {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            inner: UrlArtifactResolver::default(),
        }
    }
}

#[async_trait]
impl ArtifactResolver for SlowResolver {
    async fn resolve(&self, reference: &ArtifactReference) -> Result<ResolvedArtifact, PipelineError> {
        tokio::time::sleep(self.delay).await;
        self.inner.resolve(reference).await
    }
}

/// Wait until `cond` holds, polling every 10ms for up to 5s
pub async fn eventually(cond: impl Fn() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

pub fn artifact() -> ArtifactReference {
    ArtifactReference::new("https://releases.example.com/web-2.4.0.tar.gz", "2.4.0", DIGEST)
}

/// install, start, validate with a single restore rollback stage
pub fn web_script() -> HookScript {
    HookScript::new(
        "web",
        vec![
            HookStage::new("install", "./hooks/install.sh"),
            HookStage::new("start", "./hooks/start.sh"),
            HookStage::new("validate", "./hooks/validate.sh"),
        ],
    )
    .with_rollback(vec![HookStage::new("restore", "./hooks/restore.sh")])
}

pub fn request(hosts: &[&str], halt_policy: HaltPolicy) -> DeploymentRequest {
    DeploymentRequest {
        artifact: artifact(),
        hosts: hosts.iter().map(|h| h.to_string()).collect(),
        hook_script: HookScriptRef::Inline(web_script()),
        halt_policy,
    }
}

pub fn local_hosts(ids: &[&str]) -> Vec<HostSpec> {
    ids.iter().map(|id| HostSpec::local(*id)).collect()
}

pub fn options() -> ControllerOptions {
    ControllerOptions {
        default_stage_timeout: Duration::from_secs(5),
        max_output_bytes: 1024,
        probe_timeout: Duration::from_millis(500),
        hook_scripts: BTreeMap::from([("web".to_string(), web_script())]),
    }
}

pub fn controller_with(
    runner: Arc<ScriptedRunner>,
    hosts: Vec<HostSpec>,
    store: Arc<dyn DeploymentStore>,
) -> Arc<DeploymentController> {
    controller_with_resolver(runner, hosts, store, Arc::new(UrlArtifactResolver::default()))
}

pub fn controller_with_resolver(
    runner: Arc<ScriptedRunner>,
    hosts: Vec<HostSpec>,
    store: Arc<dyn DeploymentStore>,
    artifacts: Arc<dyn ArtifactResolver>,
) -> Arc<DeploymentController> {
    Arc::new(DeploymentController::new(
        options(),
        store,
        Arc::new(StaticInventory::new(hosts)),
        artifacts,
        runner,
    ))
}

pub fn controller(runner: Arc<ScriptedRunner>, hosts: &[&str]) -> Arc<DeploymentController> {
    controller_with(runner, local_hosts(hosts), Arc::new(MemoryDeploymentStore::new()))
}

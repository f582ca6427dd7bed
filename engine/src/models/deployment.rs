//! Deployment models
//!
//! A [`Deployment`] is the single mutable record of one release. It is only
//! mutated by the controller, and is persisted as one document keyed by its
//! id. Each host owns a disjoint [`HostOutcome`] entry.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::deploy::fsm::{DeploymentFsm, DeploymentStatus};
use crate::models::artifact::ArtifactReference;
use crate::models::hook::HookScript;
use crate::models::host::HostId;

/// Unique deployment ID
pub type DeploymentId = String;

/// Exit code recorded when a hook exceeds its timeout
pub const EXIT_TIMEOUT: i32 = 124;

/// Exit code recorded when the hook process could not be launched
pub const EXIT_LAUNCH_FAILURE: i32 = 127;

/// Exit code recorded when the hook was terminated by a signal
pub const EXIT_SIGNALED: i32 = 128;

/// Exit code recorded when the host could not be reached
pub const EXIT_UNREACHABLE: i32 = 255;

/// Exit code recorded when the host task itself crashed
pub const EXIT_INTERNAL: i32 = -1;

/// What to do when a host fails a stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HaltPolicy {
    /// Drop the failed host, keep going with the others
    #[default]
    PerHost,

    /// Any host failure halts the whole deployment
    AllOrNothing,
}

/// Why a stage did not succeed on a host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookFault {
    /// Hook ran and exited non-zero
    ScriptFailure,

    /// Host did not respond before dispatch
    Unreachable,

    /// Hook exceeded its allotted duration
    Timeout,

    /// Hook process could not be started
    Launch,
}

/// Outcome of one hook on one host. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage_name: String,
    pub position: usize,
    pub exit_code: i32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Combined stdout/stderr, bounded
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault: Option<HookFault>,
}

impl StageResult {
    /// A result that was not produced by running the hook
    pub fn synthesized(
        stage_name: &str,
        position: usize,
        exit_code: i32,
        fault: HookFault,
        output: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            stage_name: stage_name.to_string(),
            position,
            exit_code,
            started_at: now,
            finished_at: now,
            output: output.into(),
            fault: Some(fault),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == 0 && self.fault.is_none()
    }

    /// The hook was actually handed to the host
    pub fn was_dispatched(&self) -> bool {
        self.fault != Some(HookFault::Unreachable)
    }
}

/// Pipeline of hooks being executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Deploy,
    Rollback,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Deploy => "deploy",
            Phase::Rollback => "rollback",
        }
    }
}

/// Per-host outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostState {
    Running,
    Succeeded,
    Failed,
    /// Not failed, but the deployment stopped before all stages ran
    Halted,
}

/// Stage history of one host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostOutcome {
    pub host_id: HostId,
    pub current_stage: Option<String>,
    pub stage_results: Vec<StageResult>,
    #[serde(default)]
    pub rollback_results: Vec<StageResult>,
    pub outcome: HostState,
}

impl HostOutcome {
    pub fn new(host_id: impl Into<String>) -> Self {
        Self {
            host_id: host_id.into(),
            current_stage: None,
            stage_results: Vec::new(),
            rollback_results: Vec::new(),
            outcome: HostState::Running,
        }
    }

    /// Append a forward stage result and update the outcome
    fn record_stage(&mut self, result: StageResult, stage_count: usize) {
        let succeeded = result.succeeded();
        self.current_stage = Some(result.stage_name.clone());
        self.stage_results.push(result);

        if !succeeded {
            self.outcome = HostState::Failed;
        } else if self.stage_results.len() == stage_count {
            self.outcome = HostState::Succeeded;
        }
    }

    /// At least one hook was dispatched to the host
    pub fn reached_in_progress(&self) -> bool {
        self.stage_results.iter().any(StageResult::was_dispatched)
    }

    /// Output of every prior forward stage, by stage name
    pub fn stage_outputs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.stage_results
            .iter()
            .map(|r| (r.stage_name.as_str(), r.output.as_str()))
    }
}

/// Rollback bookkeeping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackRecord {
    pub targets: BTreeSet<HostId>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub succeeded: Option<bool>,
}

/// Which hook script a request runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HookScriptRef {
    /// A deployment type registered in settings
    Named(String),

    /// A script supplied with the request
    Inline(HookScript),
}

/// A request to release an artifact onto a set of hosts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRequest {
    pub artifact: ArtifactReference,
    pub hosts: Vec<HostId>,
    pub hook_script: HookScriptRef,
    #[serde(default)]
    pub halt_policy: HaltPolicy,
}

/// One release onto a fleet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: DeploymentId,
    pub artifact: ArtifactReference,
    pub target_hosts: BTreeSet<HostId>,
    pub hook_script: HookScript,
    pub halt_policy: HaltPolicy,
    #[serde(flatten)]
    pub lifecycle: DeploymentFsm,
    pub per_host_status: BTreeMap<HostId, HostOutcome>,
    #[serde(default)]
    pub rollback: Option<RollbackRecord>,
    #[serde(default)]
    pub abort_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Deployment {
    /// Create a pending deployment
    pub fn new(
        id: DeploymentId,
        artifact: ArtifactReference,
        target_hosts: BTreeSet<HostId>,
        hook_script: HookScript,
        halt_policy: HaltPolicy,
    ) -> Self {
        let now = Utc::now();
        let per_host_status = target_hosts
            .iter()
            .map(|h| (h.clone(), HostOutcome::new(h.clone())))
            .collect();

        Self {
            id,
            artifact,
            target_hosts,
            hook_script,
            halt_policy,
            lifecycle: DeploymentFsm::new(),
            per_host_status,
            rollback: None,
            abort_requested: false,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    pub fn status(&self) -> DeploymentStatus {
        self.lifecycle.state()
    }

    pub fn outcome(&self, host_id: &str) -> Option<&HostOutcome> {
        self.per_host_status.get(host_id)
    }

    /// Whether a host should receive the stage at `position` of `phase`.
    ///
    /// A host is eligible only if it has results for exactly the stages
    /// before `position`, which keeps results strictly ordered and lets a
    /// resumed run skip stages already recorded.
    pub fn is_eligible(&self, host_id: &str, phase: Phase, position: usize) -> bool {
        let Some(outcome) = self.per_host_status.get(host_id) else {
            return false;
        };

        match phase {
            Phase::Deploy => {
                outcome.outcome == HostState::Running && outcome.stage_results.len() == position
            }
            Phase::Rollback => {
                self.rollback
                    .as_ref()
                    .is_some_and(|r| r.targets.contains(host_id))
                    && outcome.rollback_results.len() == position
            }
        }
    }

    /// Hosts eligible for the stage at `position` of `phase`
    pub fn eligible_hosts(&self, phase: Phase, position: usize) -> Vec<HostId> {
        self.target_hosts
            .iter()
            .filter(|h| self.is_eligible(h, phase, position))
            .cloned()
            .collect()
    }

    /// Hosts that still have forward stages to run
    pub fn has_running_hosts(&self) -> bool {
        self.per_host_status
            .values()
            .any(|o| o.outcome == HostState::Running)
    }

    /// Record one barrier's worth of results
    pub fn record(&mut self, phase: Phase, results: BTreeMap<HostId, StageResult>) {
        let stage_count = self.hook_script.stages.len();
        for (host_id, result) in results {
            if let Some(outcome) = self.per_host_status.get_mut(&host_id) {
                match phase {
                    Phase::Deploy => outcome.record_stage(result, stage_count),
                    Phase::Rollback => outcome.rollback_results.push(result),
                }
            }
        }
        self.touch();
    }

    /// Hosts that failed a forward stage
    pub fn failed_hosts(&self) -> Vec<HostId> {
        self.per_host_status
            .values()
            .filter(|o| o.outcome == HostState::Failed)
            .map(|o| o.host_id.clone())
            .collect()
    }

    /// Mark hosts that were cut short by a halt
    pub fn halt_running_hosts(&mut self) {
        for outcome in self.per_host_status.values_mut() {
            if outcome.outcome == HostState::Running {
                outcome.outcome = HostState::Halted;
            }
        }
    }

    /// Hosts a rollback should run against
    pub fn rollback_targets(&self) -> BTreeSet<HostId> {
        self.per_host_status
            .values()
            .filter(|o| o.reached_in_progress())
            .map(|o| o.host_id.clone())
            .collect()
    }

    /// Failed with rollback stages and something to roll back that has not
    /// finished rolling back
    pub fn needs_rollback(&self) -> bool {
        if self.status() != DeploymentStatus::Failed || self.hook_script.rollback.is_empty() {
            return false;
        }
        match &self.rollback {
            Some(record) => record.finished_at.is_none(),
            None => !self.rollback_targets().is_empty(),
        }
    }

    /// Every rollback target ran every rollback stage successfully
    pub fn rollback_succeeded(&self) -> bool {
        let Some(record) = &self.rollback else {
            return false;
        };
        let stage_count = self.hook_script.rollback.len();
        record.targets.iter().all(|host_id| {
            self.per_host_status.get(host_id).is_some_and(|o| {
                o.rollback_results.len() == stage_count
                    && o.rollback_results.iter().all(StageResult::succeeded)
            })
        })
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

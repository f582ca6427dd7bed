//! Hook scripts: the ordered stage definitions of a deployment type

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::PipelineError;

/// A stage and the hook command bound to it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookStage {
    /// Stage name (e.g. `install`, `start`, `validate`)
    pub name: String,

    /// Script path or shell command run once per host
    pub command: String,

    /// Per-host timeout; the engine default applies when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl HookStage {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            timeout_ms: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX).max(1));
        self
    }

    /// Effective timeout for one host
    pub fn timeout(&self, default: Duration) -> Duration {
        self.timeout_ms.map(Duration::from_millis).unwrap_or(default)
    }
}

/// Named, ordered hook definitions shared read-only by all hosts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookScript {
    /// Deployment type name
    pub name: String,

    /// Forward stages in execution order
    pub stages: Vec<HookStage>,

    /// Stages run against failed deployments (e.g. stop, uninstall)
    #[serde(default)]
    pub rollback: Vec<HookStage>,
}

impl HookScript {
    pub fn new(name: impl Into<String>, stages: Vec<HookStage>) -> Self {
        Self {
            name: name.into(),
            stages,
            rollback: Vec::new(),
        }
    }

    pub fn with_rollback(mut self, rollback: Vec<HookStage>) -> Self {
        self.rollback = rollback;
        self
    }

    /// Forward stage names in order
    pub fn stage_names(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.name.clone()).collect()
    }

    /// Reject empty or ambiguous definitions
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.stages.is_empty() {
            return Err(PipelineError::ValidationError(format!(
                "Hook script '{}' has no stages",
                self.name
            )));
        }

        for (kind, stages) in [("stage", &self.stages), ("rollback stage", &self.rollback)] {
            let mut seen = HashSet::new();
            for stage in stages {
                if stage.name.trim().is_empty() {
                    return Err(PipelineError::ValidationError(format!(
                        "Hook script '{}' has a {} without a name",
                        self.name, kind
                    )));
                }
                if stage.command.trim().is_empty() {
                    return Err(PipelineError::ValidationError(format!(
                        "{} '{}' has no command",
                        kind, stage.name
                    )));
                }
                if stage.timeout_ms == Some(0) {
                    return Err(PipelineError::ValidationError(format!(
                        "{} '{}' has a zero timeout",
                        kind, stage.name
                    )));
                }
                if !seen.insert(stage.name.as_str()) {
                    return Err(PipelineError::ValidationError(format!(
                        "Duplicate {} '{}'",
                        kind, stage.name
                    )));
                }
            }
        }

        Ok(())
    }
}

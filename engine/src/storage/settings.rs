//! Settings file management

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::logs::LogLevel;
use crate::models::hook::HookScript;
use crate::models::host::HostSpec;

/// Engine settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON log lines on stdout
    #[serde(default)]
    pub log_json: bool,

    /// Also write daily rolling log files here
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// HTTP API configuration
    #[serde(default)]
    pub server: ServerSettings,

    /// Hook execution configuration
    #[serde(default)]
    pub execution: ExecutionSettings,

    /// Host inventory supplied by provisioning
    #[serde(default)]
    pub hosts: Vec<HostSpec>,

    /// Hook scripts by deployment type
    #[serde(default)]
    pub hook_scripts: BTreeMap<String, HookScript>,
}

/// HTTP API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Host to bind to
    #[serde(default = "default_server_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_server_port")]
    pub port: u16,
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    8640
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
        }
    }
}

/// Hook execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSettings {
    /// Per stage-host timeout when a stage does not set one
    #[serde(default = "default_stage_timeout_secs")]
    pub default_stage_timeout_secs: u64,

    /// Bound on captured hook output
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    /// Reachability probe timeout
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Shell used to run hook commands
    #[serde(default = "default_shell")]
    pub shell: String,

    /// `ssh -o ConnectTimeout`
    #[serde(default = "default_ssh_connect_timeout_secs")]
    pub ssh_connect_timeout_secs: u64,
}

fn default_stage_timeout_secs() -> u64 {
    300
}

fn default_max_output_bytes() -> usize {
    8192
}

fn default_probe_timeout_ms() -> u64 {
    2000
}

fn default_shell() -> String {
    "sh".to_string()
}

fn default_ssh_connect_timeout_secs() -> u64 {
    10
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            default_stage_timeout_secs: default_stage_timeout_secs(),
            max_output_bytes: default_max_output_bytes(),
            probe_timeout_ms: default_probe_timeout_ms(),
            shell: default_shell(),
            ssh_connect_timeout_secs: default_ssh_connect_timeout_secs(),
        }
    }
}

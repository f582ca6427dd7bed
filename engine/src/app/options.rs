//! Application configuration options

use std::time::Duration;

use crate::deploy::controller::ControllerOptions;
use crate::models::host::HostSpec;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Storage layout paths
    pub layout: StorageLayout,

    /// Server configuration
    pub server: ServerOptions,

    /// Deployment controller settings
    pub controller: ControllerOptions,

    /// Hook runner settings
    pub runner: RunnerOptions,

    /// Host inventory
    pub hosts: Vec<HostSpec>,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            lifecycle: LifecycleOptions::default(),
            layout: StorageLayout::default(),
            server: ServerOptions::default(),
            controller: ControllerOptions::default(),
            runner: RunnerOptions::default(),
            hosts: Vec::new(),
        }
    }
}

impl AppOptions {
    /// Options derived from a settings document
    pub fn from_settings(layout: StorageLayout, settings: &Settings) -> Self {
        let execution = &settings.execution;
        Self {
            lifecycle: LifecycleOptions::default(),
            layout,
            server: ServerOptions {
                host: settings.server.host.clone(),
                port: settings.server.port,
            },
            controller: ControllerOptions {
                default_stage_timeout: Duration::from_secs(execution.default_stage_timeout_secs),
                max_output_bytes: execution.max_output_bytes,
                probe_timeout: Duration::from_millis(execution.probe_timeout_ms),
                hook_scripts: settings.hook_scripts.clone(),
            },
            runner: RunnerOptions {
                shell: execution.shell.clone(),
                ssh_connect_timeout: Duration::from_secs(execution.ssh_connect_timeout_secs),
            },
            hosts: settings.hosts.clone(),
        }
    }
}

/// Lifecycle options for the engine
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// Local HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8640,
        }
    }
}

/// Shell hook runner options
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Shell used to run hook commands
    pub shell: String,

    /// `ssh -o ConnectTimeout`
    pub ssh_connect_timeout: Duration,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            ssh_connect_timeout: Duration::from_secs(10),
        }
    }
}

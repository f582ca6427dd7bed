//! Application state management

use std::sync::Arc;

use tracing::info;

use crate::app::options::AppOptions;
use crate::deploy::controller::DeploymentController;
use crate::deploy::hook_runner::ShellHookRunner;
use crate::errors::PipelineError;
use crate::models::artifact::UrlArtifactResolver;
use crate::models::host::StaticInventory;
use crate::storage::store::FileDeploymentStore;

/// Main application state
pub struct AppState {
    /// Deployment controller
    pub controller: Arc<DeploymentController>,
}

impl AppState {
    /// Initialize application state
    pub async fn init(options: &AppOptions) -> Result<Self, PipelineError> {
        info!("Initializing application state...");

        for (name, script) in &options.controller.hook_scripts {
            script.validate().map_err(|e| {
                PipelineError::ConfigError(format!("hook script '{}': {}", name, e))
            })?;
        }

        options.layout.setup().await?;

        let store = Arc::new(FileDeploymentStore::open(options.layout.deployments_dir()).await?);
        let inventory = Arc::new(StaticInventory::new(options.hosts.clone()));
        let runner = Arc::new(ShellHookRunner::new(
            options.runner.shell.clone(),
            options.runner.ssh_connect_timeout,
        ));

        let controller = Arc::new(DeploymentController::new(
            options.controller.clone(),
            store,
            inventory,
            Arc::new(UrlArtifactResolver::default()),
            runner,
        ));

        info!(
            "Loaded {} host(s) and {} hook script(s)",
            options.hosts.len(),
            options.controller.hook_scripts.len()
        );

        Ok(Self { controller })
    }

    /// Shutdown application state
    pub async fn shutdown(&self) -> Result<(), PipelineError> {
        let active = self.controller.active_count();
        if active > 0 {
            info!(
                "Leaving {} deployment(s) in flight; they resume on next start",
                active
            );
        }
        Ok(())
    }
}

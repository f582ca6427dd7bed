//! Server state

use std::sync::Arc;

use crate::deploy::controller::DeploymentController;

/// Server state shared across handlers
pub struct ServerState {
    pub controller: Arc<DeploymentController>,
}

impl ServerState {
    pub fn new(controller: Arc<DeploymentController>) -> Self {
        Self { controller }
    }
}

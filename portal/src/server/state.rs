//! Server state

use std::sync::Arc;

use crate::deploy::executor::DeploymentExecutor;
use crate::introspection::ContainerIntrospector;
use crate::store::deployments::DeploymentStore;
use crate::store::targets::TargetRegistry;

/// Server state shared across handlers
pub struct ServerState {
    pub targets: Arc<TargetRegistry>,
    pub deployments: Arc<DeploymentStore>,
    pub executor: Arc<DeploymentExecutor>,
    pub introspector: Arc<ContainerIntrospector>,
}

impl ServerState {
    pub fn new(
        targets: Arc<TargetRegistry>,
        deployments: Arc<DeploymentStore>,
        executor: Arc<DeploymentExecutor>,
        introspector: Arc<ContainerIntrospector>,
    ) -> Self {
        Self {
            targets,
            deployments,
            executor,
            introspector,
        }
    }
}

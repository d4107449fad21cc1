//! Application state management

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::app::options::AppOptions;
use crate::deploy::executor::DeploymentExecutor;
use crate::deploy::locks::TargetLocks;
use crate::errors::PortalError;
use crate::introspection::ContainerIntrospector;
use crate::remote::simulated::SimulatedProvider;
use crate::remote::ssh::SshSessionProvider;
use crate::remote::SessionProvider;
use crate::server::state::ServerState;
use crate::store::deployments::DeploymentStore;
use crate::store::targets::TargetRegistry;

/// Main application state
pub struct AppState {
    /// Registered targets
    pub targets: Arc<TargetRegistry>,

    /// Deployment records and logs
    pub deployments: Arc<DeploymentStore>,

    /// Per-target locks shared by the executor and introspection
    pub locks: Arc<TargetLocks>,

    /// Transport to targets
    pub provider: Arc<dyn SessionProvider>,

    pub executor: Arc<DeploymentExecutor>,

    pub introspector: Arc<ContainerIntrospector>,
}

impl AppState {
    /// Initialize application state
    pub async fn init(options: &AppOptions) -> Result<Self, PortalError> {
        info!("Initializing application state...");

        let targets = if options.storage.persist_targets {
            TargetRegistry::load(options.storage.layout.targets_file()).await?
        } else {
            TargetRegistry::new()
        };

        let provider: Arc<dyn SessionProvider> = if options.simulate {
            warn!("Simulation mode: commands run against an in-memory docker engine");
            Arc::new(SimulatedProvider::new())
        } else {
            Arc::new(SshSessionProvider::new(options.ssh.clone()))
        };

        Ok(Self::with_provider(targets, provider, options))
    }

    /// Assemble state around an existing registry and provider
    pub fn with_provider(
        targets: TargetRegistry,
        provider: Arc<dyn SessionProvider>,
        options: &AppOptions,
    ) -> Self {
        let targets = Arc::new(targets);
        let deployments = Arc::new(DeploymentStore::new());
        let locks = Arc::new(TargetLocks::new());

        let executor = Arc::new(DeploymentExecutor::new(
            provider.clone(),
            targets.clone(),
            deployments.clone(),
            locks.clone(),
            options.executor.clone(),
        ));
        let introspector = Arc::new(ContainerIntrospector::new(
            provider.clone(),
            targets.clone(),
            locks.clone(),
            options.executor.clone(),
        ));

        Self {
            targets,
            deployments,
            locks,
            provider,
            executor,
            introspector,
        }
    }

    /// State handed to HTTP handlers
    pub fn server_state(&self) -> ServerState {
        ServerState::new(
            self.targets.clone(),
            self.deployments.clone(),
            self.executor.clone(),
            self.introspector.clone(),
        )
    }

    /// Shutdown application state
    pub async fn shutdown(&self, grace: Duration) -> Result<(), PortalError> {
        info!("Shutting down application state...");
        self.executor.shutdown(grace).await;
        Ok(())
    }
}

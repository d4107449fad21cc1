//! Container introspection
//!
//! Live queries against a target's container engine. Results are never
//! cached. Read-only operations run without the target lock; mutations take
//! it, so they never interleave with a deployment to the same target. Every
//! remote exchange is bounded by the command timeout, so a hung engine
//! cannot hold a target's lock.

pub mod parse;

use std::sync::Arc;

use tracing::{debug, info};

use crate::deploy::executor::ExecutorOptions;
use crate::deploy::locks::TargetLocks;
use crate::deploy::translator::{self, shell_quote, RecreateSpec};
use crate::errors::PortalError;
use crate::models::container::Container;
use crate::models::target::{EnvVars, Target, TargetId};
use crate::remote::{self, CommandOutput, Session, SessionProvider};
use crate::store::targets::TargetRegistry;

use parse::InspectedContainer;

/// Default number of log lines returned
pub const DEFAULT_LOG_LINES: u32 = 100;

/// Upper bound on requested log lines
pub const MAX_LOG_LINES: u32 = 10_000;

pub struct ContainerIntrospector {
    provider: Arc<dyn SessionProvider>,
    targets: Arc<TargetRegistry>,
    locks: Arc<TargetLocks>,
    options: ExecutorOptions,
}

impl ContainerIntrospector {
    pub fn new(
        provider: Arc<dyn SessionProvider>,
        targets: Arc<TargetRegistry>,
        locks: Arc<TargetLocks>,
        options: ExecutorOptions,
    ) -> Self {
        Self {
            provider,
            targets,
            locks,
            options,
        }
    }

    /// Containers on the target; stopped ones too when `all` is set
    pub async fn list(&self, target_id: TargetId, all: bool) -> Result<Vec<Container>, PortalError> {
        let target = self.targets.require(target_id)?;
        let command = list_command(all);
        let output = self.run(&target, command.clone()).await?;
        let output = output.check(&command, self.options.stderr_tail_lines)?;

        let containers = parse::parse_ps(&output.stdout);
        debug!("Target {} reports {} containers", target.id, containers.len());
        Ok(containers)
    }

    /// Last `max_lines` lines of a container's combined output.
    ///
    /// `max_lines` is clamped to `1..=10000`; `None` means 100.
    pub async fn logs(
        &self,
        target_id: TargetId,
        name: &str,
        max_lines: Option<u32>,
    ) -> Result<(u32, String), PortalError> {
        translator::validate_container_name(name)?;
        let target = self.targets.require(target_id)?;
        let lines = clamp_lines(max_lines);

        let command = format!("docker logs --tail {} {} 2>&1", lines, shell_quote(name));
        let output = self.run(&target, command.clone()).await?;
        let output = not_found_as(output, &target, name)?;
        let output = output.check(&command, self.options.stderr_tail_lines)?;

        // `2>&1` folds stderr into stdout on a real shell; keep both otherwise
        let mut logs = output.stdout;
        logs.push_str(&output.stderr);
        Ok((lines, logs))
    }

    /// Environment of a container, from `docker inspect`
    pub async fn get_env(&self, target_id: TargetId, name: &str) -> Result<EnvVars, PortalError> {
        translator::validate_container_name(name)?;
        let target = self.targets.require(target_id)?;
        let tail = self.options.stderr_tail_lines;
        let name_owned = name.to_string();

        let inspected = remote::with_session(
            self.provider.as_ref(),
            &target,
            self.options.connect_timeout,
            self.options.command_timeout,
            move |session| Box::pin(async move { inspect_on(session, &name_owned, tail).await }),
        )
        .await?;

        inspected
            .map(|c| c.env)
            .ok_or_else(|| container_not_found(&target, name))
    }

    /// Replace a container's environment by recreating it.
    ///
    /// Image, port bindings and restart policy are preserved. Returns the
    /// environment the new container reports.
    pub async fn update_env(
        &self,
        target_id: TargetId,
        name: &str,
        env: EnvVars,
    ) -> Result<EnvVars, PortalError> {
        translator::validate_container_name(name)?;
        translator::validate_env(&env)?;
        let target = self.targets.require(target_id)?;

        let _guard = self
            .locks
            .acquire(target.id, self.options.lock_timeout)
            .await?;
        info!(
            "Recreating container {} on target {} with {} env variables",
            name,
            target.id,
            env.len()
        );

        let tail = self.options.stderr_tail_lines;
        let name_owned = name.to_string();
        let recreated = remote::with_session(
            self.provider.as_ref(),
            &target,
            self.options.connect_timeout,
            self.options.command_timeout,
            move |session| {
                Box::pin(async move {
                    let Some(current) = inspect_on(session, &name_owned, tail).await? else {
                        return Ok(None);
                    };

                    let plan = translator::recreate_plan(&RecreateSpec {
                        container_name: &name_owned,
                        image: &current.image,
                        ports: &current.ports,
                        env: &env,
                        restart_policy: current.restart_policy.as_deref(),
                    });
                    for step in &plan.steps {
                        debug!("{}: {}", step.description, step.command);
                        session.run(&step.command).await?.check(&step.command, tail)?;
                    }

                    inspect_on(session, &name_owned, tail).await
                })
            },
        )
        .await?;

        match recreated {
            Some(container) => {
                info!("Container {} on target {} recreated ({})", name, target.id, short_id(&container.id));
                Ok(container.env)
            }
            None => Err(container_not_found(&target, name)),
        }
    }

    /// Force-remove a container
    pub async fn remove(&self, target_id: TargetId, name: &str) -> Result<(), PortalError> {
        translator::validate_container_name(name)?;
        let target = self.targets.require(target_id)?;

        let _guard = self
            .locks
            .acquire(target.id, self.options.lock_timeout)
            .await?;

        let command = format!("docker rm -f {}", shell_quote(name));
        let output = self.run(&target, command.clone()).await?;
        let output = not_found_as(output, &target, name)?;
        output.check(&command, self.options.stderr_tail_lines)?;

        info!("Removed container {} from target {}", name, target.id);
        Ok(())
    }

    async fn run(&self, target: &Target, command: String) -> Result<CommandOutput, PortalError> {
        remote::with_session(
            self.provider.as_ref(),
            target,
            self.options.connect_timeout,
            self.options.command_timeout,
            move |session| Box::pin(async move { session.run(&command).await }),
        )
        .await
    }
}

fn list_command(all: bool) -> String {
    format!(
        "docker ps{} --format {}",
        if all { " -a" } else { "" },
        shell_quote(parse::PS_FORMAT)
    )
}

fn clamp_lines(max_lines: Option<u32>) -> u32 {
    max_lines
        .unwrap_or(DEFAULT_LOG_LINES)
        .clamp(1, MAX_LOG_LINES)
}

fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

fn container_not_found(target: &Target, name: &str) -> PortalError {
    PortalError::NotFound(format!(
        "Container {} not found on target {}",
        name, target.id
    ))
}

/// Map an engine "no such container" failure to `NotFound`
fn not_found_as(output: CommandOutput, target: &Target, name: &str) -> Result<CommandOutput, PortalError> {
    if !output.success() && (parse::is_not_found(&output.stderr) || parse::is_not_found(&output.stdout)) {
        return Err(container_not_found(target, name));
    }
    Ok(output)
}

async fn inspect_on(
    session: &mut Box<dyn Session>,
    name: &str,
    tail: usize,
) -> Result<Option<InspectedContainer>, PortalError> {
    let command = format!("docker inspect --type container {}", shell_quote(name));
    let output = session.run(&command).await?;
    if !output.success() && parse::is_not_found(&output.stderr) {
        return Ok(None);
    }
    let output = output.check(&command, tail)?;
    parse::parse_inspect(&output.stdout)
}

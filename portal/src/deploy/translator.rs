//! Command translator
//!
//! Pure mapping from deployment requests to the literal shell commands run on
//! the target. Nothing here performs I/O.

use std::borrow::Cow;

use openapi_server::models::DeploymentBody;
use serde::Serialize;

use crate::errors::PortalError;
use crate::models::deployment::{format_ports, DeploymentRequest, PortMapping, Workload};
use crate::models::target::{EnvVars, Target};

/// One remote command of a plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandStep {
    pub command: String,
    pub description: String,
    /// Non-zero exit is logged and ignored (e.g. removing a container that may not exist)
    pub ignore_failure: bool,
}

impl CommandStep {
    fn required(command: String, description: impl Into<String>) -> Self {
        Self {
            command,
            description: description.into(),
            ignore_failure: false,
        }
    }

    fn optional(command: String, description: impl Into<String>) -> Self {
        Self {
            command,
            description: description.into(),
            ignore_failure: true,
        }
    }
}

/// Ordered commands that realise a request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommandPlan {
    pub steps: Vec<CommandStep>,
}

impl CommandPlan {
    pub fn commands(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.command.clone()).collect()
    }
}

/// Result of a dry run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Preview {
    pub summary: String,
    pub commands: Vec<String>,
}

/// Everything needed to recreate a container with a new environment
#[derive(Debug, Clone)]
pub struct RecreateSpec<'a> {
    pub container_name: &'a str,
    pub image: &'a str,
    pub ports: &'a [PortMapping],
    pub env: &'a EnvVars,
    pub restart_policy: Option<&'a str>,
}

// ================================= VALIDATION ==================================== //

fn normalized(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Validate a raw request body into a typed request
pub fn parse_request(body: &DeploymentBody) -> Result<DeploymentRequest, PortalError> {
    let image = normalized(&body.image);
    let container_name = normalized(&body.container_name);
    let ports = normalized(&body.ports);
    let compose_file_path = normalized(&body.compose_file_path);

    let has_container_fields = image.is_some() || container_name.is_some() || ports.is_some();

    let workload = match (compose_file_path, has_container_fields) {
        (Some(_), true) => {
            return Err(PortalError::ValidationError(
                "compose_file_path cannot be combined with image, container_name or ports"
                    .to_string(),
            ));
        }
        (None, false) => {
            return Err(PortalError::ValidationError(
                "either image and container_name, or compose_file_path, is required".to_string(),
            ));
        }
        (Some(path), false) => {
            validate_compose_path(path)?;
            Workload::Compose {
                compose_file_path: path.to_string(),
            }
        }
        (None, true) => {
            let image = image.ok_or_else(|| {
                PortalError::ValidationError("image is required".to_string())
            })?;
            let container_name = container_name.ok_or_else(|| {
                PortalError::ValidationError("container_name is required".to_string())
            })?;
            validate_image(image)?;
            validate_container_name(container_name)?;
            Workload::Container {
                image: image.to_string(),
                container_name: container_name.to_string(),
                ports: match ports {
                    Some(ports) => parse_ports(ports)?,
                    None => Vec::new(),
                },
            }
        }
    };

    Ok(DeploymentRequest {
        target_id: body.target_id,
        workload,
    })
}

/// Parse `host:container[,host:container...]`
pub fn parse_ports(ports: &str) -> Result<Vec<PortMapping>, PortalError> {
    ports
        .split(',')
        .map(|entry| {
            entry
                .parse::<PortMapping>()
                .map_err(|e| PortalError::ValidationError(format!("invalid ports: {}", e)))
        })
        .collect()
}

/// Container names follow the engine's `[A-Za-z0-9][A-Za-z0-9_.-]*` rule
pub fn validate_container_name(name: &str) -> Result<(), PortalError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            first.is_ascii_alphanumeric()
                && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        }
        None => false,
    };

    if valid {
        Ok(())
    } else {
        Err(PortalError::ValidationError(format!(
            "invalid container name '{}'",
            name
        )))
    }
}

fn validate_image(image: &str) -> Result<(), PortalError> {
    if image.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(PortalError::ValidationError(format!(
            "invalid image reference '{}'",
            image
        )));
    }
    Ok(())
}

fn validate_compose_path(path: &str) -> Result<(), PortalError> {
    if path.chars().any(|c| c.is_control()) {
        return Err(PortalError::ValidationError(
            "compose_file_path contains control characters".to_string(),
        ));
    }
    Ok(())
}

/// Env keys must be non-empty and free of `=` and whitespace
pub fn validate_env(env: &EnvVars) -> Result<(), PortalError> {
    for (key, value) in env {
        if key.is_empty() || key.contains('=') || key.chars().any(|c| c.is_whitespace()) {
            return Err(PortalError::ValidationError(format!(
                "invalid environment variable name '{}'",
                key
            )));
        }
        if value.contains('\0') {
            return Err(PortalError::ValidationError(format!(
                "environment variable '{}' contains a NUL byte",
                key
            )));
        }
    }
    Ok(())
}

// ================================== QUOTING ====================================== //

/// Quote a word for a POSIX shell. Safe words are returned unchanged.
pub fn shell_quote(word: &str) -> Cow<'_, str> {
    let safe = !word.is_empty()
        && word.chars().all(|c| {
            c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | ':' | '@' | '%' | '+' | '=' | ',')
        });

    if safe {
        Cow::Borrowed(word)
    } else {
        Cow::Owned(format!("'{}'", word.replace('\'', r"'\''")))
    }
}

// =================================== PLANS ======================================= //

fn run_command(
    container_name: &str,
    image: &str,
    ports: &[PortMapping],
    env: Option<&EnvVars>,
    restart_policy: Option<&str>,
) -> String {
    let mut cmd = format!("docker run -d --name {}", shell_quote(container_name));

    if let Some(policy) = restart_policy {
        cmd.push_str(&format!(" --restart {}", shell_quote(policy)));
    }
    for port in ports {
        cmd.push_str(&format!(" -p {}", port));
    }
    if let Some(env) = env {
        for (key, value) in env {
            cmd.push_str(&format!(" -e {}", shell_quote(&format!("{}={}", key, value))));
        }
    }

    cmd.push(' ');
    cmd.push_str(&shell_quote(image));
    cmd
}

fn remove_steps(container_name: &str) -> [CommandStep; 2] {
    let name = shell_quote(container_name);
    [
        CommandStep::optional(
            format!("docker stop {}", name),
            format!("Stop existing container {}", container_name),
        ),
        CommandStep::optional(
            format!("docker rm {}", name),
            format!("Remove existing container {}", container_name),
        ),
    ]
}

/// Build the command plan for a workload
pub fn plan(workload: &Workload) -> CommandPlan {
    match workload {
        Workload::Container {
            image,
            container_name,
            ports,
        } => {
            let mut steps = vec![CommandStep::required(
                format!("docker pull {}", shell_quote(image)),
                format!("Pull image {}", image),
            )];
            steps.extend(remove_steps(container_name));
            steps.push(CommandStep::required(
                run_command(container_name, image, ports, None, None),
                format!("Start container {}", container_name),
            ));
            CommandPlan { steps }
        }
        Workload::Compose { compose_file_path } => CommandPlan {
            steps: vec![CommandStep::required(
                format!("docker compose -f {} up -d", shell_quote(compose_file_path)),
                format!("Apply Compose stack {}", compose_file_path),
            )],
        },
    }
}

/// Plan that replaces a running container with one carrying `env`
pub fn recreate_plan(spec: &RecreateSpec<'_>) -> CommandPlan {
    let mut steps: Vec<CommandStep> = remove_steps(spec.container_name).into();
    // The old container must be gone before the name can be reused
    for step in &mut steps {
        step.ignore_failure = false;
    }
    steps.push(CommandStep::required(
        run_command(
            spec.container_name,
            spec.image,
            spec.ports,
            Some(spec.env),
            spec.restart_policy,
        ),
        format!("Recreate container {}", spec.container_name),
    ));
    CommandPlan { steps }
}

// ================================== MESSAGES ===================================== //

/// One-line description of what `request` would do on `target`
pub fn preview(request: &DeploymentRequest, target: &Target) -> Preview {
    let summary = match &request.workload {
        Workload::Container {
            image,
            container_name,
            ports,
        } => {
            let port_info = if ports.is_empty() {
                String::new()
            } else {
                format!(" on ports {}", format_ports(ports))
            };
            format!(
                "Would deploy Docker container '{}' using image '{}'{} to VM {} ({})",
                container_name, image, port_info, target.name, target.address
            )
        }
        Workload::Compose { compose_file_path } => format!(
            "Would deploy Docker Compose stack from '{}' to VM {} ({})",
            compose_file_path, target.name, target.address
        ),
    };

    Preview {
        summary,
        commands: plan(&request.workload).commands(),
    }
}

/// Status message of a freshly accepted deployment
pub fn queued_message(workload: &Workload, target: &Target) -> String {
    match workload {
        Workload::Container {
            image,
            container_name,
            ports,
        } => {
            let port_info = if ports.is_empty() {
                String::new()
            } else {
                format!(" with ports {}", format_ports(ports))
            };
            format!(
                "Docker deployment queued: {} ({}){} to {}",
                container_name, image, port_info, target.address
            )
        }
        Workload::Compose { compose_file_path } => format!(
            "Docker Compose deployment queued: '{}' to {}",
            compose_file_path, target.address
        ),
    }
}

/// Status message of a successful deployment. `last_output` is the final stdout
/// line of the last step (the container id for `docker run -d`).
pub fn success_message(workload: &Workload, last_output: Option<&str>) -> String {
    match workload {
        Workload::Container { container_name, .. } => {
            match last_output.map(str::trim).filter(|s| !s.is_empty()) {
                Some(id) => format!(
                    "Container {} deployed successfully (ID: {})",
                    container_name,
                    id.chars().take(12).collect::<String>()
                ),
                None => format!("Container {} deployed successfully", container_name),
            }
        }
        Workload::Compose { compose_file_path } => format!(
            "Docker Compose stack deployed successfully from {}",
            compose_file_path
        ),
    }
}

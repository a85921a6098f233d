//! Docker infrastructure adapter.
//!
//! Drives the `docker` CLI (or a CLI-compatible runtime, see the podman
//! module) to provision, snapshot and tear down workspace machines.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::InfrastructureConfig;
use crate::error::{InfraError, Result};
use crate::spec::{
    InstanceEvent, InstanceKey, InstanceTarget, MachineSpec, ProvisionedInstance, MACHINE_LABEL,
    WORKSPACE_LABEL,
};
use crate::Infrastructure;

pub mod command;
pub mod events;

pub use command::{classify_failure, ContainerCommand};
pub use events::parse_event_line;

/// Which CLI dialect the adapter speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliFlavor {
    Docker,
    Podman,
}

#[derive(Debug, Clone)]
pub struct DockerInfrastructure {
    binary: String,
    flavor: CliFlavor,
    snapshot_repository: String,
}

impl DockerInfrastructure {
    /// Create a new Docker adapter, checking that the CLI is installed.
    pub fn new(config: &InfrastructureConfig) -> Result<Self> {
        Self::with_cli("docker", CliFlavor::Docker, config)
    }

    pub(crate) fn with_cli(binary: &str, flavor: CliFlavor, config: &InfrastructureConfig) -> Result<Self> {
        which::which(binary).map_err(|_| InfraError::Provider(format!("Dependency not found: {binary}")))?;

        Ok(Self {
            binary: binary.to_string(),
            flavor,
            snapshot_repository: config.snapshot_repository.clone(),
        })
    }

    fn command(&self) -> ContainerCommand {
        ContainerCommand::new(&self.binary)
    }

    /// Arguments for `create`, shared by fresh provisioning and restores.
    fn create_args(&self, target: &InstanceTarget, spec: &MachineSpec, image: &str, pull_never: bool) -> Vec<String> {
        let mut args = vec![
            "--name".to_string(),
            target.name.clone(),
            "--label".to_string(),
            format!("{MACHINE_LABEL}={}", target.machine_id),
            "--label".to_string(),
            format!("{WORKSPACE_LABEL}={}", target.workspace_id),
        ];

        if pull_never {
            args.push("--pull=never".to_string());
        }
        if let Some(mb) = spec.memory_limit_mb {
            args.push("--memory".to_string());
            args.push(format!("{mb}m"));
        }
        if let Some(cpus) = spec.cpu_limit {
            args.push("--cpus".to_string());
            args.push(cpus.to_string());
        }
        for (key, value) in &spec.labels {
            args.push("--label".to_string());
            args.push(format!("{key}={value}"));
        }
        for (key, value) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }

        args.push(image.to_string());
        args.extend(spec.command.iter().cloned());
        args
    }

    fn snapshot_reference(&self, instance: &str) -> (String, String) {
        let repository = format!(
            "{}/{}",
            self.snapshot_repository,
            sanitize_repository_component(instance)
        );
        let tag = Uuid::new_v4().simple().to_string();
        (repository, tag)
    }

    fn events_args(&self) -> Vec<String> {
        let format = match self.flavor {
            CliFlavor::Docker => "{{json .}}",
            CliFlavor::Podman => "json",
        };
        let died = match self.flavor {
            CliFlavor::Docker => "event=die",
            CliFlavor::Podman => "event=died",
        };
        vec![
            "--format".to_string(),
            format.to_string(),
            "--filter".to_string(),
            "type=container".to_string(),
            "--filter".to_string(),
            died.to_string(),
            "--filter".to_string(),
            "event=oom".to_string(),
            "--filter".to_string(),
            format!("label={MACHINE_LABEL}"),
        ]
    }
}

/// Image repository components only allow lowercase alphanumerics and separators.
fn sanitize_repository_component(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

fn image_reference(key: &InstanceKey) -> Result<String> {
    let repository = key
        .get("repository")
        .ok_or_else(|| InfraError::SourceNotFound(format!("Instance key has no repository: {key}")))?;
    Ok(match key.get("tag") {
        Some(tag) => format!("{repository}:{tag}"),
        None => repository.to_string(),
    })
}

#[async_trait]
impl Infrastructure for DockerInfrastructure {
    fn name(&self) -> &'static str {
        match self.flavor {
            CliFlavor::Docker => "docker",
            CliFlavor::Podman => "podman",
        }
    }

    #[instrument(skip(self, spec), fields(machine_id = %target.machine_id, image = %spec.image))]
    async fn create(&self, target: &InstanceTarget, spec: &MachineSpec) -> Result<ProvisionedInstance> {
        let instance_id = self
            .command()
            .subcommand("create")
            .args(self.create_args(target, spec, &spec.image, false))
            .output()
            .await?;

        info!("Created container {} ({})", target.name, instance_id);
        Ok(ProvisionedInstance {
            name: target.name.clone(),
            instance_id,
        })
    }

    #[instrument(skip(self))]
    async fn start(&self, instance: &str) -> Result<()> {
        self.command().subcommand("start").arg(instance).output().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn stop(&self, instance: &str) -> Result<()> {
        self.command()
            .subcommand("stop")
            .arg(instance)
            .output_ignoring_missing()
            .await
    }

    #[instrument(skip(self))]
    async fn snapshot(&self, instance: &str) -> Result<InstanceKey> {
        let (repository, tag) = self.snapshot_reference(instance);
        let digest = self
            .command()
            .subcommand("commit")
            .arg(instance)
            .arg(format!("{repository}:{tag}"))
            .output()
            .await?;

        info!("Committed {} to {}:{}", instance, repository, tag);
        Ok(InstanceKey::new([
            ("repository", repository),
            ("tag", tag),
            ("digest", digest),
        ]))
    }

    #[instrument(skip(self, spec), fields(machine_id = %target.machine_id, key = %key))]
    async fn restore(
        &self,
        target: &InstanceTarget,
        key: &InstanceKey,
        spec: &MachineSpec,
    ) -> Result<ProvisionedInstance> {
        let image = image_reference(key)?;
        let instance_id = self
            .command()
            .subcommand("create")
            .args(self.create_args(target, spec, &image, true))
            .output()
            .await?;

        info!("Restored container {} from {}", target.name, image);
        Ok(ProvisionedInstance {
            name: target.name.clone(),
            instance_id,
        })
    }

    #[instrument(skip(self))]
    async fn remove(&self, instance: &str) -> Result<()> {
        self.command()
            .subcommand("rm")
            .args(["-f", "-v", instance])
            .output_ignoring_missing()
            .await
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn remove_snapshot(&self, key: &InstanceKey) -> Result<()> {
        let image = match image_reference(key) {
            Ok(image) => image,
            Err(_) => {
                warn!("Ignoring snapshot removal for key without repository: {}", key);
                return Ok(());
            }
        };
        self.command()
            .subcommand("rmi")
            .arg(image)
            .output_ignoring_missing()
            .await
    }

    async fn watch(&self, events: mpsc::Sender<InstanceEvent>) -> Result<()> {
        let mut child = self
            .command()
            .subcommand("events")
            .args(self.events_args())
            .spawn_streaming()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| InfraError::Provider("Event stream has no stdout".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();

        info!("Watching {} container events", self.name());

        loop {
            tokio::select! {
                _ = events.closed() => {
                    debug!("Event receiver dropped, closing stream");
                    break;
                }
                line = lines.next_line() => match line? {
                    Some(line) => {
                        if let Some(event) = parse_event_line(&line) {
                            debug!(machine_id = %event.machine_id, kind = ?event.kind, "Container event");
                            if events.send(event).await.is_err() {
                                break;
                            }
                        }
                    }
                    None => {
                        warn!("{} event stream ended", self.name());
                        break;
                    }
                }
            }
        }

        let _ = child.kill().await;
        Ok(())
    }
}

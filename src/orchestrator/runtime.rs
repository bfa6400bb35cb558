//! Process runtimes that turn a [`ProcessSpec`] into a running worker.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum};
use bollard::network::{CreateNetworkOptions, InspectNetworkOptions};
use futures::StreamExt;
use tokio::sync::OnceCell;

use crate::orchestrator::error::{OrchestratorError, Result};
use crate::orchestrator::spec::{MANAGED_LABEL, ProcessSpec};

/// Seconds a container gets to exit after SIGTERM.
const STOP_GRACE_SECS: i64 = 10;

/// Starts and stops integration worker processes.
#[async_trait]
pub trait ProcessRuntime: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Start a long-running worker bound to `spec.port`, returning its id.
    async fn launch(&self, spec: &ProcessSpec) -> Result<String>;

    /// Stop and remove a worker. A worker that no longer exists is not an error.
    async fn terminate(&self, process_id: &str) -> Result<()>;

    /// Ids of every worker this orchestrator owns, tracked or not.
    async fn list_managed(&self) -> Result<Vec<String>>;
}

/// Runs integration workers as Docker containers.
pub struct DockerRuntime {
    docker: Docker,
    /// Network is created at most once per process.
    network_ready: OnceCell<()>,
    auto_pull: bool,
}

impl DockerRuntime {
    /// Connect to the local Docker daemon and check it responds.
    pub async fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| {
            OrchestratorError::RuntimeUnavailable {
                reason: e.to_string(),
            }
        })?;
        docker
            .ping()
            .await
            .map_err(|e| OrchestratorError::RuntimeUnavailable {
                reason: e.to_string(),
            })?;

        tracing::debug!("Connected to Docker daemon");
        Ok(Self {
            docker,
            network_ready: OnceCell::new(),
            auto_pull: true,
        })
    }

    /// Disable pulling images that are missing locally.
    pub fn without_auto_pull(mut self) -> Self {
        self.auto_pull = false;
        self
    }

    async fn ensure_network(&self, network: &str) -> Result<()> {
        self.network_ready
            .get_or_try_init(|| async {
                if self
                    .docker
                    .inspect_network(network, None::<InspectNetworkOptions<String>>)
                    .await
                    .is_ok()
                {
                    return Ok(());
                }

                tracing::info!(network, "Creating Docker network");
                self.docker
                    .create_network(CreateNetworkOptions {
                        name: network.to_string(),
                        driver: "bridge".to_string(),
                        ..Default::default()
                    })
                    .await
                    .map(|_| ())
                    .map_err(|e| OrchestratorError::RuntimeUnavailable {
                        reason: format!("cannot create network '{}': {}", network, e),
                    })
            })
            .await
            .map(|_| ())
    }

    async fn pull_image(&self, spec: &ProcessSpec) -> Result<()> {
        if self.docker.inspect_image(&spec.image).await.is_ok() {
            tracing::debug!(image = %spec.image, "Image exists locally");
            return Ok(());
        }
        if !self.auto_pull {
            return Err(OrchestratorError::LaunchFailed {
                name: spec.name.clone(),
                reason: format!("image {} not found and auto_pull is disabled", spec.image),
            });
        }

        tracing::info!(image = %spec.image, "Pulling image");

        let options = CreateImageOptions {
            from_image: spec.image.clone(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);

        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        tracing::trace!("Pull status: {}", status);
                    }
                }
                Err(e) => {
                    return Err(OrchestratorError::LaunchFailed {
                        name: spec.name.clone(),
                        reason: format!("pull of {} failed: {}", spec.image, e),
                    });
                }
            }
        }

        Ok(())
    }

    fn container_config(spec: &ProcessSpec) -> Config<String> {
        let container_port = format!("{}/tcp", spec.internal_port);

        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            container_port.clone(),
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                host_port: Some(spec.port.to_string()),
            }]),
        );

        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(container_port, HashMap::new());

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            network_mode: Some(spec.network.clone()),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                maximum_retry_count: None,
            }),
            auto_remove: Some(false),
            ..Default::default()
        };

        Config {
            image: Some(spec.image.clone()),
            cmd: if spec.args.is_empty() {
                None
            } else {
                Some(spec.args.clone())
            },
            env: Some(spec.env_pairs()),
            exposed_ports: Some(exposed_ports),
            labels: Some(spec.labels.iter().cloned().collect()),
            host_config: Some(host_config),
            ..Default::default()
        }
    }
}

fn is_not_found(e: &DockerError) -> bool {
    matches!(
        e,
        DockerError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

#[async_trait]
impl ProcessRuntime for DockerRuntime {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn launch(&self, spec: &ProcessSpec) -> Result<String> {
        self.ensure_network(&spec.network).await?;
        self.pull_image(spec).await?;

        // Leftover from a previous run holds the name.
        let _ = self
            .docker
            .remove_container(
                &spec.name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };
        let created = self
            .docker
            .create_container(Some(options), Self::container_config(spec))
            .await
            .map_err(|e| OrchestratorError::LaunchFailed {
                name: spec.name.clone(),
                reason: e.to_string(),
            })?;

        if let Err(e) = self
            .docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
        {
            let _ = self.terminate(&created.id).await;
            return Err(OrchestratorError::LaunchFailed {
                name: spec.name.clone(),
                reason: e.to_string(),
            });
        }

        tracing::info!(
            container = %spec.name,
            image = %spec.image,
            port = spec.port,
            "Started integration container"
        );
        Ok(created.id)
    }

    async fn terminate(&self, process_id: &str) -> Result<()> {
        match self
            .docker
            .stop_container(process_id, Some(StopContainerOptions { t: STOP_GRACE_SECS }))
            .await
        {
            Ok(()) => {}
            Err(e) if is_not_found(&e) => return Ok(()),
            // 304: already stopped
            Err(DockerError::DockerResponseServerError {
                status_code: 304, ..
            }) => {}
            Err(e) => {
                tracing::debug!(process_id, "Graceful stop failed, forcing removal: {}", e);
            }
        }

        match self
            .docker
            .remove_container(
                process_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(OrchestratorError::TerminateFailed {
                process_id: process_id.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn list_managed(&self) -> Result<Vec<String>> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{}=true", MANAGED_LABEL)],
        );

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| OrchestratorError::RuntimeUnavailable {
                reason: e.to_string(),
            })?;

        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::catalog::{CustomerSpec, IntegrationCatalog, IntegrationParams};
    use crate::config::OrchestratorConfig;
    use crate::integration::IntegrationType;
    use crate::orchestrator::spec::ProcessSpecBuilder;

    #[test]
    fn test_container_config_binds_host_port() {
        let catalog = IntegrationCatalog::from_customers([CustomerSpec::new("Acme")
            .with_integration(
                IntegrationType::Metrics,
                IntegrationParams::default().with_credential("token", "t"),
            )]);
        let spec = ProcessSpecBuilder::new(
            Arc::new(catalog),
            Arc::new(OrchestratorConfig::default()),
        )
        .build("Acme", IntegrationType::Metrics, 9123)
        .unwrap();

        let config = DockerRuntime::container_config(&spec);
        let host = config.host_config.unwrap();
        let bindings = host.port_bindings.unwrap();
        let binding = bindings["8000/tcp"].as_ref().unwrap();
        assert_eq!(binding[0].host_port.as_deref(), Some("9123"));
        assert_eq!(host.network_mode.as_deref(), Some("toolfleet-net"));

        let labels = config.labels.unwrap();
        assert_eq!(labels.get(MANAGED_LABEL).map(String::as_str), Some("true"));
        assert_eq!(config.cmd.unwrap()[0], "--transport");
        assert!(
            config
                .env
                .unwrap()
                .contains(&"GRAFANA_SERVICE_ACCOUNT_TOKEN=t".to_string())
        );
    }
}

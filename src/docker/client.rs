use anyhow::{Context, Result};
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::ContainerInspectResponse;
use bollard::network::{CreateNetworkOptions, InspectNetworkOptions};
use bollard::Docker;
use futures::stream::StreamExt;
use std::collections::HashMap;
use tracing::{debug, error, info, warn};

/// Thin wrapper around the bollard handle. All runtime calls the pool makes
/// go through here so the pool itself stays free of bollard types.
pub struct DockerClient {
    docker: Docker,
}

impl DockerClient {
    pub async fn new() -> Result<Self> {
        let docker = Docker::connect_with_socket_defaults()?;

        // Test connection
        let version = docker
            .version()
            .await
            .context("Failed to connect to Docker daemon")?;

        info!(
            "Connected to Docker daemon version: {}",
            version.version.unwrap_or_default()
        );

        Ok(Self { docker })
    }

    /// Create the isolated bridge network if it does not exist yet.
    /// Inter-container traffic is disabled; outbound stays permitted.
    pub async fn ensure_network(&self, name: &str) -> Result<()> {
        if self
            .docker
            .inspect_network(name, None::<InspectNetworkOptions<String>>)
            .await
            .is_ok()
        {
            debug!("Network {} already exists", name);
            return Ok(());
        }

        let mut options = HashMap::new();
        options.insert(
            "com.docker.network.bridge.enable_icc".to_string(),
            "false".to_string(),
        );

        self.docker
            .create_network(CreateNetworkOptions {
                name: name.to_string(),
                driver: "bridge".to_string(),
                options,
                ..Default::default()
            })
            .await
            .context("Failed to create isolated network")?;

        info!("Created isolated network: {}", name);
        Ok(())
    }

    pub async fn pull_image(&self, image: &str) -> Result<()> {
        info!("Pulling Docker image: {}", image);

        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);

        while let Some(progress) = stream.next().await {
            match progress {
                Ok(progress) => {
                    if let Some(status) = progress.status {
                        debug!("Pull status: {}", status);
                    }
                }
                Err(e) => {
                    error!("Error pulling image: {}", e);
                    return Err(anyhow::anyhow!("Failed to pull image: {}", e));
                }
            }
        }

        info!("Successfully pulled image: {}", image);
        Ok(())
    }

    pub async fn image_exists(&self, image: &str) -> bool {
        self.docker.inspect_image(image).await.is_ok()
    }

    pub async fn create_container(&self, name: &str, config: Config<String>) -> Result<String> {
        let options = CreateContainerOptions {
            name,
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .context("Failed to create container")?;

        info!("Created container {} with ID: {}", name, response.id);
        Ok(response.id)
    }

    pub async fn start_container(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .context("Failed to start container")?;

        Ok(())
    }

    pub async fn stop_container(&self, id: &str, timeout_secs: i64) -> Result<()> {
        let options = StopContainerOptions { t: timeout_secs };

        self.docker
            .stop_container(id, Some(options))
            .await
            .context("Failed to stop container")?;

        Ok(())
    }

    pub async fn remove_container(&self, id: &str, force: bool) -> Result<()> {
        let options = RemoveContainerOptions {
            force,
            ..Default::default()
        };

        self.docker
            .remove_container(id, Some(options))
            .await
            .context("Failed to remove container")?;

        info!("Removed container: {}", id);
        Ok(())
    }

    pub async fn inspect_container(&self, id: &str) -> Result<ContainerInspectResponse> {
        self.docker
            .inspect_container(id, None)
            .await
            .context("Failed to inspect container")
    }

    pub async fn list_container_names(&self) -> Result<Vec<String>> {
        let options = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .context("Failed to list containers")?;

        // Docker reports names with a leading slash
        Ok(containers
            .into_iter()
            .flat_map(|c| c.names.unwrap_or_default())
            .map(|n| n.trim_start_matches('/').to_string())
            .collect())
    }

    /// Run a command inside a container and wait for it to finish,
    /// discarding output. Used for the fire-and-forget URL launch.
    pub async fn exec_command(&self, container: &str, cmd: Vec<String>) -> Result<()> {
        let exec_config = CreateExecOptions {
            cmd: Some(cmd),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(container, exec_config)
            .await
            .context("Failed to create exec")?;

        let start_exec = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .context("Failed to start exec")?;

        if let StartExecResults::Attached { mut output, .. } = start_exec {
            while let Some(msg) = output.next().await {
                if let Err(e) = msg {
                    warn!("Error reading exec output: {}", e);
                }
            }
        }

        Ok(())
    }
}

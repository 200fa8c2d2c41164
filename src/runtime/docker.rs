//! Docker Engine runtime implementation.
//!
//! Talks to the daemon over the Engine API through `bollard`. The daemon
//! address comes from the [`RuntimeEndpoint`] resolved at startup.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, InspectContainerOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
    WaitContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::{BuildImageOptions, CreateImageOptions};
use bollard::models::{HostConfig, PortBinding};
use futures::StreamExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

use super::{
    BuildRequest, ContainerRuntime, ContainerSpec, ExecOutput, OutputChunk, OutputStream,
    PublishedPort, RuntimeEndpoint, RuntimeError, RuntimeResult,
};

/// Seconds before an Engine API request is abandoned.
const REQUEST_TIMEOUT_SECS: u64 = 120;

/// Docker Engine runtime.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to the daemon at `endpoint`.
    pub fn connect(endpoint: &RuntimeEndpoint) -> RuntimeResult<Self> {
        let docker = match endpoint {
            RuntimeEndpoint::Tcp { .. } => Docker::connect_with_http(
                &endpoint.to_string(),
                REQUEST_TIMEOUT_SECS,
                bollard::API_DEFAULT_VERSION,
            ),
            #[cfg(unix)]
            RuntimeEndpoint::Unix(path) => Docker::connect_with_unix(
                &path.to_string_lossy(),
                REQUEST_TIMEOUT_SECS,
                bollard::API_DEFAULT_VERSION,
            ),
            _ => Docker::connect_with_local_defaults(),
        }
        .map_err(|e| RuntimeError::Connection(e.to_string()))?;

        Ok(Self { docker })
    }

    /// Pull `image` unless it is already present locally.
    async fn ensure_image(&self, image: &str) -> RuntimeResult<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        info!("Pulling image {}", image);
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut pull = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = pull.next().await {
            let progress = progress.map_err(|e| {
                RuntimeError::CreateFailed(format!("pulling {}: {}", image, e))
            })?;
            if let Some(status) = progress.status {
                debug!("{}: {}", image, status);
            }
        }

        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        self.ensure_image(&spec.image).await?;

        let mut host_config = HostConfig {
            network_mode: spec.network_mode.clone(),
            ..Default::default()
        };

        let exposed_ports = spec.exposed_port.map(|port| {
            let key = format!("{}/tcp", port);
            // An empty binding asks the daemon for an ephemeral host port
            host_config.port_bindings = Some(HashMap::from([(
                key.clone(),
                Some(vec![PortBinding::default()]),
            )]));
            HashMap::from([(key, HashMap::new())])
        });

        let labels = (!spec.labels.is_empty()).then(|| spec.labels.clone());

        let container_config = ContainerConfig {
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            exposed_ports,
            entrypoint: spec.entrypoint.clone(),
            cmd: spec.cmd.clone(),
            labels,
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = spec.name.as_ref().map(|name| CreateContainerOptions {
            name: name.clone(),
            platform: None,
        });

        let response = self
            .docker
            .create_container(options, container_config)
            .await
            .map_err(|e| RuntimeError::CreateFailed(e.to_string()))?;

        for warning in &response.warnings {
            debug!("create {}: {}", response.id, warning);
        }

        Ok(response.id)
    }

    async fn start(&self, id: &str) -> RuntimeResult<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| RuntimeError::StartFailed(e.to_string()))
    }

    async fn inspect(&self, id: &str) -> RuntimeResult<Vec<PublishedPort>> {
        let info = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| RuntimeError::InspectFailed(e.to_string()))?;

        let ports = info
            .network_settings
            .and_then(|settings| settings.ports)
            .unwrap_or_default();

        let mut published = Vec::new();
        for (key, bindings) in ports {
            let Some(container_port) = key.split('/').next().and_then(|p| p.parse().ok()) else {
                continue;
            };
            for binding in bindings.unwrap_or_default() {
                let Some(host_port) = binding.host_port.as_deref().and_then(|p| p.parse().ok())
                else {
                    continue;
                };
                published.push(PublishedPort {
                    container_port,
                    host_ip: binding.host_ip.unwrap_or_default(),
                    host_port,
                });
            }
        }

        Ok(published)
    }

    async fn exec(&self, id: &str, cmd: &[String]) -> RuntimeResult<ExecOutput> {
        let exec_options = CreateExecOptions {
            cmd: Some(cmd.to_vec()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(id, exec_options)
            .await
            .map_err(|e| RuntimeError::ExecFailed(e.to_string()))?;

        let started = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| RuntimeError::ExecFailed(e.to_string()))?;

        let mut output = String::new();
        if let StartExecResults::Attached { output: mut stream, .. } = started {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(LogOutput::StdOut { message }) | Ok(LogOutput::StdErr { message }) => {
                        output.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(_) => {}
                    Err(e) => return Err(RuntimeError::ExecFailed(e.to_string())),
                }
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| RuntimeError::ExecFailed(e.to_string()))?;

        Ok(ExecOutput {
            exit_code: inspect.exit_code.unwrap_or(-1),
            output,
        })
    }

    async fn stop(&self, id: &str, grace: Duration) -> RuntimeResult<()> {
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };
        self.docker
            .stop_container(id, Some(options))
            .await
            .map_err(|e| RuntimeError::StopFailed(e.to_string()))
    }

    async fn remove(&self, id: &str) -> RuntimeResult<()> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| RuntimeError::RemoveFailed(e.to_string()))
    }

    async fn logs(&self, id: &str, follow: bool) -> RuntimeResult<OutputStream> {
        let options = LogsOptions::<String> {
            follow,
            stdout: true,
            stderr: true,
            ..Default::default()
        };

        let stream = self.docker.logs(id, Some(options)).filter_map(|msg| async {
            match msg {
                Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                    Some(Ok(OutputChunk::Stdout(message.to_vec())))
                }
                Ok(LogOutput::StdErr { message }) => {
                    Some(Ok(OutputChunk::Stderr(message.to_vec())))
                }
                Ok(LogOutput::StdIn { .. }) => None,
                Err(e) => Some(Err(RuntimeError::LogsFailed(e.to_string()))),
            }
        });

        Ok(Box::pin(stream))
    }

    async fn wait(&self, id: &str) -> RuntimeResult<i64> {
        let mut stream = self
            .docker
            .wait_container(id, None::<WaitContainerOptions<String>>);

        let mut exit_code = None;
        while let Some(response) = stream.next().await {
            match response {
                Ok(response) => exit_code = Some(response.status_code),
                // Non-zero exits are reported as errors by the Engine API
                Err(bollard::errors::Error::DockerContainerWaitError { code, .. }) => {
                    exit_code = Some(code)
                }
                Err(e) => return Err(RuntimeError::WaitFailed(e.to_string())),
            }
        }

        exit_code.ok_or_else(|| RuntimeError::WaitFailed("no exit status reported".to_string()))
    }

    async fn build_image(
        &self,
        request: &BuildRequest,
        output: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> RuntimeResult<()> {
        let context = create_tar_archive(&request.context_dir)
            .map_err(|e| RuntimeError::BuildFailed(format!("packing build context: {}", e)))?;

        let options = BuildImageOptions {
            dockerfile: request.dockerfile.clone(),
            t: request.image.clone(),
            rm: true,
            forcerm: true,
            ..Default::default()
        };

        let mut stream = self
            .docker
            .build_image(options, None, Some(context.into()));

        while let Some(info) = stream.next().await {
            let info = info.map_err(|e| RuntimeError::BuildFailed(e.to_string()))?;
            if let Some(error) = info.error {
                return Err(RuntimeError::BuildFailed(error));
            }
            if let Some(line) = info.stream {
                output.write_all(line.as_bytes()).await?;
            }
        }
        output.flush().await?;

        Ok(())
    }

    fn name(&self) -> &'static str {
        "docker"
    }
}

/// Pack a build context directory into a tar archive.
fn create_tar_archive(dir: &Path) -> std::io::Result<Vec<u8>> {
    let mut archive = tar::Builder::new(Vec::new());
    archive.follow_symlinks(false);
    archive.append_dir_all(".", dir)?;
    archive.into_inner()
}

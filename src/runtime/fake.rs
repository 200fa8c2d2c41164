//! Recording in-memory runtime used by unit tests.
//!
//! Published ports are backed by real loopback listeners so the readiness
//! probe has something to connect to.

use std::collections::{HashMap, HashSet};
use std::net::TcpListener;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::{
    BuildRequest, ContainerRuntime, ContainerSpec, ExecOutput, OutputChunk, OutputStream,
    PublishedPort, RuntimeError, RuntimeResult,
};

struct FakeContainer {
    spec: ContainerSpec,
    port: Option<PublishedPort>,
    _listener: Option<TcpListener>,
    removed: bool,
}

#[derive(Default)]
pub(crate) struct FakeRuntime {
    ops: Mutex<Vec<String>>,
    containers: Mutex<HashMap<String, FakeContainer>>,
    next_id: Mutex<usize>,
    fail_create: HashSet<String>,
    unreachable: HashSet<String>,
    unpublished: HashSet<String>,
    unbound_host: HashSet<String>,
    failing_commands: HashSet<String>,
    fail_build: bool,
    exit_code: i64,
    log_chunks: Vec<OutputChunk>,
}

impl FakeRuntime {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Creating a container from `image` fails.
    pub(crate) fn fail_create(mut self, image: &str) -> Self {
        self.fail_create.insert(image.to_string());
        self
    }

    /// Containers from `image` publish a port nobody listens on.
    pub(crate) fn unreachable(mut self, image: &str) -> Self {
        self.unreachable.insert(image.to_string());
        self
    }

    /// Containers from `image` report no published ports.
    pub(crate) fn unpublished(mut self, image: &str) -> Self {
        self.unpublished.insert(image.to_string());
        self
    }

    /// Containers from `image` report an empty host address.
    pub(crate) fn unbound_host(mut self, image: &str) -> Self {
        self.unbound_host.insert(image.to_string());
        self
    }

    /// Exec of `command` (argv joined with spaces) exits 1.
    pub(crate) fn failing_command(mut self, command: &str) -> Self {
        self.failing_commands.insert(command.to_string());
        self
    }

    pub(crate) fn fail_build(mut self) -> Self {
        self.fail_build = true;
        self
    }

    /// Exit code reported by `wait`.
    pub(crate) fn exit_code(mut self, code: i64) -> Self {
        self.exit_code = code;
        self
    }

    /// Output returned by `logs`.
    pub(crate) fn log_chunks(mut self, chunks: Vec<OutputChunk>) -> Self {
        self.log_chunks = chunks;
        self
    }

    pub(crate) fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    pub(crate) fn ops_starting_with(&self, prefix: &str) -> Vec<String> {
        self.ops()
            .into_iter()
            .filter(|op| op.starts_with(prefix))
            .collect()
    }

    /// Ids of containers created and not yet removed.
    pub(crate) fn live_containers(&self) -> Vec<String> {
        let containers = self.containers.lock().unwrap();
        let mut live: Vec<String> = containers
            .iter()
            .filter(|(_, c)| !c.removed)
            .map(|(id, _)| id.clone())
            .collect();
        live.sort();
        live
    }

    pub(crate) fn created_specs(&self) -> Vec<ContainerSpec> {
        let containers = self.containers.lock().unwrap();
        let mut specs: Vec<(String, ContainerSpec)> = containers
            .iter()
            .map(|(id, c)| (id.clone(), c.spec.clone()))
            .collect();
        specs.sort_by(|a, b| a.0.cmp(&b.0));
        specs.into_iter().map(|(_, spec)| spec).collect()
    }

    fn record(&self, op: impl Into<String>) {
        self.ops.lock().unwrap().push(op.into());
    }

    fn image_of(&self, id: &str) -> Option<String> {
        self.containers
            .lock()
            .unwrap()
            .get(id)
            .map(|c| c.spec.image.clone())
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        self.record(format!("create {}", spec.image));
        if self.fail_create.contains(&spec.image) {
            return Err(RuntimeError::CreateFailed(format!(
                "No such image: {}",
                spec.image
            )));
        }

        let id = {
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            format!("c{}", next)
        };

        let (port, listener) = match spec.exposed_port {
            Some(container_port) => {
                let listener = TcpListener::bind("127.0.0.1:0")?;
                let host_port = listener.local_addr()?.port();
                let port = PublishedPort {
                    container_port,
                    host_ip: "127.0.0.1".to_string(),
                    host_port,
                };
                if self.unreachable.contains(&spec.image) {
                    // dropping the listener leaves a closed port behind
                    (Some(port), None)
                } else {
                    (Some(port), Some(listener))
                }
            }
            None => (None, None),
        };

        self.containers.lock().unwrap().insert(
            id.clone(),
            FakeContainer {
                spec: spec.clone(),
                port,
                _listener: listener,
                removed: false,
            },
        );

        Ok(id)
    }

    async fn start(&self, id: &str) -> RuntimeResult<()> {
        self.record(format!("start {}", id));
        Ok(())
    }

    async fn inspect(&self, id: &str) -> RuntimeResult<Vec<PublishedPort>> {
        self.record(format!("inspect {}", id));
        let containers = self.containers.lock().unwrap();
        let container = containers
            .get(id)
            .ok_or_else(|| RuntimeError::InspectFailed(format!("No such container: {}", id)))?;
        if self.unpublished.contains(&container.spec.image) {
            return Ok(Vec::new());
        }
        let mut ports: Vec<PublishedPort> = container.port.clone().into_iter().collect();
        if self.unbound_host.contains(&container.spec.image) {
            for port in &mut ports {
                port.host_ip.clear();
            }
        }
        Ok(ports)
    }

    async fn exec(&self, id: &str, cmd: &[String]) -> RuntimeResult<ExecOutput> {
        let command = cmd.join(" ");
        self.record(format!("exec {} {}", id, command));
        let exit_code = if self.failing_commands.contains(&command) {
            1
        } else {
            0
        };
        Ok(ExecOutput {
            exit_code,
            output: String::new(),
        })
    }

    async fn stop(&self, id: &str, grace: Duration) -> RuntimeResult<()> {
        self.record(format!("stop {} {}s", id, grace.as_secs()));
        Ok(())
    }

    async fn remove(&self, id: &str) -> RuntimeResult<()> {
        self.record(format!("remove {}", id));
        let mut containers = self.containers.lock().unwrap();
        let container = containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::RemoveFailed(format!("No such container: {}", id)))?;
        container.removed = true;
        container._listener = None;
        Ok(())
    }

    async fn logs(&self, id: &str, follow: bool) -> RuntimeResult<OutputStream> {
        self.record(format!("logs {} follow={}", id, follow));
        let chunks: Vec<RuntimeResult<OutputChunk>> =
            self.log_chunks.iter().cloned().map(Ok).collect();
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    async fn wait(&self, id: &str) -> RuntimeResult<i64> {
        self.record(format!("wait {}", id));
        if self.image_of(id).is_none() {
            return Err(RuntimeError::WaitFailed(format!("No such container: {}", id)));
        }
        Ok(self.exit_code)
    }

    async fn build_image(
        &self,
        request: &BuildRequest,
        output: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> RuntimeResult<()> {
        self.record(format!("build {}", request.image));
        output.write_all(b"Step 1/1 : FROM scratch\n").await?;
        if self.fail_build {
            return Err(RuntimeError::BuildFailed(
                "Dockerfile parse error line 1: unknown instruction: FORM".to_string(),
            ));
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}

//! Container runtime abstraction.
//!
//! Everything temaki does to containers goes through the [`ContainerRuntime`]
//! trait: creating and starting service containers, resolving their published
//! ports, running hooks inside them, tearing them down, and building and
//! running the containerized test image.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      ContainerRuntime                         │
//! │                                                               │
//! │  create(ContainerSpec) ──► container id                       │
//! │  start / stop / remove                                        │
//! │  inspect ──────────────► Vec<PublishedPort>                   │
//! │  exec(argv) ───────────► ExecOutput                           │
//! │  logs(follow) ─────────► OutputStream                         │
//! │  wait ─────────────────► exit code                            │
//! │  build_image(BuildRequest, sink)                              │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The Docker Engine implementation lives in [`docker`]. Implementations must
//! be safe to share between tasks: every service launcher holds an
//! `Arc<dyn ContainerRuntime>` and issues independent calls.

pub mod docker;
#[cfg(test)]
pub(crate) mod fake;

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use tokio::io::AsyncWrite;

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors reported by a container runtime.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Cannot connect to container runtime: {0}")]
    Connection(String),

    #[error("Failed to create container: {0}")]
    CreateFailed(String),

    #[error("Failed to start container: {0}")]
    StartFailed(String),

    #[error("Failed to inspect container: {0}")]
    InspectFailed(String),

    #[error("Failed to execute command: {0}")]
    ExecFailed(String),

    #[error("Failed to stop container: {0}")]
    StopFailed(String),

    #[error("Failed to remove container: {0}")]
    RemoveFailed(String),

    #[error("Failed to stream logs: {0}")]
    LogsFailed(String),

    #[error("Failed to wait for container: {0}")]
    WaitFailed(String),

    #[error("Image build failed: {0}")]
    BuildFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything needed to create a container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    /// Container name; the runtime picks one when absent.
    pub name: Option<String>,
    /// Image reference, e.g. `redis:7`.
    pub image: String,
    /// `NAME=VALUE` assignments.
    pub env: Vec<String>,
    /// Container port (TCP) to publish on an ephemeral host port.
    pub exposed_port: Option<u16>,
    /// Overrides the image entrypoint.
    pub entrypoint: Option<Vec<String>>,
    /// Overrides the image command.
    pub cmd: Option<Vec<String>>,
    /// Docker network mode, e.g. `host`.
    pub network_mode: Option<String>,
    pub labels: HashMap<String, String>,
}

/// A container port published on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedPort {
    /// Port inside the container.
    pub container_port: u16,
    /// Host address the runtime bound, often `0.0.0.0`.
    pub host_ip: String,
    /// Host port the runtime assigned.
    pub host_port: u16,
}

/// Output of a one-shot command executed inside a container.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i64,
    /// Combined stdout and stderr.
    pub output: String,
}

impl ExecOutput {
    /// Check if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A chunk of container output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

/// A boxed stream of container output.
pub type OutputStream = Pin<Box<dyn Stream<Item = RuntimeResult<OutputChunk>> + Send>>;

/// Image build parameters.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// Tag for the built image.
    pub image: String,
    /// Directory sent to the daemon as the build context.
    pub context_dir: PathBuf,
    /// Dockerfile path relative to `context_dir`.
    pub dockerfile: String,
}

/// Capability interface over a container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create a container and return its id.
    ///
    /// Implementations pull the image first when it is not available locally.
    async fn create(&self, spec: &ContainerSpec) -> RuntimeResult<String>;

    /// Start a created container.
    async fn start(&self, id: &str) -> RuntimeResult<()>;

    /// List the published ports of a running container.
    async fn inspect(&self, id: &str) -> RuntimeResult<Vec<PublishedPort>>;

    /// Run a command (already tokenized) inside a container and wait for it.
    async fn exec(&self, id: &str, cmd: &[String]) -> RuntimeResult<ExecOutput>;

    /// Stop a container, killing it after `grace`.
    async fn stop(&self, id: &str, grace: Duration) -> RuntimeResult<()>;

    /// Remove a container and its anonymous volumes.
    async fn remove(&self, id: &str) -> RuntimeResult<()>;

    /// Stream container output. With `follow` the stream ends when the
    /// container stops.
    async fn logs(&self, id: &str, follow: bool) -> RuntimeResult<OutputStream>;

    /// Wait for a container to exit and return its exit code.
    async fn wait(&self, id: &str) -> RuntimeResult<i64>;

    /// Build an image, writing the build log to `output`.
    async fn build_image(
        &self,
        request: &BuildRequest,
        output: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> RuntimeResult<()>;

    /// Runtime name (for logging).
    fn name(&self) -> &'static str;
}

/// Default runtime address when `DOCKER_HOST` is unset.
pub const DEFAULT_DOCKER_HOST: &str = "unix:///var/run/docker.sock";

/// Where the container runtime listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeEndpoint {
    /// Local unix socket.
    Unix(PathBuf),
    /// Remote daemon over TCP.
    Tcp { host: String, port: Option<u16> },
    /// Anything else (named pipes, ssh, ...), passed through untouched.
    Other(String),
}

impl RuntimeEndpoint {
    /// Parse a `DOCKER_HOST`-style address.
    ///
    /// `None` or an empty string yields the default local socket.
    pub fn parse(raw: Option<&str>) -> Self {
        let raw = match raw.map(str::trim) {
            Some(s) if !s.is_empty() => s,
            _ => DEFAULT_DOCKER_HOST,
        };

        if let Some(path) = raw.strip_prefix("unix://") {
            // `unix://var/run/docker.sock` is a common misspelling of the absolute path
            let path = if path.starts_with('/') {
                PathBuf::from(path)
            } else {
                PathBuf::from(format!("/{}", path))
            };
            return RuntimeEndpoint::Unix(path);
        }

        if let Some(rest) = raw.strip_prefix("tcp://") {
            let authority = rest.split('/').next().unwrap_or(rest);
            let (host, port) = split_host_port(authority);
            return RuntimeEndpoint::Tcp { host, port };
        }

        RuntimeEndpoint::Other(raw.to_string())
    }

    /// Returns true for endpoints reached over the network.
    pub fn is_remote(&self) -> bool {
        matches!(self, RuntimeEndpoint::Tcp { .. })
    }

    /// Make a bound host dialable from this machine.
    ///
    /// A wildcard bind on a remote daemon means "every interface of the
    /// daemon host", so the daemon's own host is substituted. Local sockets
    /// leave the host as reported, except that an empty host (Podman's
    /// Docker API reports none) becomes the loopback address.
    pub fn normalize_host(&self, bound: &str) -> String {
        match self {
            RuntimeEndpoint::Tcp { host, .. } if is_wildcard(bound) => host.clone(),
            _ if bound.is_empty() => LOOPBACK_HOST.to_string(),
            _ => bound.to_string(),
        }
    }
}

impl fmt::Display for RuntimeEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeEndpoint::Unix(path) => write!(f, "unix://{}", path.display()),
            RuntimeEndpoint::Tcp {
                host,
                port: Some(port),
            } if host.contains(':') => write!(f, "tcp://[{}]:{}", host, port),
            RuntimeEndpoint::Tcp {
                host,
                port: Some(port),
            } => write!(f, "tcp://{}:{}", host, port),
            RuntimeEndpoint::Tcp { host, port: None } => write!(f, "tcp://{}", host),
            RuntimeEndpoint::Other(raw) => write!(f, "{}", raw),
        }
    }
}

/// Host used for local endpoints when the runtime reports no bind address.
pub const LOOPBACK_HOST: &str = "127.0.0.1";

fn is_wildcard(host: &str) -> bool {
    host.is_empty() || host == "0.0.0.0"
}

fn split_host_port(authority: &str) -> (String, Option<u16>) {
    if let Some(rest) = authority.strip_prefix('[') {
        // [v6]:port
        if let Some((host, tail)) = rest.split_once(']') {
            let port = tail.strip_prefix(':').and_then(|p| p.parse().ok());
            return (host.to_string(), port);
        }
    }

    match authority.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => (host.to_string(), port.parse().ok()),
        _ => (authority.to_string(), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_defaults_to_local_socket() {
        assert_eq!(
            RuntimeEndpoint::parse(None),
            RuntimeEndpoint::Unix(PathBuf::from("/var/run/docker.sock"))
        );
        assert_eq!(
            RuntimeEndpoint::parse(Some("  ")),
            RuntimeEndpoint::Unix(PathBuf::from("/var/run/docker.sock"))
        );
    }

    #[test]
    fn test_parse_relative_unix_path() {
        assert_eq!(
            RuntimeEndpoint::parse(Some("unix://var/run/docker.sock")),
            RuntimeEndpoint::Unix(PathBuf::from("/var/run/docker.sock"))
        );
    }

    #[test]
    fn test_parse_tcp() {
        let endpoint = RuntimeEndpoint::parse(Some("tcp://203.0.113.9:2376"));
        assert_eq!(
            endpoint,
            RuntimeEndpoint::Tcp {
                host: "203.0.113.9".to_string(),
                port: Some(2376),
            }
        );
        assert!(endpoint.is_remote());
        assert_eq!(endpoint.to_string(), "tcp://203.0.113.9:2376");
    }

    #[test]
    fn test_parse_tcp_ipv6_and_hostname() {
        assert_eq!(
            RuntimeEndpoint::parse(Some("tcp://[2001:db8::1]:2375")),
            RuntimeEndpoint::Tcp {
                host: "2001:db8::1".to_string(),
                port: Some(2375),
            }
        );
        assert_eq!(
            RuntimeEndpoint::parse(Some("tcp://docker.internal")),
            RuntimeEndpoint::Tcp {
                host: "docker.internal".to_string(),
                port: None,
            }
        );
    }

    #[test]
    fn test_normalize_wildcard_on_remote_daemon() {
        let endpoint = RuntimeEndpoint::parse(Some("tcp://203.0.113.9:2376"));
        assert_eq!(endpoint.normalize_host("0.0.0.0"), "203.0.113.9");
        assert_eq!(endpoint.normalize_host("127.0.0.1"), "127.0.0.1");
    }

    #[test]
    fn test_normalize_keeps_host_on_local_socket() {
        let endpoint = RuntimeEndpoint::parse(Some("unix:///var/run/docker.sock"));
        assert!(!endpoint.is_remote());
        assert_eq!(endpoint.normalize_host("0.0.0.0"), "0.0.0.0");
    }

    #[test]
    fn test_normalize_empty_host() {
        let local = RuntimeEndpoint::parse(Some("unix:///run/podman/podman.sock"));
        assert_eq!(local.normalize_host(""), "127.0.0.1");

        let remote = RuntimeEndpoint::parse(Some("tcp://203.0.113.9:2376"));
        assert_eq!(remote.normalize_host(""), "203.0.113.9");
    }

    #[test]
    fn test_other_endpoints_pass_through() {
        let endpoint = RuntimeEndpoint::parse(Some("npipe:////./pipe/docker_engine"));
        assert_eq!(
            endpoint,
            RuntimeEndpoint::Other("npipe:////./pipe/docker_engine".to_string())
        );
        assert_eq!(endpoint.normalize_host("0.0.0.0"), "0.0.0.0");
    }
}

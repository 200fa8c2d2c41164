//! Lifecycle of a single service container.
//!
//! A [`ServiceLauncher`] runs as its own task and talks to the orchestrator
//! through three signals:
//!
//! ```text
//!  Orchestrator                         ServiceLauncher
//!       │                                     │ create, start, inspect
//!       │                                     │ probe readiness
//!       │                                     │ pre-run hooks
//!       │◄──────── ready (Ok / Err) ──────────┤
//!       │                                     │ (blocked)
//!       │   ... test command runs ...         │
//!       ├──────────────── quit ──────────────►│
//!       │                                     │ post-run hooks
//!       │                                     │ stop, remove
//!       │◄──────── finished (JoinHandle) ─────┘
//! ```
//!
//! A launcher that fails before reporting ready removes its own container
//! first, so a failed service never leaves anything behind. Cancelling the
//! launcher's token while it starts up (image pull, readiness probe, pre-run
//! hooks) counts as such a failure.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{HooksConfig, ServiceConfig, SettingsConfig};
use crate::hooks::{HookError, HookPhase, HookRunner};
use crate::output::PrefixWriter;
use crate::probe::{ProbeError, ReadinessProbe};
use crate::render::EndpointVars;
use crate::runtime::{
    ContainerRuntime, ContainerSpec, OutputChunk, PublishedPort, RuntimeEndpoint, RuntimeError,
};

/// Label put on every service container.
pub const SERVICE_LABEL: &str = "temaki.service";

/// Seconds a log follower may lag behind container removal.
const LOG_DRAIN_SECS: u64 = 1;

/// A configured service. Read-only once built.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    /// Environment variable that receives the rendered endpoint.
    pub name: String,
    pub image: String,
    /// Container-internal TCP port.
    pub port: u16,
    pub format: String,
    pub env: HashMap<String, String>,
    pub hooks: HooksConfig,
    pub follow_logs: bool,
}

impl ServiceSpec {
    pub fn from_config(name: &str, config: &ServiceConfig) -> Self {
        Self {
            name: name.to_string(),
            image: config.image.clone(),
            port: config.port,
            format: config.format.clone(),
            env: config.env.clone(),
            hooks: config.hooks.clone(),
            follow_logs: config.follow_logs,
        }
    }

    fn container_spec(&self) -> ContainerSpec {
        let mut env: Vec<String> = self
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        env.sort();

        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let name = format!("temaki-{}-{}", self.name.to_lowercase(), &suffix[..8]);

        ContainerSpec {
            name: Some(name),
            image: self.image.clone(),
            env,
            exposed_port: Some(self.port),
            labels: HashMap::from([(SERVICE_LABEL.to_string(), self.name.clone())]),
            ..Default::default()
        }
    }
}

/// A started, reachable service container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchedContainer {
    pub id: String,
    /// Host the published port is reachable on from here.
    pub host: String,
    pub port: u16,
}

impl LaunchedContainer {
    /// `host:port`, bracketing IPv6 hosts.
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn vars(&self) -> EndpointVars {
        EndpointVars {
            host: self.host.clone(),
            port: self.port,
        }
    }
}

/// Per-run knobs shared by every launcher.
#[derive(Debug, Clone)]
pub struct LaunchSettings {
    pub probe: ReadinessProbe,
    pub stop_timeout: Duration,
    pub hook_timeout: Option<Duration>,
    pub endpoint: RuntimeEndpoint,
}

impl LaunchSettings {
    pub fn new(settings: &SettingsConfig, endpoint: RuntimeEndpoint) -> Self {
        Self {
            probe: ReadinessProbe::new(settings.probe_attempts, settings.probe_interval()),
            stop_timeout: settings.stop_timeout(),
            hook_timeout: settings.hook_timeout(),
            endpoint,
        }
    }
}

/// Why a service never became ready.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("failed to create container: {0}")]
    Create(#[source] RuntimeError),

    #[error("failed to start container: {0}")]
    Start(#[source] RuntimeError),

    #[error("failed to inspect container: {0}")]
    Inspect(#[source] RuntimeError),

    #[error("published port not found for {port}/tcp")]
    PortNotFound { port: u16 },

    #[error("service not reachable: {0}")]
    Readiness(#[from] ProbeError),

    #[error(transparent)]
    PreRunHook(#[from] HookError),

    #[error("launcher exited without reporting")]
    Aborted,

    #[error("interrupted before the service became ready")]
    Interrupted,
}

/// What happened while tearing a service down.
#[derive(Debug)]
pub struct TeardownReport {
    pub service: String,
    pub post_run_error: Option<HookError>,
    /// Stop and remove failures.
    pub errors: Vec<RuntimeError>,
}

impl TeardownReport {
    fn new(service: &str) -> Self {
        Self {
            service: service.to_string(),
            post_run_error: None,
            errors: Vec::new(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.post_run_error.is_none() && self.errors.is_empty()
    }
}

pub type ReadySender = oneshot::Sender<Result<LaunchedContainer, LaunchError>>;
pub type ReadyReceiver = oneshot::Receiver<Result<LaunchedContainer, LaunchError>>;

/// Orchestrator side of a spawned launcher.
pub struct LauncherHandle {
    pub service: String,
    pub ready: ReadyReceiver,
    pub quit: oneshot::Sender<()>,
    pub finished: JoinHandle<TeardownReport>,
}

/// Drives one service container through its whole life.
pub struct ServiceLauncher {
    runtime: Arc<dyn ContainerRuntime>,
    spec: ServiceSpec,
    settings: LaunchSettings,
    cancel: CancellationToken,
}

impl ServiceLauncher {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        spec: ServiceSpec,
        settings: LaunchSettings,
    ) -> Self {
        Self {
            runtime,
            spec,
            settings,
            cancel: CancellationToken::new(),
        }
    }

    /// Startup is abandoned when `cancel` fires before the service is ready.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Spawns the launcher task and returns its signals.
    pub fn spawn(self) -> LauncherHandle {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (quit_tx, quit_rx) = oneshot::channel();
        let service = self.spec.name.clone();
        let finished = tokio::spawn(self.run(ready_tx, quit_rx));

        LauncherHandle {
            service,
            ready: ready_rx,
            quit: quit_tx,
            finished,
        }
    }

    /// Runs the lifecycle to completion.
    ///
    /// Sends exactly one message on `ready`. After a successful ready the
    /// container is held until `quit` fires or its sender is dropped.
    pub async fn run(self, ready: ReadySender, quit: oneshot::Receiver<()>) -> TeardownReport {
        let name = self.spec.name.clone();
        let mut report = TeardownReport::new(&name);

        info!("[{}] creating container from {}", name, self.spec.image);
        let container_spec = self.spec.container_spec();
        let created = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                warn!("[{}] interrupted before the container was created", name);
                let _ = ready.send(Err(LaunchError::Interrupted));
                return report;
            }
            created = self.runtime.create(&container_spec) => created,
        };
        let id = match created {
            Ok(id) => id,
            Err(e) => {
                error!("[{}] create failed: {}", name, e);
                let _ = ready.send(Err(LaunchError::Create(e)));
                return report;
            }
        };
        debug!("[{}] container {}", name, id);

        let mut follower = None;
        let started = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(LaunchError::Interrupted),
            started = self.start_up(&id, &mut follower) => started,
        };
        match started {
            Ok(launched) => {
                info!("[{}] ready at {}", name, launched.address());
                if ready.send(Ok(launched)).is_err() {
                    warn!("[{}] nobody is waiting for this service", name);
                } else {
                    // A dropped sender counts as quit
                    let _ = quit.await;
                }

                let hooks = HookRunner::new(self.runtime.clone(), &name, self.settings.hook_timeout);
                if let Err(e) = hooks
                    .run_phase(&id, HookPhase::PostRun, &self.spec.hooks.post_run)
                    .await
                {
                    warn!("{}", e);
                    report.post_run_error = Some(e);
                }

                self.tear_down(&id, &mut report).await;
            }
            Err(e) => {
                error!("[{}] {}", name, e);
                self.tear_down(&id, &mut report).await;
                let _ = ready.send(Err(e));
            }
        }

        if let Some(task) = follower {
            let abort = task.abort_handle();
            if tokio::time::timeout(Duration::from_secs(LOG_DRAIN_SECS), task)
                .await
                .is_err()
            {
                abort.abort();
            }
        }

        report
    }

    async fn start_up(
        &self,
        id: &str,
        follower: &mut Option<JoinHandle<()>>,
    ) -> Result<LaunchedContainer, LaunchError> {
        let name = &self.spec.name;

        self.runtime.start(id).await.map_err(LaunchError::Start)?;

        if self.spec.follow_logs {
            *follower = Some(self.follow_logs(id));
        }

        let ports = self.runtime.inspect(id).await.map_err(LaunchError::Inspect)?;
        let binding = select_binding(&ports, self.spec.port)
            .ok_or(LaunchError::PortNotFound { port: self.spec.port })?;

        let launched = LaunchedContainer {
            id: id.to_string(),
            host: self.settings.endpoint.normalize_host(&binding.host_ip),
            port: binding.host_port,
        };

        debug!("[{}] probing {}", name, launched.address());
        let attempts = self.settings.probe.wait(&launched.address()).await?;
        debug!("[{}] reachable after {} attempt(s)", name, attempts);

        let hooks = HookRunner::new(self.runtime.clone(), name, self.settings.hook_timeout);
        hooks
            .run_phase(id, HookPhase::PreRun, &self.spec.hooks.pre_run)
            .await?;

        Ok(launched)
    }

    /// Stops then removes the container, recording failures.
    async fn tear_down(&self, id: &str, report: &mut TeardownReport) {
        let name = &self.spec.name;

        debug!("[{}] stopping {}", name, id);
        if let Err(e) = self.runtime.stop(id, self.settings.stop_timeout).await {
            warn!("[{}] stop failed: {}", name, e);
            report.errors.push(e);
        }

        if let Err(e) = self.runtime.remove(id).await {
            error!("[{}] remove failed: {}", name, e);
            report.errors.push(e);
        } else {
            info!("[{}] removed container", name);
        }
    }

    fn follow_logs(&self, id: &str) -> JoinHandle<()> {
        let runtime = self.runtime.clone();
        let id = id.to_string();
        let service = self.spec.name.clone();

        tokio::spawn(async move {
            let mut stream = match runtime.logs(&id, true).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("[{}] cannot follow logs: {}", service, e);
                    return;
                }
            };

            let mut writer = PrefixWriter::for_service(&service, tokio::io::stderr());
            while let Some(chunk) = stream.next().await {
                let bytes = match chunk {
                    Ok(OutputChunk::Stdout(bytes)) | Ok(OutputChunk::Stderr(bytes)) => bytes,
                    Err(e) => {
                        debug!("[{}] log stream ended: {}", service, e);
                        break;
                    }
                };
                if writer.write_lines(&bytes).await.is_err() {
                    break;
                }
            }
        })
    }
}

/// Picks the binding for `port`, preferring IPv4 host addresses.
fn select_binding(ports: &[PublishedPort], port: u16) -> Option<&PublishedPort> {
    let mut candidates = ports.iter().filter(|p| p.container_port == port);
    let first = candidates.next()?;
    if !first.host_ip.contains(':') {
        return Some(first);
    }
    candidates
        .find(|p| !p.host_ip.contains(':'))
        .or(Some(first))
}

//! Test environment orchestration.
//!
//! The orchestrator is the only component with a view of the whole run. It
//! fans out one [`ServiceLauncher`] per configured service, waits for every
//! ready signal, renders the service endpoints into environment variables,
//! runs the test command once, then tells every launcher to quit and joins
//! them all before returning.
//!
//! # Execution Flow
//!
//! ```text
//!   prepare runner (tokenize, build image)
//!        │
//!        ▼
//!   spawn N launchers ──► N ready signals (any order, all awaited)
//!        │
//!        ├── any failure ──► quit the ready ones, join all, Err(Services)
//!        ▼
//!   render N env vars ──► TestRunner::run ──► exit code
//!        │
//!        ▼
//!   quit all ──► join all (TeardownReport each) ──► RunResult
//! ```
//!
//! Cancelling the token while services start makes every launcher clean up
//! its own container, and the run returns the interrupt exit code.
//!
//! No launcher is ever abandoned: every path out of [`Orchestrator::run`]
//! after the spawn goes through the same shutdown.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::launcher::{
    LaunchError, LaunchSettings, LaunchedContainer, ServiceLauncher, ServiceSpec, TeardownReport,
};
use crate::render::{RenderError, RenderedEnvVar, render_env_var};
use crate::runner::{INTERRUPTED_EXIT_CODE, RunnerError, TestRunner};
use crate::runtime::{ContainerRuntime, RuntimeEndpoint};

/// Process state captured once at startup.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Environment the local test command inherits.
    pub inherited_env: Vec<(String, String)>,
    pub endpoint: RuntimeEndpoint,
}

impl RunContext {
    /// Reads the process environment. `docker_host` takes precedence over
    /// `DOCKER_HOST`.
    pub fn capture(docker_host: Option<&str>) -> Self {
        let inherited_env: Vec<(String, String)> = std::env::vars().collect();
        let from_env = std::env::var("DOCKER_HOST").ok();
        let raw = docker_host.or(from_env.as_deref());

        Self {
            endpoint: RuntimeEndpoint::parse(raw),
            inherited_env,
        }
    }
}

/// Outcome of a completed run.
#[derive(Debug)]
pub struct RunResult {
    /// Exit code of the test command.
    pub exit_code: i32,

    /// Number of services that were started.
    pub services: usize,

    /// Wall-clock duration of the whole run, teardown included.
    pub duration: Duration,

    /// One report per service.
    pub teardown: Vec<TeardownReport>,
}

impl RunResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// The test command's exit code becomes the process exit code.
    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    pub fn teardown_clean(&self) -> bool {
        self.teardown.iter().all(TeardownReport::is_clean)
    }
}

/// A service that did not become ready.
#[derive(Debug)]
pub struct ServiceFailure {
    pub service: String,
    pub error: LaunchError,
}

impl fmt::Display for ServiceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.service, self.error)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Build(RunnerError),

    #[error("{} service(s) failed to start: {}", .0.len(), join_failures(.0))]
    Services(Vec<ServiceFailure>),

    #[error("[{service}] {source}")]
    Render {
        service: String,
        #[source]
        source: RenderError,
    },

    #[error(transparent)]
    TestRun(RunnerError),
}

fn join_failures(failures: &[ServiceFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Orchestrator-side bookkeeping for the spawned launchers.
struct Launchers {
    quits: Vec<oneshot::Sender<()>>,
    finished: Vec<(String, JoinHandle<TeardownReport>)>,
}

impl Launchers {
    /// Sends quit to every launcher and joins them all.
    async fn shut_down(self) -> Vec<TeardownReport> {
        for quit in self.quits {
            // launchers that already failed have dropped their receiver
            let _ = quit.send(());
        }

        let (names, handles): (Vec<String>, Vec<JoinHandle<TeardownReport>>) =
            self.finished.into_iter().unzip();

        let mut reports = Vec::with_capacity(handles.len());
        for (name, joined) in names.into_iter().zip(join_all(handles).await) {
            match joined {
                Ok(report) => {
                    if let Some(e) = &report.post_run_error {
                        warn!("{}", e);
                    }
                    reports.push(report);
                }
                Err(e) => error!("[{}] launcher task failed: {}", name, e),
            }
        }
        reports
    }
}

/// Drives one test run against a set of services.
pub struct Orchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    services: Vec<ServiceSpec>,
    settings: LaunchSettings,
}

impl Orchestrator {
    pub fn new(config: &Config, runtime: Arc<dyn ContainerRuntime>, endpoint: RuntimeEndpoint) -> Self {
        let services = config
            .services
            .iter()
            .map(|(name, service)| ServiceSpec::from_config(name, service))
            .collect();

        Self {
            runtime,
            services,
            settings: LaunchSettings::new(&config.settings, endpoint),
        }
    }

    pub fn services(&self) -> &[ServiceSpec] {
        &self.services
    }

    /// Runs the whole lifecycle.
    ///
    /// Every container started here is stopped and removed before this
    /// returns, whatever the outcome.
    pub async fn run(
        &self,
        runner: &TestRunner,
        cancel: &CancellationToken,
    ) -> Result<RunResult, OrchestratorError> {
        let start = Instant::now();

        let prepared = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            prepared = runner.prepare() => Some(prepared),
        };
        match prepared {
            Some(prepared) => prepared.map_err(OrchestratorError::Build)?,
            None => {
                warn!("Interrupted before any service started");
                return Ok(self.interrupted(start, Vec::new()));
            }
        }

        info!(
            "Starting {} service(s) on {} ({})",
            self.services.len(),
            self.settings.endpoint,
            self.runtime.name()
        );

        let mut readies = Vec::with_capacity(self.services.len());
        let mut launchers = Launchers {
            quits: Vec::with_capacity(self.services.len()),
            finished: Vec::with_capacity(self.services.len()),
        };

        for spec in &self.services {
            let handle =
                ServiceLauncher::new(self.runtime.clone(), spec.clone(), self.settings.clone())
                    .with_cancellation(cancel.clone())
                    .spawn();
            readies.push(handle.ready);
            launchers.quits.push(handle.quit);
            launchers.finished.push((handle.service, handle.finished));
        }

        let mut launched: Vec<(&ServiceSpec, LaunchedContainer)> = Vec::new();
        let mut failures = Vec::new();

        for (spec, ready) in self.services.iter().zip(join_all(readies).await) {
            match ready {
                Ok(Ok(container)) => launched.push((spec, container)),
                Ok(Err(error)) => failures.push(ServiceFailure {
                    service: spec.name.clone(),
                    error,
                }),
                Err(_) => failures.push(ServiceFailure {
                    service: spec.name.clone(),
                    error: LaunchError::Aborted,
                }),
            }
        }

        if cancel.is_cancelled() {
            warn!("Interrupted while starting services");
            let teardown = launchers.shut_down().await;
            return Ok(self.interrupted(start, teardown));
        }

        if !failures.is_empty() {
            for failure in &failures {
                error!("{}", failure);
            }
            launchers.shut_down().await;
            return Err(OrchestratorError::Services(failures));
        }

        let mut env: Vec<RenderedEnvVar> = Vec::with_capacity(launched.len());
        for (spec, container) in &launched {
            match render_env_var(&spec.name, &spec.format, &container.vars()) {
                Ok(var) => env.push(var),
                Err(source) => {
                    launchers.shut_down().await;
                    return Err(OrchestratorError::Render {
                        service: spec.name.clone(),
                        source,
                    });
                }
            }
        }

        if !env.is_empty() {
            let assignments: Vec<String> = env.iter().map(ToString::to_string).collect();
            info!("Environment: {}", assignments.join(" "));
        }

        let outcome = runner.run(&env, cancel).await;

        match &outcome {
            Ok(code) => info!("Test command exited with {}", code),
            Err(e) => error!("{}", e),
        }

        let teardown = launchers.shut_down().await;
        let exit_code = outcome.map_err(OrchestratorError::TestRun)?;

        Ok(RunResult {
            exit_code,
            services: self.services.len(),
            duration: start.elapsed(),
            teardown,
        })
    }

    fn interrupted(&self, start: Instant, teardown: Vec<TeardownReport>) -> RunResult {
        RunResult {
            exit_code: INTERRUPTED_EXIT_CODE,
            services: self.services.len(),
            duration: start.elapsed(),
            teardown,
        }
    }
}

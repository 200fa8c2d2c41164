//! temaki: disposable service containers for test runs.
//!
//! temaki starts the services a test suite needs (databases, queues, mocks)
//! as containers, waits until each accepts connections, hands their
//! addresses to the test command through environment variables, runs the
//! command, and removes every container afterwards whatever the outcome.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Orchestrator**: Fans out one launcher per service and drives the run
//! - **ServiceLauncher**: Owns one container from create to remove
//! - **ReadinessProbe** / **HookRunner**: Gate a service before it is ready
//! - **TestRunner**: Runs the test command locally or in a built image
//! - **ContainerRuntime**: The container operations, backed by Docker
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use temaki::config::load_config;
//! use temaki::orchestrator::{Orchestrator, RunContext};
//! use temaki::runner::TestRunner;
//! use temaki::runtime::docker::DockerRuntime;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("temaki.toml"))?;
//!     let context = RunContext::capture(config.settings.docker_host.as_deref());
//!     let runtime = Arc::new(DockerRuntime::connect(&context.endpoint)?);
//!
//!     let runner = TestRunner::from_config(&config, runtime.clone(), context.inherited_env);
//!     let orchestrator = Orchestrator::new(&config, runtime, context.endpoint);
//!     let result = orchestrator.run(&runner, &CancellationToken::new()).await?;
//!
//!     std::process::exit(result.exit_code());
//! }
//! ```

pub mod config;
pub mod hooks;
pub mod launcher;
pub mod orchestrator;
pub mod output;
pub mod probe;
pub mod render;
pub mod report;
pub mod runner;
pub mod runtime;

// Re-export commonly used types
pub use config::{Config, load_config};
pub use orchestrator::{Orchestrator, RunContext, RunResult};
pub use runner::TestRunner;
pub use runtime::{ContainerRuntime, RuntimeEndpoint};

//! Running the test command.
//!
//! Two flavours, picked once from `[runner]`:
//!
//! - [`LocalRunner`] spawns the command as a child process with the inherited
//!   environment plus the rendered service variables.
//! - [`ContainerRunner`] builds an image from a Dockerfile and runs the
//!   command as a container of that image.
//!
//! Both copy the command's output through `cmd:` prefixed writers and return
//! its exit code. Cancellation (Ctrl-C) kills the command and yields 130.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::io::BufReader;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, RunnerConfig};
use crate::output::{BUILD_PREFIX, CMD_PREFIX, PrefixWriter};
use crate::render::RenderedEnvVar;
use crate::runtime::{BuildRequest, ContainerRuntime, ContainerSpec, OutputChunk, RuntimeError};

/// Exit code reported when the run is interrupted.
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

/// Label put on test containers.
pub const RUNNER_LABEL: &str = "temaki.runner";

/// Seconds output pumps may lag behind the command's exit.
const OUTPUT_DRAIN_SECS: u64 = 2;

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("Cannot parse test command: {0}")]
    Tokenize(#[from] shell_words::ParseError),

    #[error("No test command configured")]
    EmptyCommand,

    #[error("Failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to build test image: {0}")]
    Build(#[source] RuntimeError),

    #[error("Test container failed: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// How the test command is executed.
pub enum TestRunner {
    Local(LocalRunner),
    Container(ContainerRunner),
}

impl TestRunner {
    /// Builds the runner described by `config`.
    ///
    /// `inherited_env` is the process environment captured at startup; it is
    /// only passed on by the local runner.
    pub fn from_config(
        config: &Config,
        runtime: Arc<dyn ContainerRuntime>,
        inherited_env: Vec<(String, String)>,
    ) -> Self {
        match &config.runner {
            RunnerConfig::Local => TestRunner::Local(LocalRunner {
                command: config.cmd.clone(),
                inherited_env,
            }),
            RunnerConfig::Container(runner) => TestRunner::Container(ContainerRunner {
                runtime,
                command: config.cmd.clone(),
                image: runner.image.clone(),
                dockerfile: runner.dockerfile.clone(),
                network_mode: runner.network_mode.clone(),
            }),
        }
    }

    pub fn command(&self) -> Option<&str> {
        match self {
            TestRunner::Local(runner) => runner.command.as_deref(),
            TestRunner::Container(runner) => runner.command.as_deref(),
        }
    }

    /// Work that must succeed before any service starts: checking the
    /// command line, and building the image for containerized runs.
    pub async fn prepare(&self) -> Result<(), RunnerError> {
        match self {
            TestRunner::Local(runner) => runner.argv().map(|_| ()),
            TestRunner::Container(runner) => {
                runner.argv()?;
                runner.build().await
            }
        }
    }

    /// Runs the command to completion and returns its exit code.
    pub async fn run(
        &self,
        env: &[RenderedEnvVar],
        cancel: &CancellationToken,
    ) -> Result<i32, RunnerError> {
        match self {
            TestRunner::Local(runner) => runner.run(env, cancel).await,
            TestRunner::Container(runner) => runner.run(env, cancel).await,
        }
    }
}

/// Runs the test command on this machine.
pub struct LocalRunner {
    command: Option<String>,
    inherited_env: Vec<(String, String)>,
}

impl LocalRunner {
    pub fn new(command: Option<String>, inherited_env: Vec<(String, String)>) -> Self {
        Self {
            command,
            inherited_env,
        }
    }

    fn argv(&self) -> Result<Vec<String>, RunnerError> {
        let command = self.command.as_deref().ok_or(RunnerError::EmptyCommand)?;
        let argv = shell_words::split(command)?;
        if argv.is_empty() {
            return Err(RunnerError::EmptyCommand);
        }
        Ok(argv)
    }

    /// Inherited variables overlaid with the rendered ones.
    fn environment(&self, env: &[RenderedEnvVar]) -> HashMap<String, String> {
        let mut merged: HashMap<String, String> = self.inherited_env.iter().cloned().collect();
        for var in env {
            merged.insert(var.name.clone(), var.value.clone());
        }
        merged
    }

    pub async fn run(
        &self,
        env: &[RenderedEnvVar],
        cancel: &CancellationToken,
    ) -> Result<i32, RunnerError> {
        let argv = self.argv()?;
        let command = argv.join(" ");
        info!("Running {}", command);

        let mut child = tokio::process::Command::new(&argv[0])
            .args(&argv[1..])
            .env_clear()
            .envs(self.environment(env))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RunnerError::Spawn {
                command: command.clone(),
                source,
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let stdout_pump = tokio::spawn(async move {
            if let Some(stdout) = stdout {
                let mut writer = PrefixWriter::new(CMD_PREFIX, tokio::io::stdout());
                let _ = writer.copy_lines(BufReader::new(stdout)).await;
            }
        });
        let stderr_pump = tokio::spawn(async move {
            if let Some(stderr) = stderr {
                let mut writer = PrefixWriter::new(CMD_PREFIX, tokio::io::stderr());
                let _ = writer.copy_lines(BufReader::new(stderr)).await;
            }
        });

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = cancel.cancelled() => {
                warn!("Interrupted, killing {}", command);
                child.kill().await?;
                stdout_pump.abort();
                stderr_pump.abort();
                return Ok(INTERRUPTED_EXIT_CODE);
            }
        };

        let drain = Duration::from_secs(OUTPUT_DRAIN_SECS);
        drain_pump(stdout_pump, drain).await;
        drain_pump(stderr_pump, drain).await;

        let code = exit_code(&status);
        debug!("{} exited with {}", command, code);
        Ok(code)
    }
}

/// Waits up to `drain` for an output pump, aborting it if still running.
///
/// A background process left behind by the command can hold the pipe open
/// long after the command itself exited.
async fn drain_pump(pump: JoinHandle<()>, drain: Duration) {
    let abort = pump.abort_handle();
    if tokio::time::timeout(drain, pump).await.is_err() {
        debug!("Output still open after {:?}, dropping the rest", drain);
        abort.abort();
    }
}

#[cfg(unix)]
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => 1,
    }
}

#[cfg(not(unix))]
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}

/// Builds an image and runs the test command inside it.
pub struct ContainerRunner {
    runtime: Arc<dyn ContainerRuntime>,
    command: Option<String>,
    image: String,
    dockerfile: PathBuf,
    network_mode: Option<String>,
}

impl ContainerRunner {
    /// The command is optional here; without one the image defaults apply.
    fn argv(&self) -> Result<Option<Vec<String>>, RunnerError> {
        let Some(command) = self.command.as_deref() else {
            return Ok(None);
        };
        let argv = shell_words::split(command)?;
        if argv.is_empty() {
            return Err(RunnerError::EmptyCommand);
        }
        Ok(Some(argv))
    }

    fn build_request(&self) -> BuildRequest {
        let context_dir = self
            .dockerfile
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."))
            .to_path_buf();
        let dockerfile = self
            .dockerfile
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "Dockerfile".to_string());

        BuildRequest {
            image: self.image.clone(),
            context_dir,
            dockerfile,
        }
    }

    /// Builds the test image, streaming build output to stderr.
    pub async fn build(&self) -> Result<(), RunnerError> {
        let request = self.build_request();
        info!(
            "Building {} from {}",
            request.image,
            self.dockerfile.display()
        );

        let (mut sink, source) = tokio::io::duplex(8 * 1024);
        let pump = tokio::spawn(async move {
            let mut writer = PrefixWriter::new(BUILD_PREFIX, tokio::io::stderr());
            let _ = writer.copy_lines(BufReader::new(source)).await;
        });

        let result = self.runtime.build_image(&request, &mut sink).await;
        drop(sink);
        let _ = pump.await;

        result.map_err(RunnerError::Build)
    }

    fn container_spec(&self, env: &[RenderedEnvVar]) -> Result<ContainerSpec, RunnerError> {
        let (entrypoint, cmd) = match self.argv()? {
            Some(mut argv) => {
                let rest = argv.split_off(1);
                (Some(argv), Some(rest))
            }
            None => (None, None),
        };

        let suffix = uuid::Uuid::new_v4().simple().to_string();

        Ok(ContainerSpec {
            name: Some(format!("temaki-tests-{}", &suffix[..8])),
            image: self.image.clone(),
            env: env.iter().map(ToString::to_string).collect(),
            exposed_port: None,
            entrypoint,
            cmd,
            network_mode: self.network_mode.clone(),
            labels: HashMap::from([(RUNNER_LABEL.to_string(), "true".to_string())]),
        })
    }

    pub async fn run(
        &self,
        env: &[RenderedEnvVar],
        cancel: &CancellationToken,
    ) -> Result<i32, RunnerError> {
        let spec = self.container_spec(env)?;
        let id = self.runtime.create(&spec).await?;
        info!("Running tests in container {} ({})", id, self.image);

        let result = self.run_container(&id, cancel).await;

        if let Err(e) = self.runtime.remove(&id).await {
            warn!("Failed to remove test container {}: {}", id, e);
        }

        result
    }

    async fn run_container(&self, id: &str, cancel: &CancellationToken) -> Result<i32, RunnerError> {
        self.runtime.start(id).await?;

        let mut logs = self.runtime.logs(id, true).await?;
        let pump = tokio::spawn(async move {
            let mut stdout = PrefixWriter::new(CMD_PREFIX, tokio::io::stdout());
            let mut stderr = PrefixWriter::new(CMD_PREFIX, tokio::io::stderr());
            while let Some(chunk) = logs.next().await {
                let written = match chunk {
                    Ok(OutputChunk::Stdout(bytes)) => stdout.write_lines(&bytes).await,
                    Ok(OutputChunk::Stderr(bytes)) => stderr.write_lines(&bytes).await,
                    Err(e) => {
                        debug!("Test container log stream ended: {}", e);
                        break;
                    }
                };
                if written.is_err() {
                    break;
                }
            }
        });

        let code = tokio::select! {
            code = self.runtime.wait(id) => code?,
            _ = cancel.cancelled() => {
                warn!("Interrupted, stopping test container {}", id);
                pump.abort();
                return Ok(INTERRUPTED_EXIT_CODE);
            }
        };

        drain_pump(pump, Duration::from_secs(OUTPUT_DRAIN_SECS)).await;

        Ok(i32::try_from(code).unwrap_or(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigFormat, load_config_str};
    use crate::runtime::fake::FakeRuntime;

    fn var(name: &str, value: &str) -> RenderedEnvVar {
        RenderedEnvVar {
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    fn path_env() -> Vec<(String, String)> {
        vec![("PATH".to_string(), std::env::var("PATH").unwrap_or_default())]
    }

    fn container_runner(fake: Arc<FakeRuntime>, command: Option<&str>) -> ContainerRunner {
        ContainerRunner {
            runtime: fake,
            command: command.map(String::from),
            image: "temaki-tests".to_string(),
            dockerfile: PathBuf::from("/src/app/docker/Dockerfile.test"),
            network_mode: Some("host".to_string()),
        }
    }

    #[tokio::test]
    async fn test_local_exit_code() {
        let runner = LocalRunner::new(Some("sh -c 'exit 3'".to_string()), path_env());
        let code = runner.run(&[], &CancellationToken::new()).await.unwrap();
        assert_eq!(code, 3);
    }

    #[tokio::test]
    async fn test_local_environment_overlay() {
        let mut inherited = path_env();
        inherited.push(("REDIS_URL".to_string(), "stale".to_string()));
        let runner = LocalRunner::new(
            Some(r#"sh -c 'test "$REDIS_URL" = redis://127.0.0.1:1234'"#.to_string()),
            inherited,
        );

        let code = runner
            .run(
                &[var("REDIS_URL", "redis://127.0.0.1:1234")],
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn test_local_missing_command() {
        let runner = LocalRunner::new(None, Vec::new());
        let err = runner.run(&[], &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, RunnerError::EmptyCommand));

        let runner = LocalRunner::new(Some("definitely-not-a-binary-xyz".to_string()), Vec::new());
        let err = runner.run(&[], &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, RunnerError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_local_cancel_kills_child() {
        let runner = LocalRunner::new(Some("sleep 30".to_string()), path_env());
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let start = std::time::Instant::now();
        let code = runner.run(&[], &cancel).await.unwrap();
        assert_eq!(code, INTERRUPTED_EXIT_CODE);
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_local_background_child_holding_output() {
        let runner = LocalRunner::new(
            Some("sh -c 'sleep 30 & exit 0'".to_string()),
            path_env(),
        );

        let start = std::time::Instant::now();
        let code = runner.run(&[], &CancellationToken::new()).await.unwrap();
        assert_eq!(code, 0);
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_drain_pump_aborts_stuck_task() {
        let (held, released) = tokio::sync::oneshot::channel::<()>();
        let pump = tokio::spawn(async move {
            let _held = held;
            std::future::pending::<()>().await;
        });

        drain_pump(pump, Duration::from_millis(50)).await;

        // the sender is dropped only once the task is gone
        let dropped = tokio::time::timeout(Duration::from_secs(2), released).await;
        assert!(matches!(dropped, Ok(Err(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_local_signal_exit_code() {
        let runner = LocalRunner::new(Some("sh -c 'kill -TERM $$'".to_string()), path_env());
        let code = runner.run(&[], &CancellationToken::new()).await.unwrap();
        assert_eq!(code, 128 + 15);
    }

    #[test]
    fn test_build_request_uses_dockerfile_directory() {
        let runner = container_runner(Arc::new(FakeRuntime::new()), Some("pytest"));
        let request = runner.build_request();
        assert_eq!(request.context_dir, PathBuf::from("/src/app/docker"));
        assert_eq!(request.dockerfile, "Dockerfile.test");
        assert_eq!(request.image, "temaki-tests");
    }

    #[tokio::test]
    async fn test_container_run() {
        let fake = Arc::new(FakeRuntime::new().exit_code(2));
        let runner = container_runner(fake.clone(), Some("go test -v ./..."));

        runner.build().await.unwrap();
        let code = runner
            .run(&[var("REDIS_URL", "redis://h:1")], &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(code, 2);
        assert_eq!(
            fake.ops(),
            vec![
                "build temaki-tests",
                "create temaki-tests",
                "start c1",
                "logs c1 follow=true",
                "wait c1",
                "remove c1",
            ]
        );

        let spec = &fake.created_specs()[0];
        assert_eq!(spec.entrypoint, Some(vec!["go".to_string()]));
        assert_eq!(
            spec.cmd,
            Some(vec!["test".to_string(), "-v".to_string(), "./...".to_string()])
        );
        assert_eq!(spec.env, vec!["REDIS_URL=redis://h:1"]);
        assert_eq!(spec.network_mode.as_deref(), Some("host"));
        assert!(fake.live_containers().is_empty());
    }

    #[tokio::test]
    async fn test_container_without_command_uses_image_defaults() {
        let fake = Arc::new(FakeRuntime::new());
        let runner = container_runner(fake.clone(), None);

        let code = runner.run(&[], &CancellationToken::new()).await.unwrap();
        assert_eq!(code, 0);
        let spec = &fake.created_specs()[0];
        assert!(spec.entrypoint.is_none());
        assert!(spec.cmd.is_none());
    }

    #[tokio::test]
    async fn test_build_failure() {
        let fake = Arc::new(FakeRuntime::new().fail_build());
        let runner = container_runner(fake.clone(), Some("pytest"));

        let err = runner.build().await.unwrap_err();
        assert!(matches!(err, RunnerError::Build(RuntimeError::BuildFailed(_))));
    }

    #[tokio::test]
    async fn test_prepare_rejects_bad_command() {
        let config = load_config_str("cmd = \"pytest 'unterminated\"", ConfigFormat::Toml).unwrap();
        let runner = TestRunner::from_config(&config, Arc::new(FakeRuntime::new()), Vec::new());

        assert_eq!(runner.command(), Some("pytest 'unterminated"));
        assert!(matches!(
            runner.prepare().await,
            Err(RunnerError::Tokenize(_))
        ));
    }
}

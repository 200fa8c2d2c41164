//! temaki CLI - Disposable service containers for test runs.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use temaki::config::{self, Config, RunnerConfig};
use temaki::orchestrator::{Orchestrator, RunContext};
use temaki::report::print_summary;
use temaki::runner::{INTERRUPTED_EXIT_CODE, TestRunner};
use temaki::runtime::docker::DockerRuntime;

#[derive(Parser)]
#[command(name = "temaki")]
#[command(about = "Run tests against throwaway service containers", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path (default: nearest temaki.toml / temaki.yml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the services, run the test command, tear everything down
    Run {
        /// Test command, overriding `cmd` from the configuration
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        cmd: Vec<String>,
    },

    /// Validate configuration file
    Validate {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Initialize a new configuration file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging; RUST_LOG wins over -v
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run { cmd } => run_tests(cli.config.as_deref(), &cmd).await,
        Commands::Validate { format } => validate_config(cli.config.as_deref(), &format),
        Commands::Init => init_config(cli.config.as_deref()),
    }
}

/// Explicit path, or the nearest config above the working directory.
fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().context("Failed to read working directory")?;
    Ok(config::find_config(&cwd)?)
}

fn load(explicit: Option<&Path>) -> Result<(PathBuf, Config)> {
    let path = resolve_config_path(explicit)?;
    let config = config::load_config(&path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    Ok((path, config))
}

async fn run_tests(config_path: Option<&Path>, cmd: &[String]) -> Result<()> {
    let (path, mut config) = load(config_path)?;
    config.override_cmd(cmd);
    info!("Loaded configuration from {}", path.display());

    let context = RunContext::capture(config.settings.docker_host.as_deref());
    let runtime = Arc::new(
        DockerRuntime::connect(&context.endpoint)
            .with_context(|| format!("Failed to connect to {}", context.endpoint))?,
    );

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if interrupt.is_cancelled() {
                warn!("Received second Ctrl-C, exiting without cleanup");
                std::process::exit(INTERRUPTED_EXIT_CODE);
            }
            warn!("Received Ctrl-C, shutting down (press again to exit now)");
            interrupt.cancel();
        }
    });

    let runner = TestRunner::from_config(&config, runtime.clone(), context.inherited_env);
    let orchestrator = Orchestrator::new(&config, runtime, context.endpoint);

    let result = orchestrator.run(&runner, &cancel).await?;

    print_summary(&result);
    std::process::exit(result.exit_code());
}

fn validate_config(config_path: Option<&Path>, format: &str) -> Result<()> {
    let (path, config) = load(config_path)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        "text" => {
            println!("Configuration valid: {}", path.display());
            match &config.runner {
                RunnerConfig::Local => println!("  Runner: local"),
                RunnerConfig::Container(runner) => println!(
                    "  Runner: container ({} from {})",
                    runner.image,
                    runner.dockerfile.display()
                ),
            }
            if let Some(cmd) = &config.cmd {
                println!("  Command: {}", cmd);
            }
            println!("  Services: {}", config.services.len());
            for (name, service) in &config.services {
                println!("    {} <- {} ({}/tcp)", name, service.image, service.port);
            }
        }
        other => bail!("Unknown format '{}', expected text or json", other),
    }

    Ok(())
}

const STARTER_CONFIG: &str = r#"# temaki configuration
cmd = "pytest tests"

[settings]
probe_attempts = 11
probe_interval_ms = 1000
stop_timeout_secs = 10

[runner]
type = "local"

[services.REDIS_URL]
image = "redis:7"
port = 6379
format = "redis://{{Host}}:{{Port}}/0"

[services.DATABASE_URL]
image = "postgres:16"
port = 5432
format = "postgres://postgres@{{Host}}:{{Port}}/postgres"
env = { POSTGRES_HOST_AUTH_METHOD = "trust" }

[services.DATABASE_URL.hooks]
pre-run = ["pg_isready -U postgres"]
"#;

fn init_config(config_path: Option<&Path>) -> Result<()> {
    let path = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(config::CONFIG_FILE_NAMES[0]));

    if path.exists() {
        bail!("{} already exists", path.display());
    }

    std::fs::write(&path, STARTER_CONFIG)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Created {}", path.display());

    Ok(())
}

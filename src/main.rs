//! volley CLI - distributed test executor.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use volley::config::{self, Config, FrameworkConfig};
use volley::driver::{Driver, RunContext};
use volley::framework::{ScriptFramework, ShellFramework, TestFramework};
use volley::hooks::DefaultHooks;
use volley::protocol::{Endpoint, RunToken};
use volley::worker::{self, WorkerContext};

#[derive(Parser)]
#[command(name = "volley")]
#[command(about = "Distributed test executor", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "volley.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured suites
    Run {
        /// Override the number of local workers
        #[arg(short = 'n', long)]
        concurrency: Option<usize>,

        /// Comma-separated suite names restricting and ordering the run
        #[arg(long)]
        whitelist: Option<String>,
    },

    /// Discover suites without running them
    Collect,

    /// Validate the configuration file
    Validate,

    /// Internal: worker subprocess entry point
    #[command(hide = true)]
    Worker,

    /// Internal: discovery subprocess entry point
    #[command(hide = true)]
    Discover,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            concurrency,
            whitelist,
        } => run(&cli.config, concurrency, whitelist, cli.verbose).await,
        Commands::Collect => collect(&cli.config, cli.verbose).await,
        Commands::Validate => validate(&cli.config),
        Commands::Worker => worker_entry(cli.verbose).await,
        Commands::Discover => discover_entry(cli.verbose).await,
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();
}

fn build_framework(config: &FrameworkConfig) -> Arc<dyn TestFramework> {
    match config {
        FrameworkConfig::Shell(cfg) => Arc::new(ShellFramework::new(cfg.clone())),
        FrameworkConfig::Scripts(cfg) => Arc::new(ScriptFramework::new(cfg.clone())),
    }
}

async fn run(
    config_path: &Path,
    concurrency: Option<usize>,
    whitelist: Option<String>,
    verbose: bool,
) -> Result<()> {
    let mut config = config::load_config(config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    config.apply_env()?;
    if let Some(concurrency) = concurrency {
        config.queue.concurrency = concurrency;
    }
    if let Some(whitelist) = whitelist {
        config.queue.whitelist = Some(whitelist);
    }
    init_logging(verbose || config.queue.verbose);
    config.validate()?;

    let framework = build_framework(&config.framework);
    let ctx = RunContext::new(config, config_path.to_path_buf())?;
    let driver = Driver::new(ctx, framework, Arc::new(DefaultHooks));
    let code = driver.run().await?;
    std::process::exit(code);
}

async fn collect(config_path: &Path, verbose: bool) -> Result<()> {
    let config = config::load_config(config_path)?;
    init_logging(verbose);
    let framework = build_framework(&config.framework);

    let mut count = 0usize;
    for file in framework.suite_files().await? {
        for suite in framework.suites_in_file(&file).await? {
            println!("{}", suite.id);
            count += 1;
        }
    }
    println!("{count} suites");
    Ok(())
}

fn validate(config_path: &Path) -> Result<()> {
    let config: Config = config::load_config(config_path)?;
    config.validate()?;

    println!("Configuration is valid!");
    println!();
    println!("Settings:");
    println!("  Concurrency: {}", config.queue.concurrency);
    println!("  Stats file: {}", config.queue.stats_file_path.display());
    if let Some(endpoint) = &config.queue.listen_endpoint {
        println!("  Listen endpoint: {endpoint}");
    }
    if let Some(relay) = &config.queue.relay_endpoint {
        println!("  Relay endpoint: {relay}");
    }
    let framework = match &config.framework {
        FrameworkConfig::Shell(_) => "shell",
        FrameworkConfig::Scripts(_) => "scripts",
    };
    println!("  Framework: {framework}");
    Ok(())
}

async fn worker_entry(verbose: bool) -> Result<()> {
    let config_path =
        std::env::var(worker::env::CONFIG).context("worker must be spawned by a master")?;
    let config = config::load_config(Path::new(&config_path))?;
    init_logging(verbose || config.queue.verbose);

    let ctx = WorkerContext::from_env()?;
    let framework = build_framework(&config.framework);
    let code = volley::worker::worker_main(ctx, framework, Arc::new(DefaultHooks)).await;
    std::process::exit(code);
}

async fn discover_entry(verbose: bool) -> Result<()> {
    let config_path =
        std::env::var(worker::env::CONFIG).context("discover must be spawned by a master")?;
    let config = config::load_config(Path::new(&config_path))?;
    init_logging(verbose || config.queue.verbose);

    let endpoint_spec =
        std::env::var(worker::env::ENDPOINT).context("discover must be spawned by a master")?;
    let endpoint = Endpoint::parse(&endpoint_spec)?;
    let token = RunToken::from_hex(
        std::env::var(worker::env::TOKEN).context("discover must be spawned by a master")?,
    );

    let framework = build_framework(&config.framework);
    let code = volley::discovery::discovery_main(endpoint, token, framework).await;
    std::process::exit(code);
}

use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use redflow::config::{ConfigManager, EnvConfigManager, Settings};
use redflow::flow::{FlowDefinition, FlowManager};
use redflow::logger::{LogLevel, init_tracing};
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "redflow", about = "Flow-based automation runtime", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Deploy every flow of a directory and run until interrupted
    Run(RunArgs),

    /// Check a flow file without deploying it
    Validate { file: PathBuf },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Directory holding `.json`/`.yaml` flow files
    #[arg(long, default_value = "./flows")]
    flows: PathBuf,

    /// Runtime settings file (`.json`, `.yaml`)
    #[arg(long)]
    settings: Option<PathBuf>,

    /// `.env` file merged into the process environment
    #[arg(long, default_value = ".env")]
    env_file: PathBuf,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<LogLevel>,
}

impl Default for RunArgs {
    fn default() -> Self {
        Self {
            flows: PathBuf::from("./flows"),
            settings: None,
            env_file: PathBuf::from(".env"),
            log_level: None,
        }
    }
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Run(RunArgs::default())) {
        Commands::Run(args) => run(args).await,
        Commands::Validate { file } => {
            let flow = FlowDefinition::load(&file)?;
            flow.validate()
                .with_context(|| format!("flow {} is invalid", file.display()))?;
            println!("✅ Flow `{}` is valid ({} nodes).", flow.id, flow.nodes.len());
            Ok(())
        }
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let mut settings = match &args.settings {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    if let Some(level) = args.log_level {
        settings.log.log_level = level;
    }
    let logger = init_tracing(&settings.log)?;
    let config = ConfigManager(EnvConfigManager::new(args.env_file));

    info!("redflow starting up");
    let manager = FlowManager::with_logger(settings, config, logger)?;
    if args.flows.is_dir() {
        let deployed = manager.deploy_dir(&args.flows).await?;
        info!(count = deployed.len(), dir = %args.flows.display(), "flows deployed");
    } else {
        warn!(dir = %args.flows.display(), "flow directory not found, nothing deployed");
    }

    signal::ctrl_c().await.context("could not listen for ctrl-c")?;
    info!("shutting down");
    manager.stop_all().await;
    Ok(())
}

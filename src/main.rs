mod cmd;

use assistant_runtime::config::{RuntimeConfig, ENV_LOG};
use assistant_runtime::{ArtifactFormat, ModelSlot};
use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use tracing::Level;

#[derive(Parser)]
#[command(name = "assistant-rt")]
#[command(version)]
#[command(about = "On-device model runtime", long_about = None)]
struct Cli {
    /// YAML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// -v info, -vv debug, -vvv trace
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resource snapshot, budget decision and slot states
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Check a model artifact without loading it into a slot
    Validate {
        path: PathBuf,
        #[arg(long)]
        format: Option<ArtifactFormat>,
        #[arg(long)]
        load_test: bool,
    },
    /// Generate a reply and stream it to stdout
    Generate {
        prompt: String,
        #[command(flatten)]
        opts: GenerateOpts,
    },
    /// Interactive conversation
    Chat {
        #[command(flatten)]
        opts: GenerateOpts,
    },
}

#[derive(Args, Clone)]
pub struct GenerateOpts {
    #[arg(long, default_value = "chat")]
    pub slot: ModelSlot,
    #[arg(long)]
    pub system: Option<String>,
    #[arg(long)]
    pub max_tokens: Option<usize>,
    #[arg(long)]
    pub temperature: Option<f32>,
    #[arg(long)]
    pub top_k: Option<usize>,
    #[arg(long)]
    pub top_p: Option<f32>,
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => std::env::var(ENV_LOG)
            .ok()
            .and_then(|v| v.parse::<Level>().ok())
            .unwrap_or(Level::WARN),
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match RuntimeConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(2);
        }
    };

    let result = match cli.command {
        Commands::Status { json } => cmd::status(&config, json).await,
        Commands::Validate { path, format, load_test } => cmd::validate(&config, &path, format, load_test),
        Commands::Generate { prompt, opts } => cmd::generate(&config, &prompt, &opts).await,
        Commands::Chat { opts } => cmd::chat(&config, &opts).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

//! imgsim CLI - Command-line interface
//!
//! Usage:
//!   imgsim add <name> <image>
//!   imgsim classify <image> [-n N] [--distinct]
//!   imgsim delete <name>
//!   imgsim list
//!   imgsim status

use anyhow::Context;
use clap::{Parser, Subcommand};
use imgsim_core::{AppConfig, ClassificationResponse, ImagePayload, LoggingConfig, RankingPolicy};
use imgsim_jobs::ImgsimService;
use imgsim_vector::{create_model_client, EmbeddingStore};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "imgsim")]
#[command(about = "Image similarity classification CLI")]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Embedding snapshot file
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a reference image for an item
    Add {
        /// Item name
        name: String,
        /// Path to the image
        image: PathBuf,
    },
    /// Rank registered items by similarity to an image
    Classify {
        /// Path to the query image
        image: PathBuf,
        /// Number of results
        #[arg(short, long, default_value_t = 5)]
        n: usize,
        /// Report each item at most once
        #[arg(long)]
        distinct: bool,
    },
    /// Remove every embedding of an item
    Delete {
        /// Item name
        name: String,
    },
    /// List items with their embedding counts
    List,
    /// Show the effective configuration
    Status,
}

fn load_config(cli: &Cli) -> anyhow::Result<AppConfig> {
    let mut config = match &cli.config {
        Some(path) => AppConfig::from_file(path)?.with_env_override()?,
        None => AppConfig::from_env()?,
    };
    if let Some(store) = &cli.store {
        config.store.snapshot_path = Some(store.clone());
    }
    if let Commands::Classify { distinct: true, .. } = cli.command {
        config.ranking.policy = RankingPolicy::DistinctOwner;
    }
    config.validate()?;
    Ok(config)
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| logging.level.as_str().into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_file(logging.include_location)
        .with_line_number(logging.include_location);

    if logging.json_format {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn read_image(path: &Path) -> anyhow::Result<ImagePayload> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(ImagePayload::bytes(bytes))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_tracing(&config.logging);
    tracing::debug!("Model endpoint: {}", config.model.predict_url());

    if let Commands::Status = cli.command {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let model = create_model_client(&config.model)?;
    let service = ImgsimService::start(config, model)?;
    let outcome = run(&service, cli.command).await;

    // Persist whatever completed, even when the command failed
    service.shutdown().await?;
    outcome
}

async fn run(service: &ImgsimService, command: Commands) -> anyhow::Result<()> {
    let orchestrator = service.orchestrator();

    match command {
        Commands::Add { name, image } => {
            let image = read_image(&image).await?;
            let ack = orchestrator.run_extraction(image, &name).await?;
            println!(
                "Added embedding {} for '{}' (job {})",
                ack.embedding_id, ack.owner_name, ack.job_id
            );
        }
        Commands::Classify { image, n, .. } => {
            let image = read_image(&image).await?;
            let ranked = orchestrator.run_classification(image, n).await?;
            if ranked.is_empty() {
                println!("No registered items");
            } else {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&ClassificationResponse::Ranked(ranked))?
                );
            }
        }
        Commands::Delete { name } => {
            let removed = service.delete_item(&name);
            println!("Removed {removed} embeddings for '{name}'");
        }
        Commands::List => {
            let store = service.store();
            for (owner, count) in store.owners() {
                println!("{owner}\t{count}");
            }
            println!("{} embeddings total", store.len());
        }
        Commands::Status => {}
    }

    Ok(())
}

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tallydb::harness::{Command, HELP, Harness, run_scenario};
use tallydb::{PipelineKind, TallyConfig, TallyDb};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "tallydb")]
#[command(about = "Denormalized counters, the ways they drift, and how to repair them")]
struct Cli {
    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Snapshot file loaded at start and saved on exit
    #[arg(long, global = true)]
    data: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read harness commands from stdin
    Run {
        #[arg(long, default_value = "on-demand")]
        pipeline: PipelineKind,
    },
    /// Like a post once
    Like {
        user: String,
        post: String,
        #[arg(long, default_value = "dual-write")]
        pipeline: PipelineKind,
    },
    /// Print stored and true counters of an entity
    Report { entity: String },
    /// Concurrent likes through the dual write with failing aggregate writes
    Scenario {
        #[arg(long, default_value_t = 3)]
        likes: usize,
        #[arg(long, default_value_t = 1)]
        faults: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => TallyConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => TallyConfig::default(),
    };

    match cli.command {
        Commands::Run { pipeline } => {
            let db = open(config, cli.data.as_deref()).await?;
            let mut harness = Harness::new(db, pipeline);
            info!(pipeline = %pipeline, "reading commands from stdin");
            println!("{}", HELP);

            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Some(line) = lines.next_line().await? {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                if line == "quit" || line == "exit" {
                    break;
                }
                match harness.execute_line(line).await {
                    Ok(out) => println!("{}", out),
                    Err(err) => {
                        error!(command = line, error = %err, "command failed");
                        println!("error: {}", err);
                    }
                }
            }
            save(harness.db(), cli.data.as_deref()).await?;
        }
        Commands::Like {
            user,
            post,
            pipeline,
        } => {
            let db = open(config, cli.data.as_deref()).await?;
            let mut harness = Harness::new(db, pipeline);
            let out = harness
                .execute(Command::Like {
                    user: user.as_str().into(),
                    post: post.as_str().into(),
                })
                .await?;
            println!("{}", out);
            save(harness.db(), cli.data.as_deref()).await?;
        }
        Commands::Report { entity } => {
            let db = open(config, cli.data.as_deref()).await?;
            let mut harness = Harness::new(db, PipelineKind::OnDemand);
            println!(
                "{}",
                harness
                    .execute(Command::Report {
                        entity: entity.as_str().into()
                    })
                    .await?
            );
        }
        Commands::Scenario { likes, faults } => {
            let report = run_scenario(likes, faults).await?;
            println!("{}", report);
        }
    }

    Ok(())
}

async fn open(config: TallyConfig, data: Option<&Path>) -> Result<TallyDb> {
    let db = match data {
        Some(path) => TallyDb::open_snapshot(config, path)
            .await
            .with_context(|| format!("failed to open {}", path.display()))?,
        None => TallyDb::open(config)?,
    };
    Ok(db)
}

async fn save(db: &TallyDb, data: Option<&Path>) -> Result<()> {
    if let Some(path) = data {
        db.save_snapshot(path)
            .await
            .with_context(|| format!("failed to save {}", path.display()))?;
    }
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tallydb=info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

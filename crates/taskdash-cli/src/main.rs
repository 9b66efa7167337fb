use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use taskdash_ingest::MissingDatePolicy;
use taskdash_storage::{DocumentStore, MemoryStore, PgDocumentStore};
use taskdash_sync::{open_store, store_status, IngestConfig, IngestPipeline};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Debug, Parser)]
#[command(name = "taskdash")]
#[command(about = "Task CSV ingestion service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the ingestion HTTP API.
    Serve {
        #[arg(long)]
        port: Option<u16>,
        #[command(flatten)]
        ingest: IngestArgs,
    },
    /// Ingest one CSV file and print the run summary.
    Ingest {
        path: PathBuf,
        /// Normalize and write into a throwaway in-memory store.
        #[arg(long)]
        dry_run: bool,
        #[command(flatten)]
        ingest: IngestArgs,
    },
    /// Create the document tables.
    Migrate,
    /// Print store counts and the last ingestion run.
    Status,
}

#[derive(Debug, clap::Args)]
struct IngestArgs {
    /// `reject` or `fallback` for rows with unparseable dates.
    #[arg(long)]
    policy: Option<MissingDatePolicy>,
    /// YAML ingest profile with extra header synonyms.
    #[arg(long)]
    profile: Option<PathBuf>,
}

impl IngestArgs {
    fn apply(self, config: &mut IngestConfig) {
        if let Some(policy) = self.policy {
            config.date_policy = policy;
        }
        if let Some(profile) = self.profile {
            config.profile_path = Some(profile);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut config = IngestConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve {
        port: None,
        ingest: IngestArgs {
            policy: None,
            profile: None,
        },
    }) {
        Commands::Serve { port, ingest } => {
            ingest.apply(&mut config);
            if let Some(port) = port {
                config.web_port = port;
            }
            taskdash_web::serve_with_config(config).await?;
        }
        Commands::Ingest {
            path,
            dry_run,
            ingest,
        } => {
            ingest.apply(&mut config);
            let bytes = tokio::fs::read(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let store: Arc<dyn DocumentStore> = if dry_run {
                info!("dry run; writing to an in-memory store");
                Arc::new(MemoryStore::new())
            } else if config.database_url.is_none() {
                bail!("DATABASE_URL is required unless --dry-run is given");
            } else {
                open_store(&config).await?
            };

            let source_name = path.file_name().and_then(|n| n.to_str());
            let result = match IngestPipeline::from_config(store.clone(), &config) {
                Ok(pipeline) => pipeline
                    .run(&bytes, source_name)
                    .await
                    .map_err(anyhow::Error::from),
                Err(err) => Err(err),
            };
            store.close().await;
            let summary = result.with_context(|| format!("ingesting {}", path.display()))?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Migrate => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL is required for migrate")?;
            let store = PgDocumentStore::connect(url, config.store_timeout())
                .await
                .context("connecting to postgres document store")?;
            let result = store.migrate().await.context("creating document tables");
            store.close().await;
            result?;
            println!("migrations applied: tasks, resources, metadata");
        }
        Commands::Status => {
            let store = open_store(&config).await?;
            let status = store_status(store.as_ref()).await;
            store.close().await;
            let status = status.context("store unavailable")?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    Ok(())
}

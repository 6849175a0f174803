use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use formpull_client::FormClient;
use formpull_pipeline::{MappingConfig, PageDriver, PagePullRequest, SyncConfig};
use formpull_store::{FileBlobStore, FileRecordStore, SchemaMap};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "formpull")]
#[command(about = "Pull survey-form submissions into the local record store")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Import one page; prints the next page index for re-enqueue.
    PullPage {
        #[arg(long, default_value_t = 10)]
        page_size: u32,
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long)]
        with_attachments: bool,
        #[arg(long)]
        log_missing: bool,
    },
    /// Import every page, following the service cursor until exhausted.
    PullAll {
        #[arg(long, default_value_t = 500)]
        page_size: u32,
        #[arg(long)]
        with_attachments: bool,
    },
}

fn build_driver(config: &SyncConfig) -> Result<PageDriver> {
    let mapping = MappingConfig::load(&config.mapping_path)?;
    let schema = Arc::new(
        SchemaMap::load(&config.schema_path).context("loading target schema")?,
    );
    let client = FormClient::new(config.client_config()).context("building form client")?;

    Ok(PageDriver::new(
        Arc::new(client),
        Arc::new(FileRecordStore::new(config.records_dir.clone())),
        Arc::new(FileBlobStore::new(config.blobs_dir.clone())),
        schema,
        mapping,
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    let driver = build_driver(&config)?;

    match cli.command {
        Commands::PullPage {
            page_size,
            page,
            with_attachments,
            log_missing,
        } => {
            let pull = driver
                .pull_page(PagePullRequest {
                    page_size,
                    page_index: page,
                    with_attachments,
                    log_missing,
                })
                .await?;
            match pull.next_page_index {
                Some(next) => println!(
                    "imported={} page={} next_page={}",
                    pull.imported, pull.page_index, next
                ),
                None => println!(
                    "imported={} page={} next_page=none",
                    pull.imported, pull.page_index
                ),
            }
        }
        Commands::PullAll {
            page_size,
            with_attachments,
        } => {
            let pull = driver.pull_all(page_size, with_attachments).await?;
            println!("imported={}", pull.imported);
        }
    }

    Ok(())
}

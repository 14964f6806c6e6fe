use anyhow::{bail, Result};
use bfw_enrich::{AnthropicClient, Enricher};
use bfw_sync::{Pipeline, RunSummary, SyncConfig};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "bfw-cli")]
#[command(about = "BestFoodWhere data pipeline command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply the pipeline schema migrations.
    Migrate,
    /// Ingest one mall directory page into the mall-restaurant summaries.
    SyncDirectory {
        /// Mall slug the listings belong to.
        #[arg(long)]
        mall: String,
        /// Directory page URL.
        #[arg(long)]
        url: String,
    },
    /// Scrape every enabled source and full-replace the stored menus.
    SyncMenus {
        /// Restrict the run to one brand slug.
        #[arg(long)]
        brand: Option<String>,
    },
    /// Re-scrape sources and reconcile item images into object storage.
    SyncImages {
        #[arg(long)]
        brand: Option<String>,
    },
    /// Generate descriptions and recommendations for brands missing them.
    Enrich {
        /// Maximum number of brands to enrich in this run.
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Print a digest of the most recent pipeline runs.
    Report {
        #[arg(long, default_value_t = 7)]
        runs: usize,
    },
}

fn init_tracing() {
    let _ = SubscriberBuilder::default()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .try_init();
}

fn print_summary(summary: &RunSummary) {
    println!(
        "{} complete: run_id={} processed={} failed={} skipped={}",
        summary.operation, summary.run_id, summary.processed, summary.failed, summary.skipped
    );
    for (source, count) in &summary.per_source {
        println!("  {source}: {count}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Migrate => {
            let config = SyncConfig::from_env()?;
            let pipeline = Pipeline::connect(config).await?;
            pipeline.run_migrations().await?;
            println!("migrations applied");
        }
        Commands::SyncDirectory { mall, url } => {
            let config = SyncConfig::from_env()?;
            let pipeline = Pipeline::connect(config).await?;
            let summary = pipeline.run_directory_sync(&mall, &url).await?;
            print_summary(&summary);
        }
        Commands::SyncMenus { brand } => {
            let config = SyncConfig::from_env()?;
            let pipeline = Pipeline::connect(config).await?;
            let summary = pipeline.run_menu_sync(brand.as_deref()).await?;
            print_summary(&summary);
        }
        Commands::SyncImages { brand } => {
            let config = SyncConfig::from_env()?;
            let pipeline = Pipeline::connect(config).await?;
            let summary = pipeline.run_image_sync(brand.as_deref()).await?;
            print_summary(&summary);
        }
        Commands::Enrich { limit } => {
            let config = SyncConfig::from_env()?;
            let Some(api_key) = config.anthropic_api_key.clone() else {
                bail!("ANTHROPIC_API_KEY is required for enrichment");
            };
            let pipeline = Pipeline::connect(config).await?;
            let enricher = Enricher::new(Box::new(AnthropicClient::new(api_key)));
            let summary = pipeline.run_enrichment(&enricher, limit).await?;
            print_summary(&summary);
        }
        Commands::Report { runs } => {
            let digest = bfw_sync::report_recent_markdown(runs, None)?;
            println!("{digest}");
        }
    }

    Ok(())
}

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dih_harvest::{
    download_documents, DocumentDownloadConfig, HarvestConfig, WindowHarvester,
};
use dih_merge::{Consolidator, MergeConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "dih-cli")]
#[command(about = "Donation intelligence hub command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Harvest one year of donation records into monthly partition stores.
    Harvest {
        #[arg(long)]
        year: Option<i32>,
        #[arg(long)]
        source: Option<String>,
    },
    /// Consolidate partition stores and batch inputs into the canonical store.
    Merge {
        /// Re-run a single source group instead of a full rebuild.
        #[arg(long)]
        group: Option<String>,
    },
    /// Print the planned fetch windows for a year.
    Plan {
        #[arg(long)]
        year: Option<i32>,
    },
    /// Download report documents from a file of discovered links.
    FetchDocuments {
        links_file: PathBuf,
        #[arg(long, default_value = "./data/raw/united24")]
        target_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Harvest {
        year: None,
        source: None,
    }) {
        Commands::Harvest { year, source } => {
            let mut config = HarvestConfig::from_env();
            if let Some(year) = year {
                config.year = year;
            }
            if let Some(source) = source {
                config.source_id = source;
            }
            let harvester = WindowHarvester::new(config)?;
            let summary = harvester.harvest_year().await?;
            println!(
                "harvest complete: run_id={} source={} year={} windows={} new_rows={}",
                summary.run_id,
                summary.source_id,
                summary.year,
                summary.windows.len(),
                summary.new_rows
            );
        }
        Commands::Merge { group } => {
            let consolidator = Consolidator::new(MergeConfig::from_env())?;
            let summary = match group {
                Some(group) => consolidator.merge_group(&group)?,
                None => consolidator.merge_all()?,
            };
            println!(
                "merge complete: run_id={} groups={} total_rows={} master={}",
                summary.run_id,
                summary.groups.len(),
                summary.total_rows,
                summary.master_path
            );
        }
        Commands::Plan { year } => {
            let year = year.unwrap_or_else(|| HarvestConfig::from_env().year);
            for window in dih_core::plan_year(year) {
                println!(
                    "{}  {} .. {}",
                    window.label(),
                    window.date_from_param(),
                    window.date_to_param()
                );
            }
        }
        Commands::FetchDocuments {
            links_file,
            target_dir,
        } => {
            let text = std::fs::read_to_string(&links_file)
                .with_context(|| format!("reading {}", links_file.display()))?;
            let links: Vec<String> = text
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect();
            let config = DocumentDownloadConfig {
                target_dir,
                pause: Duration::from_secs(1),
                http: HarvestConfig::from_env().http,
            };
            let summary = download_documents(&config, &links).await?;
            println!(
                "documents: downloaded={} skipped={} failed={}",
                summary.downloaded, summary.skipped, summary.failed
            );
        }
    }

    Ok(())
}

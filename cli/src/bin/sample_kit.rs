use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use color_eyre::eyre::Result;
use sample_kit::RunConfig;
use sample_pipeline::{Field, TrainDataset};
use tracing::{info, warn};
use tracing_subscriber::{self, EnvFilter};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Prepare, cache and iterate the dataset described by a run file
    Prepare {
        /// Path to the TOML or JSON run file
        #[arg(short, long)]
        config: PathBuf,
        /// Number of epochs to iterate
        #[arg(short, long, default_value = "1")]
        epochs: u64,
    },
    /// Print the JSON schema of the run file
    Schema,
}

fn main() -> Result<()> {
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Prepare { config, epochs } => {
            prepare(config, *epochs)?;
        }
        Commands::Schema => {
            println!("{}", RunConfig::schema_json()?);
        }
    }

    Ok(())
}

fn prepare(config_path: &Path, epochs: u64) -> Result<()> {
    let run = RunConfig::from_file(config_path)?;
    info!(
        "Run file {}: {} concepts, variant {}",
        config_path.display(),
        run.dataset.concepts.len(),
        run.dataset.variant
    );

    let dataset = TrainDataset::new(run.dataset.clone(), run.collaborators.context()?)?;
    if dataset.is_empty() {
        warn!("No samples found in any concept directory");
        return Ok(());
    }

    for epoch in 0..epochs {
        let batches = dataset.epoch(epoch)?;
        let report = batches.report().clone();
        for skip in &report.skipped {
            warn!("Skipped {}: {}", skip.path.display(), skip.reason);
        }

        let mut emitted = 0usize;
        let mut samples = 0usize;
        let mut failed = 0usize;
        for batch in batches {
            match batch {
                Ok(batch) => {
                    let latents = batch.stack(Field::LatentImage)?;
                    tracing::debug!("Batch {} {:?}", batch.crop_resolution, latents.shape);
                    emitted += 1;
                    samples += batch.len();
                }
                Err(e) => {
                    warn!("Batch failed to load: {}", e);
                    failed += 1;
                }
            }
        }

        info!(
            "Epoch {}: {} batches ({} samples), {} failed, {} skipped, cache {} hits / {} misses",
            epoch,
            emitted,
            samples,
            failed,
            report.skipped.len(),
            report.cache_hits,
            report.cache_misses
        );
        for (resolution, count) in &report.buckets {
            info!("  bucket {}: {} samples", resolution, count);
        }
    }

    info!("✅ Dataset preparation completed!");
    Ok(())
}

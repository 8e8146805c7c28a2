mod dataset;
mod prepare;
mod schedule;
mod trainer;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about = "Bouquet fine-tuning and dataset utilities")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fine-tune LoRA adapters on a captioned image set
    Train(trainer::TrainArgs),
    /// Resize raw photos to the training resolution and draft captions
    Prepare(prepare::PrepareArgs),
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    match Args::parse().command {
        Command::Train(args) => trainer::run(args),
        Command::Prepare(args) => {
            let summary = prepare::run(args)?;
            tracing::info!(
                processed = summary.processed,
                skipped = summary.skipped,
                "dataset preparation finished"
            );
            Ok(())
        }
    }
}

//! POLARtron dry-run CLI.
//!
//! Loads configuration, then runs the full protocol against the in-process
//! mock deck and prints the run summary as JSON.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use polartron::config::ProtocolConfig;
use polartron::hardware::mock::MockDeck;
use polartron::hardware::Deck;
use polartron::labware::ChannelClass;
use polartron::{logging, Choreographer};

#[derive(Parser)]
#[command(name = "polartron")]
#[command(about = "Dry-run the POLARtron extraction and RT-PCR setup protocol")]
struct Args {
    /// TOML configuration file layered over the built-in defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Experiment name prefixed to the run log
    #[arg(long)]
    experiment: Option<String>,

    /// Number of sample lanes (overrides configuration)
    #[arg(long)]
    samples: Option<usize>,

    /// Log level (overrides configuration; RUST_LOG still wins)
    #[arg(long)]
    log_level: Option<String>,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ProtocolConfig::load_from(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ProtocolConfig::load()?,
    };
    if let Some(count) = args.samples {
        config.samples.count = count;
    }
    if let Some(level) = args.log_level {
        config.application.log_level = level;
    }
    config.validate()?;

    if args.print_config {
        print!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    logging::init_from_config(&config)?;
    info!(name = %config.application.name, lanes = config.samples.count, "Starting dry run");

    let mock = Arc::new(MockDeck::with_default_rates(
        config.default_rates(ChannelClass::LowVolume),
        config.default_rates(ChannelClass::HighVolume),
    ));
    let mut choreographer = Choreographer::new(Deck::from_single(mock.clone()), config, args.experiment)?;
    let summary = choreographer.run().await?;

    info!(hardware_calls = mock.events().len(), "Dry run complete");
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

//! MPRTP Simulator - Loss detection on a synthetic multipath stream
//!
//! Replays a generated trace through the feedback manager in virtual time and
//! reports how accurately and how quickly losses were declared.

use clap::Parser;
use mprtp_cli::{compact_report, display_report, Config, Simulator};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mprtp-sim")]
#[command(about = "MPRTP loss detection simulator", long_about = None)]
struct Args {
    /// Configuration file (TOML); the built-in example is used when absent
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write the example configuration to this path and exit
    #[arg(long)]
    write_example: Option<PathBuf>,

    /// Primary estimator (single-path, cross-path)
    #[arg(short, long)]
    estimator: Option<String>,

    /// Comparison estimator
    #[arg(long)]
    comparison: Option<String>,

    /// Predictor (ma, ar2)
    #[arg(short, long)]
    predictor: Option<String>,

    /// Packets to simulate
    #[arg(short = 'n', long)]
    packets: Option<usize>,

    /// Loss probability applied to every flow
    #[arg(long)]
    loss: Option<f64>,

    /// RNG seed
    #[arg(short, long)]
    seed: Option<u64>,

    /// Print a one-line summary instead of the full report
    #[arg(long)]
    compact: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    if let Some(path) = &args.write_example {
        Config::example().to_file(path)?;
        tracing::info!("Wrote example configuration to {}", path.display());
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => {
            tracing::info!("Loading configuration from {}", path.display());
            Config::from_file(path)
                .map_err(|e| anyhow::anyhow!("Failed to load '{}': {}", path.display(), e))?
        }
        None => Config::example(),
    };

    if let Some(estimator) = args.estimator {
        config.session.estimator = estimator;
    }
    if let Some(comparison) = args.comparison {
        config.session.comparison = Some(comparison);
    }
    if let Some(predictor) = args.predictor {
        config.predictor.kind = predictor;
    }
    if let Some(packets) = args.packets {
        config.simulation.packets = packets;
    }
    if let Some(loss) = args.loss {
        if !(0.0..=1.0).contains(&loss) {
            anyhow::bail!("Invalid loss probability: {}", loss);
        }
        config.flows.iter_mut().for_each(|f| f.loss = loss);
    }
    if args.seed.is_some() {
        config.simulation.seed = args.seed;
    }

    config.validate()?;
    tracing::info!(
        "Simulating {} packets over {} flows with {} / {}",
        config.simulation.packets,
        config.flows.len(),
        config.session.estimator,
        config.predictor.kind
    );

    let simulator = Simulator::new(&config)?;
    let report = simulator.run();

    if args.compact {
        println!("{}", compact_report(&report));
    } else {
        display_report(&report);
    }

    Ok(())
}

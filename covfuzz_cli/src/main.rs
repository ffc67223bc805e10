mod targets;

use covfuzz_core::config::FuzzConfig;
use covfuzz_core::engine::FuzzSession;
use covfuzz_core::harness::{InProcessHarness, TargetSpec};

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_FILE: &str = "covfuzz.toml";

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Fully-qualified type name, e.g. `demo.markup.Validator`
    target: String,
    /// Method signature, e.g. `validate(String)`
    signature: String,
    #[clap(short = 'p', long = "search-path", value_parser)]
    search_path: Vec<PathBuf>,
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// Wall-clock budget in seconds
    #[clap(short, long)]
    time_budget: Option<u64>,
    /// PRNG seed; chosen at random and printed when omitted
    #[clap(short, long)]
    seed: Option<u64>,
    #[clap(long)]
    max_trials: Option<u64>,
    #[clap(short, long, value_parser)]
    report_dir: Option<PathBuf>,
    #[clap(short, long)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn load_config(cli: &Cli) -> Result<FuzzConfig, anyhow::Error> {
    let mut config = match &cli.config_file {
        Some(config_path) => {
            tracing::info!(path = ?config_path, "Loading configuration");
            FuzzConfig::load_from_file(config_path)?
        }
        None => {
            let default_config_path = PathBuf::from(DEFAULT_CONFIG_FILE);
            if default_config_path.exists() {
                tracing::info!(path = ?default_config_path, "Loading default configuration");
                FuzzConfig::load_from_file(&default_config_path)?
            } else {
                FuzzConfig::default()
            }
        }
    };

    if let Some(time_budget) = cli.time_budget {
        config.session.time_budget_secs = time_budget;
    }
    if let Some(seed) = cli.seed {
        config.session.seed = Some(seed);
    }
    if let Some(max_trials) = cli.max_trials {
        config.session.max_trials = Some(max_trials);
    }
    if let Some(report_dir) = &cli.report_dir {
        config.report.report_dir = report_dir.clone();
    }
    config
        .validate()
        .context("Invalid configuration after applying command-line overrides")?;
    Ok(config)
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = load_config(&cli)?;
    tracing::debug!(?config, "Effective configuration");

    let mut harness = InProcessHarness::new();
    targets::register_demo_targets(&mut harness);

    let target = TargetSpec {
        type_name: cli.target.clone(),
        signature: cli.signature.clone(),
        search_path: cli.search_path.clone(),
    };
    let mut session = FuzzSession::new(harness, target, config)
        .context("Failed to set up fuzz session")?;
    println!("PRNG seed: {}", session.seed());

    let summary = session
        .run()
        .with_context(|| format!("Fuzzing {}.{} failed", cli.target, cli.signature))?;

    println!("\nFuzz session finished.");
    println!("{summary}");
    Ok(())
}

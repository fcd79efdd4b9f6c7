//! Command-line runner for the backtest engine.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kestrel::config::EngineConfig;
use kestrel::data::{load_bars, validate_bars, CsvProvider, LoaderConfig, Severity};
use kestrel::declarative::DeclarativeStrategy;
use kestrel::engine::Engine;
use kestrel::types::Timeframe;
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Kestrel - a deterministic bar-replay backtesting engine.
#[derive(Parser)]
#[command(name = "kestrel")]
#[command(version)]
#[command(about = "Deterministic backtesting for bar-based trading strategies")]
struct Cli {
    /// Verbosity (-v = debug, -vv = trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a declarative strategy against a data file
    Run {
        /// Path to 1m OHLCV data (CSV or Parquet)
        #[arg(short, long)]
        data: PathBuf,

        /// Path to the strategy JSON
        #[arg(short, long)]
        strategy: PathBuf,

        /// Optional engine config TOML
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Symbol name (inferred from the filename when omitted)
        #[arg(long, default_value = "")]
        symbol: String,

        /// Print the monthly breakdown table
        #[arg(long)]
        monthly: bool,
    },

    /// Validate a data file and report quality issues
    Validate {
        /// Path to the data file
        #[arg(short, long)]
        data: PathBuf,

        /// Expected bar timeframe
        #[arg(long, default_value = "1m")]
        timeframe: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    match cli.command {
        Commands::Run {
            data,
            strategy,
            config,
            symbol,
            monthly,
        } => {
            let mut strategy = DeclarativeStrategy::from_json_path(&strategy)
                .with_context(|| format!("loading strategy {}", strategy.display()))?;

            let mut engine_config = match config {
                Some(path) => EngineConfig::from_toml_path(&path)
                    .with_context(|| format!("loading config {}", path.display()))?,
                None => EngineConfig::default(),
            };
            if engine_config.indicators.is_empty() {
                engine_config.indicators = strategy.indicators().clone();
            }

            let mut provider = CsvProvider::new(&data, &symbol, &LoaderConfig::default())
                .with_context(|| format!("loading data {}", data.display()))?;

            let mut engine = Engine::new(engine_config)?;
            let results = engine.run(&mut strategy, &mut provider)?;

            println!("{}", results.summary());
            if monthly {
                println!("{}", results.monthly_table());
            }
        }

        Commands::Validate { data, timeframe } => {
            let timeframe = Timeframe::parse(&timeframe)?;
            let bars = load_bars(&data, &LoaderConfig::default())
                .with_context(|| format!("loading data {}", data.display()))?;
            let issues = validate_bars(&bars, timeframe, 2.0);

            if issues.is_empty() {
                println!("OK: {} bars, no issues found", bars.len());
            } else {
                let errors = issues
                    .iter()
                    .filter(|i| i.severity == Severity::Error)
                    .count();
                println!(
                    "{} issue(s) found ({} errors) in {} bars:",
                    issues.len(),
                    errors,
                    bars.len()
                );
                for issue in &issues {
                    println!("  {issue}");
                }
                if errors > 0 {
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}

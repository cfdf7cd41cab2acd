mod commands;
mod input;
mod output;

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use std::process;
use tracing_subscriber::EnvFilter;

use commands::calculate::{BatchArgs, CalculateArgs};
use commands::economics::EconomicsArgs;
use commands::formula::{FormulaTestArgs, FormulaValidateArgs};
use commands::reconcile::ReconcileArgs;

/// Deal fee schedule calculation with decimal precision
#[derive(Parser)]
#[command(
    name = "fee-engine",
    version,
    about = "Deal fee schedule calculation with decimal precision",
    long_about = "Applies a deal's fee schedule to investor commitments in precedence order \
                  (premium, structuring, management, admin, performance), evaluates deal \
                  formulas, and reconciles stored fee records against fresh calculations."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format
    #[arg(long, default_value = "json", global = true)]
    output: OutputFormat,

    /// Log filter for stderr (e.g. "debug", "fee_engine_core=trace"); RUST_LOG also works
    #[arg(long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply a deal's fee schedule to one investor
    Calculate(CalculateArgs),
    /// Apply a deal's fee schedule to many investors
    Batch(BatchArgs),
    /// Evaluate a formula against sample variables
    FormulaTest(FormulaTestArgs),
    /// Check formula syntax and list its variables
    FormulaValidate(FormulaValidateArgs),
    /// Evaluate a deal's formula template (net capital, proceeds, MOIC)
    Economics(EconomicsArgs),
    /// Compare stored fee records with recalculated fees
    Reconcile(ReconcileArgs),
    /// Print version information
    Version,
}

#[derive(Debug, Clone, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Csv,
    Minimal,
}

/// Logs go to stderr so stdout stays machine-readable.
fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    let result: Result<serde_json::Value, Box<dyn std::error::Error>> = match cli.command {
        Commands::Calculate(args) => commands::calculate::run_calculate(args),
        Commands::Batch(args) => commands::calculate::run_batch(args),
        Commands::FormulaTest(args) => commands::formula::run_formula_test(args),
        Commands::FormulaValidate(args) => commands::formula::run_formula_validate(args),
        Commands::Economics(args) => commands::economics::run_economics(args),
        Commands::Reconcile(args) => commands::reconcile::run_reconcile(args),
        Commands::Version => {
            println!("fee-engine {}", env!("CARGO_PKG_VERSION"));
            return;
        }
    };

    match result {
        Ok(value) => {
            output::format_output(&cli.output, &value);
            process::exit(0);
        }
        Err(e) => {
            eprintln!("{}: {}", "error".red().bold(), e);
            process::exit(1);
        }
    }
}

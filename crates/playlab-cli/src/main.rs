//! PlayLab CLI - run backtests, compare runs, inspect structure types.
//!
//! Engine error codes map 1-to-1 to process exit codes (see
//! [`commands::exit_code_for`]).

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;
mod data;
mod indicators;

use commands::{compare, run, structures};

#[derive(Parser)]
#[command(name = "playlab")]
#[command(author, version, about = "Deterministic Play backtester for USDT perpetuals", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a Play over a bar file and write run artifacts
    Run {
        /// Path to the Play document (JSON)
        #[arg(short, long)]
        play: String,

        /// Path to the exec-TF bars parquet file
        #[arg(short, long)]
        bars: String,

        /// Additional HTF bar files as label=path (e.g. 1h=data/btc_1h.parquet)
        #[arg(long)]
        htf_bars: Vec<String>,

        /// Window start (RFC 3339, e.g. 2024-01-02T00:00:00Z)
        #[arg(long)]
        start: String,

        /// Window end (RFC 3339)
        #[arg(long)]
        end: String,

        /// Output directory for run artifacts
        #[arg(short, long, default_value = "runs")]
        out: String,

        /// Warmup bars per TF role
        #[arg(long, default_value = "50")]
        warmup: usize,

        /// Also write events.csv
        #[arg(long, default_value = "false")]
        events: bool,
    },

    /// Compare two run directories for hash equality
    Compare {
        /// First run directory
        run_a: String,
        /// Second run directory
        run_b: String,
    },

    /// Structure registry commands
    Structures {
        #[command(subcommand)]
        command: StructuresCommands,
    },
}

#[derive(Subcommand)]
enum StructuresCommands {
    /// List registered structure types with their params and dependencies
    List,
}

fn main() -> Result<()> {
    let _guard = playlab_logging::init_logging(&playlab_logging::LogConfig::from_env());
    let cli = Cli::parse();

    let exit_code = match cli.command {
        Commands::Run {
            play,
            bars,
            htf_bars,
            start,
            end,
            out,
            warmup,
            events,
        } => run::execute(&run::RunArgs {
            play,
            bars,
            htf_bars,
            start,
            end,
            out,
            warmup,
            events,
        })?,
        Commands::Compare { run_a, run_b } => compare::execute(&run_a, &run_b)?,
        Commands::Structures { command } => match command {
            StructuresCommands::List => structures::list()?,
        },
    };

    std::process::exit(exit_code);
}

//! CLI for DOAT: benchmark a DPDK application out of band, mutate its
//! build configuration, and compare the two runs.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "doat")]
#[command(about = "doat: DPDK out-of-band analysis tool")]
#[command(version = doat_core::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the baseline pass and, when enabled, the optimisation pass
    Run {
        /// Configuration file
        #[arg(long, default_value = "doat.toml")]
        config: PathBuf,

        /// Artifact and results directory (overrides tools.artifact_dir)
        #[arg(long)]
        output: Option<PathBuf>,

        /// Only run the baseline pass
        #[arg(long)]
        no_optimise: bool,
    },

    /// Validate the configuration and print what a run would do
    Check {
        #[arg(long, default_value = "doat.toml")]
        config: PathBuf,
    },

    /// Sample DPDK telemetry into a CSV file (spawned by `doat run`)
    TelemetryClient {
        /// Output CSV path
        #[arg(long)]
        csv: PathBuf,

        /// Seconds to sample for
        #[arg(long)]
        run_time: f64,

        /// Seconds between samples
        #[arg(long, default_value = "1")]
        step: f64,

        /// Ethernet device port to read xstats from
        #[arg(long, default_value = "0")]
        port: u16,

        /// Telemetry socket (default: discover running DPDK instances)
        #[arg(long)]
        socket: Option<PathBuf>,

        /// Reply timeout in seconds
        #[arg(long, default_value = "5")]
        read_timeout: f64,
    },

    /// Re-analyse existing artifacts without running anything
    Compare {
        #[arg(long, default_value = "doat.toml")]
        config: PathBuf,

        /// Directory holding pcm.csv, wallpower.csv, telemetry.csv
        #[arg(long)]
        baseline: Option<PathBuf>,

        /// Directory holding pcm_op.csv, wallpower_op.csv, telemetry_op.csv
        #[arg(long)]
        modified: Option<PathBuf>,

        /// Where to write results.json and index.html (default: the baseline directory)
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Serve a finished results directory over HTTP
    Serve {
        /// Results directory
        #[arg(long, default_value = "tmp")]
        dir: PathBuf,

        #[arg(long, default_value = "80")]
        port: u16,

        #[arg(long, default_value = "127.0.0.1")]
        host: String,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            config,
            output,
            no_optimise,
        } => commands::run::run(&config, output.as_deref(), no_optimise),
        Commands::Check { config } => commands::check::run(&config),
        Commands::TelemetryClient {
            csv,
            run_time,
            step,
            port,
            socket,
            read_timeout,
        } => commands::telemetry_client::run(&csv, run_time, step, port, socket, read_timeout),
        Commands::Compare {
            config,
            baseline,
            modified,
            output,
        } => commands::compare::run(
            &config,
            baseline.as_deref(),
            modified.as_deref(),
            output.as_deref(),
        ),
        Commands::Serve { dir, port, host } => commands::serve::run(dir, &host, port),
    };

    if let Err(e) = result {
        commands::exit_with_error(&e);
    }
}

//! Key space migration tool
//!
//! Dumps a cluster's key space to a record stream, restores it into another
//! cluster, and verifies that two clusters hold equivalent data.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use keyspace_migrate::config::{ClusterEndpoint, VerifyConfig};
use keyspace_migrate::dump::{self, DumpOptions};
use keyspace_migrate::progress::Progress;
use keyspace_migrate::store::RedisConnector;
use keyspace_migrate::{record, restore, verify};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "keyspace-migrate")]
#[command(about = "Dump, restore and verify the key space of a sharded cluster", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Hide the progress spinner
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Dump every key of a cluster to a record stream
    Dump {
        /// Seed node host
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Seed node port
        #[arg(short, long, default_value_t = 6379)]
        port: u16,

        /// Output file for the record stream
        #[arg(short, long)]
        output: PathBuf,

        /// COUNT hint for node-local scans
        #[arg(long, default_value_t = keyspace_migrate::config::DEFAULT_SCAN_BATCH)]
        scan_batch: usize,
    },

    /// Restore a record stream into a cluster, replacing existing keys
    Restore {
        /// Seed node host
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Seed node port
        #[arg(short, long, default_value_t = 6379)]
        port: u16,

        /// Record stream produced by `dump`
        #[arg(short, long)]
        input: PathBuf,
    },

    /// Compare the key spaces of two clusters
    Verify {
        /// YAML file with source, target and tolerances
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Source cluster seed node (host:port)
        #[arg(long)]
        source: Option<ClusterEndpoint>,

        /// Target cluster seed node (host:port)
        #[arg(long)]
        target: Option<ClusterEndpoint>,

        /// Allowed TTL difference in seconds
        #[arg(long)]
        ttl_tolerance: Option<i64>,

        /// COUNT hint for node-local scans
        #[arg(long)]
        scan_batch: Option<usize>,

        /// Report format
        #[arg(short, long, value_enum, default_value_t = ReportFormat::Text)]
        format: ReportFormat,
    },

    /// Decode a record stream and print its statistics
    Inspect {
        /// Record stream produced by `dump`
        #[arg(short, long)]
        input: PathBuf,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ReportFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let show_progress = !cli.quiet;

    match cli.command {
        Commands::Dump {
            host,
            port,
            output,
            scan_batch,
        } => {
            let endpoint = ClusterEndpoint::new(host, port);
            let options = DumpOptions { scan_batch };
            let progress = Progress::new("dumped", show_progress);
            dump::dump(&RedisConnector, &endpoint, &output, &options, &progress)
                .await
                .context("Dump failed")?;
        }

        Commands::Restore { host, port, input } => {
            let endpoint = ClusterEndpoint::new(host, port);
            let progress = Progress::new("restored", show_progress);
            let summary = restore::restore(&RedisConnector, &endpoint, &input, &progress)
                .await
                .context("Restore failed")?;
            if summary.rejected > 0 {
                error!(
                    "{} of {} records were rejected by the target",
                    summary.rejected,
                    summary.restored + summary.rejected
                );
            }
        }

        Commands::Verify {
            config,
            source,
            target,
            ttl_tolerance,
            scan_batch,
            format,
        } => {
            let mut verify_config = match config {
                Some(path) => VerifyConfig::from_file(&path)
                    .with_context(|| format!("Failed to load config {:?}", path))?,
                None => VerifyConfig::default(),
            };
            // Command line overrides the file
            if let Some(source) = source {
                verify_config.source = source;
            }
            if let Some(target) = target {
                verify_config.target = target;
            }
            if let Some(tolerance) = ttl_tolerance {
                verify_config.ttl_tolerance_secs = tolerance;
            }
            if let Some(batch) = scan_batch {
                verify_config.scan_batch = batch;
            }

            info!(
                "Verifying {} against {}",
                verify_config.target, verify_config.source
            );
            let report = verify::verify(&RedisConnector, &verify_config)
                .await
                .context("Verification could not complete")?;

            match format {
                ReportFormat::Text => print!("{}", report),
                ReportFormat::Json => println!(
                    "{}",
                    serde_json::to_string_pretty(&report).context("Failed to encode report")?
                ),
            }

            if !report.is_success() {
                return Ok(ExitCode::FAILURE);
            }
        }

        Commands::Inspect { input } => {
            let stats = record::inspect_stream(&input)
                .await
                .with_context(|| format!("Failed to decode {:?}", input))?;
            println!("Records: {}", stats.records);
            println!("Records with TTL: {}", stats.records_with_ttl);
            println!("Key bytes: {}", stats.key_bytes);
            println!("Snapshot bytes: {}", stats.snapshot_bytes);
        }
    }

    Ok(ExitCode::SUCCESS)
}

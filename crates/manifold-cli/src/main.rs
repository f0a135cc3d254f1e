//! Manifold CLI - verifiable selector manifests
//!
//! Command-line interface for building manifests, gating codehash drift and checking artifacts.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

/// Manifold: ordered Merkle manifests for modular on-chain deployments
///
/// Builds selector → facet → code identity manifests from compiler output or a live
/// deployment, and fails closed when the two disagree.
#[derive(Parser)]
#[command(name = "manifold")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    /// Emit machine-readable results (and `{ok, class, error}` on failure)
    #[arg(long, global = true)]
    json: bool,

    /// Config file path (JSON)
    #[arg(short, long, global = true, env = "MANIFOLD_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a manifest bundle
    Build {
        #[command(subcommand)]
        mode: BuildMode,
    },

    /// Diff two codehash snapshots
    Diff {
        /// First snapshot file
        #[arg(long)]
        a: PathBuf,

        /// Second snapshot file
        #[arg(long)]
        b: PathBuf,
    },

    /// Compare the newest predictive and observed snapshots
    Gate {
        /// Output directory (defaults to pipeline.output_dir)
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },

    /// Re-verify every proof in a written bundle
    Selfcheck {
        /// Bundle directory (defaults to <output_dir>/predictive)
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },

    /// Verify (or regenerate) a bundle's SHA256SUMS
    Checksums {
        /// Bundle directory (defaults to <output_dir>/predictive)
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// Rewrite SHA256SUMS instead of verifying it
        #[arg(long)]
        write: bool,
    },
}

#[derive(Subcommand)]
enum BuildMode {
    /// Identities from compiler output
    Predictive {
        /// Selector manifest or record list (JSON)
        #[arg(short, long)]
        manifest: PathBuf,

        /// Compiler artifacts directory (defaults to pipeline.artifacts_dir)
        #[arg(short, long)]
        artifacts: Option<PathBuf>,

        /// Planned facet addresses `{name: address}` (JSON)
        #[arg(long)]
        addresses: Option<PathBuf>,

        /// Root the build must reproduce
        #[arg(long)]
        expected_root: Option<String>,

        /// Output directory
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Identities from a live deployment
    Observed {
        /// Selector manifest or record list (JSON)
        #[arg(short, long)]
        manifest: PathBuf,

        /// Deployed facet addresses `{name: address}` (JSON)
        #[arg(short, long)]
        deployed: PathBuf,

        /// JSON-RPC endpoint (overrides rpc.url)
        #[arg(long, env = "MANIFOLD_RPC_URL")]
        rpc_url: Option<String>,

        /// Output directory
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match commands::load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => commands::fail(&e, cli.json),
    };

    // Initialize logging
    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.clone()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    if cli.json_logs || config.logging.json_output {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    let json = cli.json;
    let result = match cli.command {
        Commands::Build { mode } => match mode {
            BuildMode::Predictive {
                manifest,
                artifacts,
                addresses,
                expected_root,
                out,
            } => commands::build::predictive(
                config,
                commands::build::PredictiveArgs {
                    manifest,
                    artifacts,
                    addresses,
                    expected_root,
                    out,
                },
                json,
            ),
            BuildMode::Observed {
                manifest,
                deployed,
                rpc_url,
                out,
            } => commands::build::observed(config, manifest, deployed, rpc_url, out, json),
        },
        Commands::Diff { a, b } => commands::diff::run(&config, a, b, json),
        Commands::Gate { dir } => commands::gate::run(config, dir, json),
        Commands::Selfcheck { dir } => commands::check::selfcheck(&config, dir, json),
        Commands::Checksums { dir, write } => commands::check::checksums(&config, dir, write, json),
    };

    if let Err(e) = result {
        commands::fail(&e, json);
    }
    Ok(())
}

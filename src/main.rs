//! CLI entry point for fdas-engine.
//!
//! Three modes:
//! - `serve`: run the sequencer against the control bus, plus the spool
//!   retention watcher when configured.
//! - `convert`: one-shot conversion of an existing run, for reprocessing
//!   captures whose live conversion was degraded or interrupted.
//! - `clean`: run only the spool retention watcher.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use fdas_engine::bus::mock::MockBus;
use fdas_engine::cleaner::RetentionWatcher;
use fdas_engine::config::{DegradedChassisPolicy, Settings};
use fdas_engine::convert::convert_run;
use fdas_engine::sequence::Engine;

// Use mimalloc for improved allocation performance in multi-threaded decode
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "fdas-engine")]
#[command(about = "Run sequencer and capture converter for a multi-chassis DAQ instrument", long_about = None)]
struct Cli {
    /// Path to a TOML settings file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the run sequencer
    Serve {
        /// Remote-value name prefix, overriding the settings file
        #[arg(long)]
        prefix: Option<String>,

        /// Run directory root, overriding the settings file
        #[arg(long)]
        data_root: Option<PathBuf>,
    },

    /// Convert one run's capture files to channel artifacts
    Convert {
        /// Run header written at stop time
        input: PathBuf,

        /// Where to write the final header and artifacts
        output: PathBuf,

        /// Skip chassis that did not produce exactly one capture file
        #[arg(long)]
        skip_degraded: bool,
    },

    /// Watch the capture spool directories and evict past quota
    Clean {
        /// Directories to watch, overriding the settings file
        dirs: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Serve { prefix, data_root } => serve(settings, prefix, data_root).await,
        Commands::Convert {
            input,
            output,
            skip_degraded,
        } => {
            let policy = if skip_degraded {
                DegradedChassisPolicy::Skip
            } else {
                settings.degraded_chassis
            };
            let summary = convert_run(&input, &output, policy)
                .await
                .with_context(|| format!("converting {}", input.display()))?;
            // Degraded conversions still wrote everything they could; the
            // nonzero exit just flags them for review.
            summary.into_result()?;
            Ok(())
        }
        Commands::Clean { dirs } => {
            let dirs = if dirs.is_empty() {
                settings.spool_dirs.clone()
            } else {
                dirs
            };
            if dirs.is_empty() {
                bail!("no spool directories given (flag or settings file)");
            }
            let watcher = spawn_retention(&settings, &dirs)?;
            watcher.await?;
            Ok(())
        }
    }
}

async fn serve(
    mut settings: Settings,
    prefix: Option<String>,
    data_root: Option<PathBuf>,
) -> Result<()> {
    if let Some(prefix) = prefix {
        settings.prefix = prefix;
    }
    if let Some(root) = data_root {
        settings.data_root = root;
    }

    let mut retention = None;
    if settings.retention_count > 0 && !settings.spool_dirs.is_empty() {
        retention = Some(spawn_retention(&settings, &settings.spool_dirs.clone())?);
    }

    // Loopback bus until a site links a real control-system client.
    let bus = Arc::new(MockBus::new());
    tracing::info!(
        "serving {} over {} (data root {})",
        env!("CARGO_PKG_NAME"),
        settings.prefix,
        settings.data_root.display()
    );
    Engine::new(bus, settings).run().await;

    if let Some(handle) = retention {
        handle.abort();
    }
    Ok(())
}

fn spawn_retention(
    settings: &Settings,
    dirs: &[PathBuf],
) -> Result<tokio::task::JoinHandle<()>> {
    let mut watcher = RetentionWatcher::new(&settings.retention_patterns, settings.retention_count)?;
    for dir in dirs {
        watcher
            .watch(dir)
            .with_context(|| format!("watching {}", dir.display()))?;
    }
    Ok(tokio::spawn(watcher.run()))
}

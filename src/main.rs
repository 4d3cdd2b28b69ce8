//! ps5vault command line front end.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use ps5vault_lib::config::EngineConfig;
use ps5vault_lib::content::ContentUnit;
use ps5vault_lib::errors::{VaultError, VaultResult};
use ps5vault_lib::path_policy::{ConflictPolicy, Layout};
use ps5vault_lib::progress::{ProgressEvent, ProgressSink};
use ps5vault_lib::transfer_engine::{Destination, TransferAction, TransferRequest};
use ps5vault_lib::Vault;

#[derive(Parser)]
#[command(name = "ps5vault", version, about = "Find PS5 game folders and copy or move them between disks and FTP servers")]
struct Cli {
    /// Config file (default: the per-user config location)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List content found under a directory or FTP address
    Scan {
        source: String,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Show where content would land and what already exists there
    Conflicts {
        source: String,
        destination: String,
        #[arg(short, long, default_value = "game-and-id")]
        layout: String,
        /// Folder name for the custom layout
        #[arg(long)]
        name: Option<String>,
        /// Only these content keys (repeatable)
        #[arg(long = "only")]
        only: Vec<String>,
    },
    /// Create, copy or move content to a destination
    Transfer {
        source: String,
        destination: String,
        /// create-only, copy or move
        #[arg(short, long, default_value = "copy")]
        action: String,
        #[arg(short, long, default_value = "game-and-id")]
        layout: String,
        /// skip, overwrite or rename
        #[arg(long, default_value = "rename")]
        conflict: String,
        /// Folder name for the custom layout
        #[arg(long)]
        name: Option<String>,
        /// Append the content version to the title folder
        #[arg(long)]
        version_suffix: bool,
        /// Only these content keys (repeatable)
        #[arg(long = "only")]
        only: Vec<String>,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Logs progress events as they arrive.
fn log_sink() -> Arc<dyn ProgressSink> {
    Arc::new(|event: ProgressEvent| match event {
        ProgressEvent::ItemStart {
            item_index,
            total_items,
            source,
        } => info!("[{}/{}] {}", item_index, total_items, source),
        ProgressEvent::FileComplete {
            file_rel_path,
            cumulative_bytes_copied,
            total_bytes,
        } => debug!("{} ({}/{} bytes)", file_rel_path, cumulative_bytes_copied, total_bytes),
        ProgressEvent::DiscoveryProgress { index, total, current_path } => {
            debug!("scan {}/{}: {}", index, total, current_path)
        }
        _ => {}
    })
}

fn select(units: Vec<ContentUnit>, only: &[String]) -> Vec<ContentUnit> {
    if only.is_empty() {
        return units;
    }
    units
        .into_iter()
        .filter(|u| only.iter().any(|k| k.eq_ignore_ascii_case(&u.content_key)))
        .collect()
}

fn print_units(units: &[ContentUnit]) {
    for unit in units {
        println!(
            "{:<12} {:<40} {:>14} {}",
            unit.content_key,
            unit.display_title.as_deref().unwrap_or("-"),
            unit.total_size.to_string(),
            unit.root
        );
    }
    println!("{} item(s)", units.len());
}

async fn run(cli: Cli, vault: Arc<Vault>) -> VaultResult<bool> {
    let operation = vault.begin_operation();
    let cancel = operation.token().clone();

    match cli.command {
        Commands::Scan { source, json } => {
            let units = vault.scan_source(&source, log_sink(), &cancel).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&units)?);
            } else {
                print_units(&units);
            }
            Ok(true)
        }
        Commands::Conflicts {
            source,
            destination,
            layout,
            name,
            only,
        } => {
            let units = select(vault.scan_source(&source, log_sink(), &cancel).await?, &only);
            let mut request = TransferRequest::new(
                units,
                Destination::parse(&destination, vault.config().ftp.default_port),
            )
            .with_layout(layout.parse::<Layout>()?);
            if let Some(name) = name {
                request = request.with_custom_name(name);
            }
            let conflicts = vault.check_conflicts(&request).await?;
            for info in &conflicts {
                let mark = if info.exists { "EXISTS" } else { "new" };
                println!("{:<6} {} -> {}", mark, info.source, info.target);
            }
            Ok(true)
        }
        Commands::Transfer {
            source,
            destination,
            action,
            layout,
            conflict,
            name,
            version_suffix,
            only,
        } => {
            let units = select(vault.scan_source(&source, log_sink(), &cancel).await?, &only);
            if units.is_empty() {
                warn!("Nothing to transfer");
                return Ok(true);
            }
            let mut request = TransferRequest::new(
                units,
                Destination::parse(&destination, vault.config().ftp.default_port),
            )
            .with_action(action.parse::<TransferAction>()?)
            .with_layout(layout.parse::<Layout>()?)
            .with_conflict(conflict.parse::<ConflictPolicy>()?);
            if let Some(name) = name {
                request = request.with_custom_name(name);
            }
            request.version_suffix = version_suffix;

            let report = vault.ensure_and_populate(&request, log_sink(), &cancel).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(!report.has_errors() && !report.cancelled)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match &cli.config {
        Some(path) => match EngineConfig::load_from(path) {
            Ok(config) => config,
            Err(e) => {
                error!("{}", e);
                return ExitCode::from(2);
            }
        },
        None => EngineConfig::load(),
    };
    let vault = match Vault::new(config) {
        Ok(vault) => Arc::new(vault),
        Err(e) => {
            error!("{}", e);
            return ExitCode::from(2);
        }
    };

    let watcher = Arc::clone(&vault);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            watcher.cancel_all();
        }
    });

    match run(cli, vault).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(VaultError::Cancelled) => {
            warn!("Cancelled");
            ExitCode::from(130)
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

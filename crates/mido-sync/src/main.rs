//! mido-sync: reconcile a cloud network model onto an SDN backend

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mido_sync::backend::{HttpApi, MidoClient};
use mido_sync::config::MidoConfig;
use mido_sync::reconcile::Reconciler;
use mido_sync::reconcile::admin::{self, render_inventory_table};
use mido_sync_common::GlobalNetworkInfo;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "mido-sync")]
#[command(about = "Reconcile a cloud network model onto an SDN backend")]
#[command(version)]
struct Args {
    /// Controller configuration file
    #[arg(short, long, global = true, default_value = "/etc/mido-sync/config.json")]
    config: PathBuf,

    /// Network-virtualization API endpoint (overrides the config file)
    #[arg(long, global = true, env = "MIDO_SYNC_API_URL")]
    api_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Reconcile the backend with the model
    Run {
        /// Desired-state network model (JSON)
        #[arg(short, long)]
        model: PathBuf,
    },

    /// Show what a run would change, without touching the backend
    Plan {
        /// Desired-state network model (JSON)
        #[arg(short, long)]
        model: PathBuf,

        /// Output format (table, json)
        #[arg(long, default_value = "table")]
        format: String,
    },

    /// Delete every object mido-sync owns
    Teardown {
        /// Actually delete objects (default is dry-run)
        #[arg(long)]
        execute: bool,
    },

    /// List every tagged backend object
    List {
        /// Output format (table, json)
        #[arg(long, default_value = "table")]
        format: String,
    },

    /// Delete one entity (vpc-, subnet-, nat-, eni-, i-, sg-) or tagged object
    Delete {
        /// Entity name or backend object id
        id: String,

        /// Actually delete (default is dry-run)
        #[arg(long)]
        execute: bool,
    },

    /// Remove duplicate and orphaned objects
    Cleanup {
        /// Desired-state network model (JSON)
        #[arg(short, long)]
        model: PathBuf,

        /// Actually delete objects (default is dry-run)
        #[arg(long)]
        execute: bool,
    },
}

#[tokio::main]
async fn main() {
    match run().await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            print_error(&e);
            std::process::exit(1);
        }
    }
}

/// Print error in a user-friendly way
fn print_error(e: &anyhow::Error) {
    use std::io::Write;

    let mut stderr = std::io::stderr();
    let _ = writeln!(stderr, "\n\x1b[1;31mError:\x1b[0m {e}");

    let mut source = e.source();
    while let Some(cause) = source {
        let _ = writeln!(stderr, "  \x1b[33mCaused by:\x1b[0m {cause}");
        source = cause.source();
    }
}

fn load_model(path: &Path) -> Result<GlobalNetworkInfo> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read model file: {}", path.display()))?;
    GlobalNetworkInfo::from_json(&content)
        .with_context(|| format!("Failed to parse model file: {}", path.display()))
}

/// Cancel the token on the first Ctrl-C; the run stops at the next pass
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after the current pass");
            child.cancel();
        }
    });
    token
}

async fn run() -> Result<i32> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let mut config = MidoConfig::load(&args.config)?;
    if let Some(url) = args.api_url {
        config.api_url = Some(url);
    }
    let api_url = config
        .api_url
        .clone()
        .context("No API endpoint: set api_url in the config or MIDO_SYNC_API_URL")?;
    info!(api_url = %api_url, controller = %config.controller_host, "Using backend");

    let api = HttpApi::new(&api_url)?;

    match args.command {
        Command::Run { model } => {
            let gni = load_model(&model)?;
            let mut reconciler = Reconciler::new(api, config);
            let report = reconciler.run(&gni, &cancel_on_ctrl_c()).await?;
            println!("{}", report.render_table());
            println!(
                "Created {} and deleted {} backend objects",
                report.created, report.deleted
            );
            return Ok(report.exit_code());
        }

        Command::Plan { model, format } => {
            let gni = load_model(&model)?;
            let live = MidoClient::new(api, config.retry.clone());
            let plan = admin::plan(&live, &config, &gni).await?;
            if format == "json" {
                println!("{}", serde_json::to_string_pretty(&plan)?);
            } else if plan.is_empty() {
                println!("No changes. Backend matches the model.");
            } else {
                println!("To create:\n{}", render_inventory_table(&plan.to_create));
                println!("To delete:\n{}", render_inventory_table(&plan.to_delete));
            }
        }

        Command::Teardown { execute } => {
            let mut reconciler = Reconciler::new(api, config);
            let report = reconciler.teardown(!execute).await?;
            if let Some(cleanup) = &report.cleanup {
                println!(
                    "Found {} objects: {} deleted, {} skipped, {} failed",
                    cleanup.total_found, report.deleted, cleanup.skipped, cleanup.failed
                );
            }
            if !execute {
                println!("Dry run. Pass --execute to delete.");
            }
            return Ok(report.exit_code());
        }

        Command::List { format } => {
            let reconciler = Reconciler::new(api, config);
            let entries = reconciler.list_inventory().await?;
            if format == "json" {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else if entries.is_empty() {
                println!("No mido-sync objects found.");
            } else {
                println!("{}", render_inventory_table(&entries));
            }
        }

        Command::Delete { id, execute } => {
            let mut reconciler = Reconciler::new(api, config);
            let outcome = reconciler.delete_vpc_object(&id, !execute).await?;
            if execute {
                println!("Deleted {} {} ({} objects)", outcome.kind, id, outcome.objects);
            } else {
                println!(
                    "Would delete {} {} ({} objects). Pass --execute to delete.",
                    outcome.kind, id, outcome.objects
                );
            }
        }

        Command::Cleanup { model, execute } => {
            let gni = load_model(&model)?;
            let mut reconciler = Reconciler::new(api, config);
            let report = reconciler.cleanup(&gni, !execute).await?;
            println!(
                "Found {} stale objects ({} duplicates, {} orphans): {} deleted, {} skipped, {} failed",
                report.total_found,
                report.duplicates,
                report.orphans,
                report.deleted,
                report.skipped,
                report.failed
            );
            if !report.is_success() {
                return Ok(1);
            }
        }
    }

    Ok(0)
}

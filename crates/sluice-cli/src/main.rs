//! `sluice` binary: event admission, batching, and cost throttling in front
//! of an external execution engine, in single-shot or long-running mode.

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sluice_admission::AdmissionController;
use sluice_core::current_unix_timestamp_ms;
use sluice_dispatch::Dispatcher;
use sluice_runtime::{
    build_status_snapshot, load_config, run_action, BotRuntime, BotRuntimeConfig, SluiceConfig,
};
use sluice_store::StateStore;
use tokio::sync::{mpsc, watch};
use tracing::info;

mod bootstrap_helpers;
mod command_engine;
mod spool;

use bootstrap_helpers::init_tracing;
use command_engine::CommandEngine;
use spool::run_spool_feeder;

#[derive(Debug, Parser)]
#[command(name = "sluice", version, about = "Event admission and cost-throttling engine")]
struct Cli {
    /// TOML configuration file; defaults apply when omitted.
    #[arg(long, env = "SLUICE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// SQLite state store path.
    #[arg(
        long,
        env = "SLUICE_STATE_DB",
        global = true,
        default_value = "sluice-state.sqlite"
    )]
    state_db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Process one event payload file and exit (action mode).
    Action {
        /// Delivery payload JSON (raw webhook/action form or normalized).
        #[arg(long, env = "SLUICE_EVENT_FILE")]
        event_file: PathBuf,
    },
    /// Run the long-lived delivery loop fed from a spool directory.
    Bot {
        /// Directory the gateway drops verified delivery files into.
        #[arg(long, env = "SLUICE_SPOOL_DIR", default_value = "sluice-spool")]
        spool_dir: PathBuf,
    },
    /// Print the observability snapshot as JSON.
    Status,
    /// Run one retention sweep and print its report.
    Sweep,
}

fn build_controller(store: &Arc<StateStore>, config: &SluiceConfig) -> Arc<AdmissionController> {
    Arc::new(AdmissionController::new(
        Arc::clone(store),
        config.admission_settings(),
    ))
}

fn build_dispatcher(store: &Arc<StateStore>, config: &SluiceConfig) -> Result<Arc<Dispatcher>> {
    let engine = Arc::new(CommandEngine::from_config(&config.engine)?);
    Ok(Arc::new(Dispatcher::new(
        Arc::clone(store),
        engine,
        config.dispatch.event_timeout_ms,
    )))
}

async fn run_bot(
    store: Arc<StateStore>,
    config: SluiceConfig,
    spool_dir: PathBuf,
) -> Result<()> {
    let controller = build_controller(&store, &config);
    let dispatcher = build_dispatcher(&store, &config)?;
    let runtime = Arc::new(BotRuntime::new(
        Arc::clone(&store),
        controller,
        dispatcher,
        BotRuntimeConfig {
            tick_interval_ms: config.bot.tick_interval_ms,
            retention_sweep_every_ticks: config.bot.retention_sweep_every_ticks,
            retention_horizon_ms: config.retention_horizon_ms(),
            pending_sweep_limit: config.batching.pending_sweep_limit,
            engine_backoff_ms: config.bot.engine_backoff_ms,
            deferred_alert_age_ms: config.batching.deferred_alert_age_ms,
            status_path: config.bot.status_path.clone(),
        },
    ));

    let (sender, receiver) = mpsc::channel(64);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let feeder = tokio::spawn(run_spool_feeder(
        spool_dir,
        sender,
        shutdown_rx.clone(),
        config.bot.tick_interval_ms,
    ));
    let run_handle = {
        let runtime = Arc::clone(&runtime);
        tokio::spawn(async move { runtime.run(receiver, shutdown_rx).await })
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested; draining open windows");
    shutdown_tx.send(true).ok();

    run_handle.await.context("bot runtime task panicked")??;
    feeder.await.context("spool feeder task panicked")??;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let store = Arc::new(StateStore::open(&cli.state_db)?);

    match cli.command {
        Command::Action { event_file } => {
            let controller = build_controller(&store, &config);
            let dispatcher = build_dispatcher(&store, &config)?;
            let report = run_action(
                &store,
                &controller,
                &dispatcher,
                &event_file,
                config.batching.pending_sweep_limit,
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Bot { spool_dir } => {
            run_bot(store, config, spool_dir).await?;
        }
        Command::Status => {
            let snapshot = build_status_snapshot(
                &store,
                None,
                config.retention_horizon_ms(),
                config.batching.deferred_alert_age_ms,
                current_unix_timestamp_ms(),
            )?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        Command::Sweep => {
            let report = store.sweep(current_unix_timestamp_ms(), config.retention_horizon_ms())?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}

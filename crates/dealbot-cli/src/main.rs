use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dealbot_adapters::{Notifier, TelegramNotifier};
use dealbot_storage::RecordStore;
use dealbot_sync::{
    build_pipeline, stop_channel, DealPipeline, StopTrigger, SyncConfig, HISTORY_CLEARED_MESSAGE,
};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "dealbot-cli")]
#[command(about = "Storefront discount notifier")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one fetch, filter and notify cycle.
    Run {
        /// Parse a saved specials page instead of fetching the live one.
        #[arg(long)]
        fixture: Option<PathBuf>,
    },
    /// Empty history and best deals, and set the run counter back to 1.
    Reset {
        /// Also post a "history cleared" message to the chat.
        #[arg(long)]
        notify: bool,
    },
    /// Keep running cycles on the DEALBOT_SYNC_CRON schedule until Ctrl-C.
    Schedule,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn forward_ctrl_c(trigger: StopTrigger) {
    if tokio::signal::ctrl_c().await.is_ok() {
        warn!("interrupt received; stopping at the next suspension point");
        trigger.stop();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Run { fixture: None }) {
        Commands::Run { fixture } => {
            let pipeline = build_pipeline(config, fixture)?;
            let (trigger, stop) = stop_channel();
            tokio::spawn(forward_ctrl_c(trigger));

            let summary = pipeline.run_once(&stop).await.context("deal run failed")?;
            println!(
                "run complete: run_id={} outcome={:?} fetched={} best_deals={} delta={} sent={} failed={}",
                summary.run_id,
                summary.outcome,
                summary.fetched,
                summary.best_deals,
                summary.delta,
                summary.sent,
                summary.failed.len()
            );
        }
        Commands::Reset { notify } => {
            let store = RecordStore::new(config.state_dir.clone());
            store.reset().context("resetting dealbot state")?;
            println!("state reset in {}", store.root().display());

            if notify {
                let notifier = TelegramNotifier::new(config.telegram_config()?)?;
                notifier
                    .send(HISTORY_CLEARED_MESSAGE)
                    .await
                    .context("sending history cleared notice")?;
            }
        }
        Commands::Schedule => {
            let cron = config.sync_cron.clone();
            let pipeline = Arc::new(build_pipeline(config, None)?);
            let (trigger, stop) = stop_channel();
            let mut sched = DealPipeline::build_scheduler(Arc::clone(&pipeline), stop).await?;
            sched.start().await.context("starting scheduler")?;
            println!("scheduler running on `{cron}`; press Ctrl-C to stop");

            tokio::signal::ctrl_c()
                .await
                .context("listening for Ctrl-C")?;
            trigger.stop();
            sched.shutdown().await.context("stopping scheduler")?;
            pipeline.wait_idle().await;
        }
    }

    Ok(())
}

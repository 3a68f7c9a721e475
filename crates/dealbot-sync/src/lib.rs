//! Deal pipeline orchestration: filter, change detection, paced delivery and run coordination.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dealbot_adapters::{
    Delivered, FixtureListingSource, ListingSource, Notifier, NotifyError, SteamSpecialsSource,
    TelegramConfig, TelegramNotifier, DEFAULT_STORE_URL, DEFAULT_TELEGRAM_API_BASE,
};
use dealbot_core::{BestDealsSnapshot, HistorySnapshot, ListingRecord, Snapshot};
use dealbot_storage::{
    HttpClientConfig, HttpFetcher, PersistenceError, RecordStore, RetryDisposition, Table,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "dealbot-sync";

pub const DEFAULT_DISCOUNT_THRESHOLD: u32 = 45;
pub const DEFAULT_SYNC_CRON: &str = "0 0 */12 * * *";

pub const NO_NEW_DEALS_MESSAGE: &str = "ℹ️ No new or changed deals this run.";
pub const HISTORY_CLEARED_MESSAGE: &str =
    "🗑️ Promotion history has been cleared. The bot will start fresh.";

#[derive(Clone)]
pub struct SyncConfig {
    pub state_dir: PathBuf,
    pub store_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub discount_threshold: u32,
    pub message_interval_secs: u64,
    pub max_send_attempts: usize,
    pub rate_limit_fallback_secs: u64,
    pub notify_when_empty: bool,
    pub reset_on_stop: bool,
    pub sync_cron: String,
    pub telegram_api_base: String,
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("."),
            store_url: DEFAULT_STORE_URL.to_string(),
            user_agent: "Mozilla/5.0".to_string(),
            http_timeout_secs: 20,
            discount_threshold: DEFAULT_DISCOUNT_THRESHOLD,
            message_interval_secs: 6,
            max_send_attempts: 3,
            rate_limit_fallback_secs: 30,
            notify_when_empty: false,
            reset_on_stop: false,
            sync_cron: DEFAULT_SYNC_CRON.to_string(),
            telegram_api_base: DEFAULT_TELEGRAM_API_BASE.to_string(),
            telegram_bot_token: None,
            telegram_chat_id: None,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            state_dir: std::env::var("DEALBOT_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.state_dir),
            store_url: std::env::var("DEALBOT_STORE_URL").unwrap_or(defaults.store_url),
            user_agent: std::env::var("DEALBOT_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("DEALBOT_HTTP_TIMEOUT_SECS")
                .unwrap_or(defaults.http_timeout_secs),
            discount_threshold: env_parse("DEALBOT_DISCOUNT_THRESHOLD")
                .unwrap_or(defaults.discount_threshold),
            message_interval_secs: env_parse("DEALBOT_MESSAGE_INTERVAL_SECS")
                .unwrap_or(defaults.message_interval_secs),
            max_send_attempts: env_parse("DEALBOT_MAX_SEND_ATTEMPTS")
                .unwrap_or(defaults.max_send_attempts),
            rate_limit_fallback_secs: env_parse("DEALBOT_RATE_LIMIT_FALLBACK_SECS")
                .unwrap_or(defaults.rate_limit_fallback_secs),
            notify_when_empty: env_flag("DEALBOT_NOTIFY_WHEN_EMPTY")
                .unwrap_or(defaults.notify_when_empty),
            reset_on_stop: env_flag("DEALBOT_RESET_ON_STOP").unwrap_or(defaults.reset_on_stop),
            sync_cron: std::env::var("DEALBOT_SYNC_CRON").unwrap_or(defaults.sync_cron),
            telegram_api_base: std::env::var("TELEGRAM_API_BASE")
                .unwrap_or(defaults.telegram_api_base),
            telegram_bot_token: std::env::var("TELEGRAM_BOT_TOKEN").ok(),
            telegram_chat_id: std::env::var("TELEGRAM_CHAT_ID").ok(),
        }
    }

    pub fn delivery_policy(&self) -> DeliveryPolicy {
        DeliveryPolicy {
            max_attempts: self.max_send_attempts.max(1),
            message_interval: Duration::from_secs(self.message_interval_secs),
            rate_limit_fallback: Duration::from_secs(self.rate_limit_fallback_secs),
        }
    }

    pub fn telegram_config(&self) -> Result<TelegramConfig> {
        let bot_token = self
            .telegram_bot_token
            .clone()
            .filter(|t| !t.trim().is_empty())
            .context("TELEGRAM_BOT_TOKEN is not set")?;
        let chat_id = self
            .telegram_chat_id
            .clone()
            .filter(|c| !c.trim().is_empty())
            .context("TELEGRAM_CHAT_ID is not set")?;
        Ok(TelegramConfig {
            api_base: self.telegram_api_base.clone(),
            bot_token,
            chat_id,
            timeout: Duration::from_secs(self.http_timeout_secs),
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("run cancelled by stop signal")]
pub struct Cancelled;

/// Fires the paired [`StopSignal`]s.
#[derive(Debug)]
pub struct StopTrigger {
    tx: watch::Sender<bool>,
}

impl StopTrigger {
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }
}

/// Cancellation token checked at every suspension point of a run.
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

pub fn stop_channel() -> (StopTrigger, StopSignal) {
    let (tx, rx) = watch::channel(false);
    (StopTrigger { tx }, StopSignal { rx })
}

impl StopSignal {
    /// A signal that can never fire.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    pub async fn stopped(&self) {
        let mut rx = self.rx.clone();
        let closed = rx.wait_for(|stopped| *stopped).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }

    /// Run `fut` unless the signal fires first.
    pub async fn guard<F: Future>(&self, fut: F) -> Result<F::Output, Cancelled> {
        if self.is_stopped() {
            return Err(Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.stopped() => Err(Cancelled),
            out = fut => Ok(out),
        }
    }

    pub async fn sleep(&self, duration: Duration) -> Result<(), Cancelled> {
        self.guard(tokio::time::sleep(duration)).await
    }
}

/// Listings worth announcing: known original price and a discount of at least `threshold`.
pub fn select_best_deals(history: &HistorySnapshot, threshold: u32) -> Snapshot {
    history
        .iter()
        .filter(|(_, r)| r.original_price.is_known() && r.discount_percent >= threshold)
        .map(|(name, r)| (name.clone(), r.clone()))
        .collect()
}

/// Deals that were never announced, or whose discount moved since the last announcement.
///
/// Price drift at an unchanged discount is not a change.
pub fn compute_delta(current_best: &Snapshot, previous_best: &BestDealsSnapshot) -> Snapshot {
    current_best
        .iter()
        .filter(|(name, r)| {
            previous_best
                .get(*name)
                .map_or(true, |prev| prev.discount_percent != r.discount_percent)
        })
        .map(|(name, r)| (name.clone(), r.clone()))
        .collect()
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&#39;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
    out
}

pub fn format_deal_message(deal: &ListingRecord) -> String {
    format!(
        "🎮 <b>{}</b>\n💰 Original price: <s>{}</s>\n🔥 Current price: {}\n🛍️ Discount: {}%\n🔗 <a href='{}'>View in store</a>\n",
        escape_html(&deal.name),
        escape_html(deal.original_price.as_str()),
        escape_html(deal.current_price.as_str()),
        deal.discount_percent,
        escape_html(&deal.link),
    )
}

pub fn format_stop_notice(run_id: u64, history_reset: bool, at: DateTime<Utc>) -> String {
    let cleanup = if history_reset {
        "🗑️ All Best Deals and Promotion History have been deleted automatically.\n"
    } else {
        ""
    };
    format!(
        "🚨 <b>Bot Execution Stopped!</b>\n📌 Bot Execution ID: {run_id}\n{cleanup}🕒 Stopped at: {}\n",
        at.format("%d/%m/%Y - %H:%M UTC")
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryPolicy {
    pub max_attempts: usize,
    pub message_interval: Duration,
    pub rate_limit_fallback: Duration,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            message_interval: Duration::from_secs(6),
            rate_limit_fallback: Duration::from_secs(30),
        }
    }
}

impl DeliveryPolicy {
    /// Wait before retrying after `err`, or `None` when the error is not worth retrying.
    pub fn backoff_for(&self, err: &NotifyError) -> Option<Duration> {
        if err.disposition() == RetryDisposition::NonRetryable {
            return None;
        }
        match err {
            NotifyError::RateLimited {
                retry_after: Some(wait),
            } => Some(*wait),
            _ => Some(self.rate_limit_fallback),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliveryReport {
    pub updated_best: BestDealsSnapshot,
    pub sent: usize,
    pub failed: Vec<String>,
    pub backoff_waits: Vec<Duration>,
    pub cancelled: bool,
}

/// Sends one message per changed deal, strictly one at a time.
#[derive(Debug, Clone, Default)]
pub struct DeliveryPipeline {
    policy: DeliveryPolicy,
}

impl DeliveryPipeline {
    pub fn new(policy: DeliveryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &DeliveryPolicy {
        &self.policy
    }

    /// Deliver `delta` in name order, starting from `previous_best`.
    ///
    /// Every success is folded into the updated snapshot and handed to
    /// `checkpoint` before the next send. A failing checkpoint aborts delivery.
    pub async fn deliver<F>(
        &self,
        delta: &Snapshot,
        notifier: &dyn Notifier,
        previous_best: BestDealsSnapshot,
        stop: &StopSignal,
        mut checkpoint: F,
    ) -> Result<DeliveryReport, PersistenceError>
    where
        F: FnMut(&BestDealsSnapshot) -> Result<(), PersistenceError>,
    {
        let mut report = DeliveryReport {
            updated_best: previous_best,
            ..DeliveryReport::default()
        };

        for (index, (name, deal)) in delta.iter().enumerate() {
            if index > 0 && stop.sleep(self.policy.message_interval).await.is_err() {
                report.cancelled = true;
                break;
            }

            let message = format_deal_message(deal);
            let outcome = self
                .send_with_retry(notifier, &message, stop, &mut report.backoff_waits)
                .instrument(info_span!("deliver", name = %name))
                .await;

            match outcome {
                Ok(Some(delivered)) => {
                    report.updated_best.insert(name.clone(), deal.clone());
                    report.sent += 1;
                    checkpoint(&report.updated_best)?;
                    info!(name = %name, message_id = ?delivered.message_id, "deal delivered");
                }
                Ok(None) => {
                    error!(name = %name, "deal not delivered; it stays pending for the next run");
                    report.failed.push(name.clone());
                }
                Err(Cancelled) => {
                    report.cancelled = true;
                    break;
                }
            }
        }

        Ok(report)
    }

    /// Send `text` with the bounded retry policy.
    ///
    /// `Ok(None)` means the message was given up on. Each backoff taken is
    /// appended to `waits`; no backoff follows the final attempt.
    pub async fn send_with_retry(
        &self,
        notifier: &dyn Notifier,
        text: &str,
        stop: &StopSignal,
        waits: &mut Vec<Duration>,
    ) -> Result<Option<Delivered>, Cancelled> {
        let max_attempts = self.policy.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            let err = match stop.guard(notifier.send(text)).await? {
                Ok(delivered) => {
                    debug!(attempt, "message accepted");
                    return Ok(Some(delivered));
                }
                Err(err) => err,
            };

            warn!(attempt, error = %err, "message send failed");
            let Some(wait) = self.policy.backoff_for(&err) else {
                error!(attempt, error = %err, "non-transient send failure; not retrying");
                return Ok(None);
            };
            if attempt == max_attempts {
                break;
            }

            warn!(attempt, wait_secs = wait.as_secs(), "backing off before retrying");
            waits.push(wait);
            stop.sleep(wait).await?;
        }

        error!(attempts = max_attempts, "message failed on every attempt");
        Ok(None)
    }
}

/// What a [`ShutdownHook`] may touch when a run is stopped.
pub struct StopContext<'a> {
    pub run_id: u64,
    pub store: &'a RecordStore,
    pub notifier: &'a dyn Notifier,
}

/// Host policy invoked once when a run ends because its stop signal fired.
#[async_trait]
pub trait ShutdownHook: Send + Sync {
    async fn on_stop(&self, ctx: StopContext<'_>);
}

#[derive(Default)]
pub struct NoopShutdownHook;

#[async_trait]
impl ShutdownHook for NoopShutdownHook {
    async fn on_stop(&self, _ctx: StopContext<'_>) {}
}

/// Announces the stop in the chat and optionally wipes all state.
#[derive(Debug, Clone, Copy, Default)]
pub struct StopNoticeHook {
    pub reset: bool,
}

#[async_trait]
impl ShutdownHook for StopNoticeHook {
    async fn on_stop(&self, ctx: StopContext<'_>) {
        let notice = format_stop_notice(ctx.run_id, self.reset, Utc::now());
        if let Err(err) = ctx.notifier.send(&notice).await {
            warn!(error = %err, "stop notice not delivered");
        }
        if self.reset {
            match ctx.store.reset() {
                Ok(()) => info!("state reset after stop"),
                Err(err) => error!(error = %err, "resetting state after stop failed"),
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    NoChanges,
    FetchFailed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    pub fetched: usize,
    pub history_size: usize,
    pub best_deals: usize,
    pub delta: usize,
    pub sent: usize,
    pub failed: Vec<String>,
}

impl RunSummary {
    fn started(run_id: u64, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: started_at,
            outcome: RunOutcome::Completed,
            fetched: 0,
            history_size: 0,
            best_deals: 0,
            delta: 0,
            sent: 0,
            failed: Vec::new(),
        }
    }

    fn finish(mut self, outcome: RunOutcome) -> Self {
        self.outcome = outcome;
        self.finished_at = Utc::now();
        self
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("persisting state during {step}: {source}")]
    Persistence {
        step: &'static str,
        #[source]
        source: PersistenceError,
    },
    #[error("another run is still in progress")]
    AlreadyRunning,
}

fn persistence_failure(step: &'static str) -> impl FnOnce(PersistenceError) -> RunError {
    move |source| {
        error!(step, error = %source, "state could not be persisted; ending run");
        RunError::Persistence { step, source }
    }
}

/// One fetch → merge → filter → diff → notify → persist cycle, plus the handles it needs.
pub struct DealPipeline {
    config: SyncConfig,
    store: RecordStore,
    source: Box<dyn ListingSource>,
    notifier: Box<dyn Notifier>,
    delivery: DeliveryPipeline,
    shutdown: Box<dyn ShutdownHook>,
    running: Mutex<()>,
}

impl DealPipeline {
    pub fn new(
        config: SyncConfig,
        source: Box<dyn ListingSource>,
        notifier: Box<dyn Notifier>,
    ) -> Self {
        let store = RecordStore::new(config.state_dir.clone());
        let delivery = DeliveryPipeline::new(config.delivery_policy());
        Self {
            config,
            store,
            source,
            notifier,
            delivery,
            shutdown: Box::<NoopShutdownHook>::default(),
            running: Mutex::new(()),
        }
    }

    pub fn with_shutdown_hook(mut self, shutdown: Box<dyn ShutdownHook>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    /// Resolves once no run is in progress.
    pub async fn wait_idle(&self) {
        let _idle = self.running.lock().await;
    }

    pub async fn run_once(&self, stop: &StopSignal) -> Result<RunSummary, RunError> {
        let Ok(_running) = self.running.try_lock() else {
            warn!("previous run still in progress; skipping");
            return Err(RunError::AlreadyRunning);
        };

        let started_at = Utc::now();
        let run_id = self
            .store
            .advance_run_id()
            .map_err(persistence_failure("start"))?;
        let span = info_span!("deal_run", run_id, source = self.source.source_id());
        self.run_stages(RunSummary::started(run_id, started_at), stop)
            .instrument(span)
            .await
    }

    async fn run_stages(
        &self,
        mut summary: RunSummary,
        stop: &StopSignal,
    ) -> Result<RunSummary, RunError> {
        info!("run started");

        let fresh = match stop.guard(self.source.fetch_listings()).await {
            Ok(Ok(listings)) => listings,
            Ok(Err(err)) => {
                error!(step = "fetch", error = %err, "fetching listings failed; no deliveries this run");
                return Ok(summary.finish(RunOutcome::FetchFailed));
            }
            Err(Cancelled) => return Ok(self.stopped(summary).await),
        };
        summary.fetched = fresh.len();

        let history = self
            .store
            .merge_history(&fresh)
            .map_err(persistence_failure("merge"))?;
        summary.history_size = history.len();

        let best = select_best_deals(&history, self.config.discount_threshold);
        summary.best_deals = best.len();

        let previous = self.store.load(Table::BestDeals);
        let delta = compute_delta(&best, &previous);
        summary.delta = delta.len();
        info!(
            fetched = summary.fetched,
            history = summary.history_size,
            best = summary.best_deals,
            delta = summary.delta,
            "deals computed"
        );

        if delta.is_empty() {
            info!("no new or changed deals");
            if self.config.notify_when_empty {
                let mut waits = Vec::new();
                match self
                    .delivery
                    .send_with_retry(self.notifier.as_ref(), NO_NEW_DEALS_MESSAGE, stop, &mut waits)
                    .await
                {
                    Ok(Some(_)) => {}
                    Ok(None) => warn!("no-changes notice not delivered"),
                    Err(Cancelled) => return Ok(self.stopped(summary).await),
                }
            }
            return Ok(summary.finish(RunOutcome::NoChanges));
        }

        let store = &self.store;
        let report = self
            .delivery
            .deliver(&delta, self.notifier.as_ref(), previous, stop, |best| {
                store.save(Table::BestDeals, best)
            })
            .await
            .map_err(persistence_failure("notify"))?;
        summary.sent = report.sent;
        summary.failed = report.failed.clone();

        if report.cancelled {
            return Ok(self.stopped(summary).await);
        }

        self.store
            .save(Table::BestDeals, &report.updated_best)
            .map_err(persistence_failure("persist"))?;

        info!(sent = summary.sent, failed = summary.failed.len(), "run completed");
        Ok(summary.finish(RunOutcome::Completed))
    }

    async fn stopped(&self, summary: RunSummary) -> RunSummary {
        warn!(sent = summary.sent, "stop requested; ending run");
        self.shutdown
            .on_stop(StopContext {
                run_id: summary.run_id,
                store: &self.store,
                notifier: self.notifier.as_ref(),
            })
            .await;
        summary.finish(RunOutcome::Cancelled)
    }

    /// Scheduler that triggers [`DealPipeline::run_once`] on every tick of `sync_cron`.
    ///
    /// A tick arriving while a run is still going is skipped.
    pub async fn build_scheduler(pipeline: Arc<Self>, stop: StopSignal) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = pipeline.config.sync_cron.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            let stop = stop.clone();
            Box::pin(async move {
                match pipeline.run_once(&stop).await {
                    Ok(summary) => info!(
                        run_id = summary.run_id,
                        outcome = ?summary.outcome,
                        sent = summary.sent,
                        "scheduled run finished"
                    ),
                    Err(err) => error!(error = %err, "scheduled run failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(sched)
    }
}

/// Wire the storefront scraper (or a saved page) and the Telegram notifier into a pipeline.
pub fn build_pipeline(config: SyncConfig, fixture: Option<PathBuf>) -> Result<DealPipeline> {
    let source: Box<dyn ListingSource> = match fixture {
        Some(path) => Box::new(FixtureListingSource::new(path)),
        None => {
            let http = HttpFetcher::new(HttpClientConfig {
                timeout: Duration::from_secs(config.http_timeout_secs),
                user_agent: Some(config.user_agent.clone()),
                ..Default::default()
            })?;
            Box::new(SteamSpecialsSource::new(http, config.store_url.clone()))
        }
    };
    let notifier = TelegramNotifier::new(config.telegram_config()?)?;
    let hook = StopNoticeHook {
        reset: config.reset_on_stop,
    };
    Ok(DealPipeline::new(config, source, Box::new(notifier)).with_shutdown_hook(Box::new(hook)))
}

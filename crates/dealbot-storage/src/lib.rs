//! Durable state tables + HTTP fetch utilities for dealbot.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use dealbot_core::{merge_into, HistorySnapshot, Snapshot};
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dealbot-storage";

pub const HISTORY_FILE: &str = "historical_promotions.json";
pub const BEST_DEALS_FILE: &str = "best_deals.json";
pub const RUN_COUNTER_FILE: &str = "execution_id.txt";

/// Logical tables owned by [`RecordStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    History,
    BestDeals,
}

impl Table {
    pub fn file_name(self) -> &'static str {
        match self {
            Self::History => HISTORY_FILE,
            Self::BestDeals => BEST_DEALS_FILE,
        }
    }
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("creating state directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("writing {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serializing {table:?}: {source}")]
    Serialize {
        table: Table,
        #[source]
        source: serde_json::Error,
    },
}

/// File-backed store for the history table, the best-deals table and the run counter.
///
/// Reads are forgiving: a missing or malformed file is an empty table. Writes go to
/// a temp file in the same directory which is then renamed over the target.
#[derive(Debug, Clone)]
pub struct RecordStore {
    root: PathBuf,
}

impl RecordStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, table: Table) -> PathBuf {
        self.root.join(table.file_name())
    }

    pub fn run_counter_path(&self) -> PathBuf {
        self.root.join(RUN_COUNTER_FILE)
    }

    pub fn load(&self, table: Table) -> Snapshot {
        let path = self.path_for(table);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "table file absent; starting empty");
                return Snapshot::new();
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "unreadable table file; treating as empty");
                return Snapshot::new();
            }
        };

        if text.trim().is_empty() {
            return Snapshot::new();
        }

        match serde_json::from_str(&text) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "corrupt table file; treating as empty");
                Snapshot::new()
            }
        }
    }

    pub fn save(&self, table: Table, snapshot: &Snapshot) -> Result<(), PersistenceError> {
        let bytes = serde_json::to_vec_pretty(snapshot)
            .map_err(|source| PersistenceError::Serialize { table, source })?;
        let path = self.path_for(table);
        self.write_atomic(&path, &bytes)?;
        debug!(path = %path.display(), entries = snapshot.len(), "table saved");
        Ok(())
    }

    /// Load history, overlay `fresh` on top of it, persist and return the merged table.
    pub fn merge_history(&self, fresh: &Snapshot) -> Result<HistorySnapshot, PersistenceError> {
        let mut history = self.load(Table::History);
        merge_into(&mut history, fresh);
        self.save(Table::History, &history)?;
        Ok(history)
    }

    /// Counter of the last started run. Missing or garbled counter reads as 0.
    pub fn run_id(&self) -> u64 {
        let path = self.run_counter_path();
        match fs::read_to_string(&path) {
            Ok(text) => text.trim().parse().unwrap_or_else(|err| {
                warn!(path = %path.display(), error = %err, "corrupt run counter; treating as 0");
                0
            }),
            Err(_) => 0,
        }
    }

    pub fn advance_run_id(&self) -> Result<u64, PersistenceError> {
        let next = self.run_id().saturating_add(1);
        self.write_atomic(&self.run_counter_path(), next.to_string().as_bytes())?;
        Ok(next)
    }

    /// Empty both tables and set the run counter back to 1.
    ///
    /// All three replacements are staged before any is renamed into place, so a
    /// failure while staging leaves the previous state untouched.
    pub fn reset(&self) -> Result<(), PersistenceError> {
        let empty = serde_json::to_vec_pretty(&Snapshot::new()).map_err(|source| {
            PersistenceError::Serialize {
                table: Table::History,
                source,
            }
        })?;

        let targets = [
            (self.path_for(Table::History), empty.clone()),
            (self.path_for(Table::BestDeals), empty),
            (self.run_counter_path(), b"1".to_vec()),
        ];

        let mut staged = Vec::with_capacity(targets.len());
        for (path, bytes) in &targets {
            match self.stage(path, bytes) {
                Ok(temp) => staged.push((temp, path.clone())),
                Err(err) => {
                    for (temp, _) in &staged {
                        let _ = fs::remove_file(temp);
                    }
                    return Err(err);
                }
            }
        }

        for (temp, path) in staged {
            commit(&temp, &path)?;
        }
        info!(root = %self.root.display(), "history, best deals and run counter reset");
        Ok(())
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), PersistenceError> {
        let temp = self.stage(path, bytes)?;
        commit(&temp, path)
    }

    fn stage(&self, path: &Path, bytes: &[u8]) -> Result<PathBuf, PersistenceError> {
        fs::create_dir_all(&self.root).map_err(|source| PersistenceError::CreateDir {
            path: self.root.clone(),
            source,
        })?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp = self
            .root
            .join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

        let written = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp)
            .and_then(|mut file| {
                file.write_all(bytes)?;
                file.flush()?;
                file.sync_all()
            });

        match written {
            Ok(()) => Ok(temp),
            Err(source) => {
                let _ = fs::remove_file(&temp);
                Err(PersistenceError::Write {
                    path: temp,
                    source,
                })
            }
        }
    }
}

fn commit(temp: &Path, path: &Path) -> Result<(), PersistenceError> {
    fs::rename(temp, path).map_err(|source| {
        let _ = fs::remove_file(temp);
        PersistenceError::Write {
            path: path.to_path_buf(),
            source,
        }
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("reading listing source {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Single-page GET client with a short bounded retry on transient failures.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0;
        loop {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(url, status = status.as_u16(), attempt, "transient http status; retrying");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(url, error = %err, attempt, "transient request error; retrying");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use dealbot_core::{ListingRecord, Price};
    use tempfile::tempdir;

    fn record(name: &str, discount: u32) -> ListingRecord {
        ListingRecord {
            name: name.to_string(),
            discount_percent: discount,
            original_price: Price::known("20.00€"),
            current_price: Price::known("10.00€"),
            link: format!("https://store.example/app/{name}"),
            observed_at: Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap(),
        }
    }

    fn snapshot(records: &[ListingRecord]) -> Snapshot {
        records
            .iter()
            .map(|r| (r.name.clone(), r.clone()))
            .collect()
    }

    #[test]
    fn missing_tables_load_empty() {
        let dir = tempdir().expect("tempdir");
        let store = RecordStore::new(dir.path());
        assert!(store.load(Table::History).is_empty());
        assert!(store.load(Table::BestDeals).is_empty());
        assert_eq!(store.run_id(), 0);
    }

    #[test]
    fn corrupt_table_loads_empty_instead_of_failing() {
        let dir = tempdir().expect("tempdir");
        let store = RecordStore::new(dir.path());
        fs::write(store.path_for(Table::History), "{ not json").expect("write");
        fs::write(store.run_counter_path(), "seven").expect("write");

        assert!(store.load(Table::History).is_empty());
        assert_eq!(store.run_id(), 0);
        assert_eq!(store.advance_run_id().expect("advance"), 1);
    }

    #[test]
    fn save_then_load_preserves_records_and_leaves_no_temp_files() {
        let dir = tempdir().expect("tempdir");
        let store = RecordStore::new(dir.path().join("state"));
        let table = snapshot(&[record("Celeste", 75), record("Hades", 50)]);

        store.save(Table::BestDeals, &table).expect("save");
        assert_eq!(store.load(Table::BestDeals), table);

        let leftovers: Vec<_> = fs::read_dir(store.root())
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn merging_the_same_batch_twice_is_idempotent() {
        let dir = tempdir().expect("tempdir");
        let store = RecordStore::new(dir.path());
        store
            .save(Table::History, &snapshot(&[record("Old Game", 10)]))
            .expect("seed");

        let batch = snapshot(&[record("Celeste", 75), record("Old Game", 55)]);
        let once = store.merge_history(&batch).expect("merge once");
        let twice = store.merge_history(&batch).expect("merge twice");

        assert_eq!(once, twice);
        assert_eq!(twice.len(), 2);
        assert_eq!(twice["Old Game"].discount_percent, 55);
        assert_eq!(store.load(Table::History), twice);
    }

    #[test]
    fn reset_empties_tables_and_sets_counter_to_one() {
        let dir = tempdir().expect("tempdir");
        let store = RecordStore::new(dir.path());
        store
            .save(Table::History, &snapshot(&[record("Celeste", 75)]))
            .expect("history");
        store
            .save(Table::BestDeals, &snapshot(&[record("Celeste", 75)]))
            .expect("best");
        for _ in 0..4 {
            store.advance_run_id().expect("advance");
        }

        store.reset().expect("reset");

        assert!(store.load(Table::History).is_empty());
        assert!(store.load(Table::BestDeals).is_empty());
        assert_eq!(store.run_id(), 1);
        assert_eq!(store.advance_run_id().expect("advance"), 2);
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn rate_limits_and_server_errors_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }
}

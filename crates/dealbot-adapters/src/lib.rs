//! Listing source + notifier contracts and their storefront/Telegram implementations.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dealbot_core::{parse_discount_percent, ListingRecord, Price, Snapshot};
use dealbot_storage::{FetchError, HttpFetcher, RetryDisposition};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "dealbot-adapters";

pub const DEFAULT_STORE_URL: &str = "https://store.steampowered.com/search/results/?query&specials=1";
pub const DEFAULT_TELEGRAM_API_BASE: &str = "https://api.telegram.org";

const ROW_SELECTOR: &str = ".search_result_row";
const TITLE_SELECTOR: &str = ".title";
const DISCOUNT_SELECTOR: &str = ".discount_pct";
const ORIGINAL_PRICE_SELECTOR: &str = ".discount_original_price";
const FINAL_PRICE_SELECTOR: &str = ".discount_final_price";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{0}")]
    Message(String),
}

/// Produces the current set of discounted listings, keyed by name.
#[async_trait]
pub trait ListingSource: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch_listings(&self) -> Result<Snapshot, AdapterError>;
}

/// Scrapes the storefront's specials search page over HTTP.
#[derive(Debug, Clone)]
pub struct SteamSpecialsSource {
    http: HttpFetcher,
    url: String,
}

impl SteamSpecialsSource {
    pub fn new(http: HttpFetcher, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

#[async_trait]
impl ListingSource for SteamSpecialsSource {
    fn source_id(&self) -> &str {
        "steam-specials"
    }

    async fn fetch_listings(&self) -> Result<Snapshot, AdapterError> {
        let response = self.http.fetch_bytes(&self.url).await?;
        debug!(url = %response.final_url, bytes = response.body.len(), "fetched specials page");
        let html = String::from_utf8_lossy(&response.body);
        parse_listing_page(&html, Utc::now())
    }
}

/// Reads a previously saved specials page from disk.
#[derive(Debug, Clone)]
pub struct FixtureListingSource {
    path: PathBuf,
    observed_at: Option<DateTime<Utc>>,
}

impl FixtureListingSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            observed_at: None,
        }
    }

    /// Pin the capture timestamp instead of using the wall clock.
    pub fn observed_at(mut self, at: DateTime<Utc>) -> Self {
        self.observed_at = Some(at);
        self
    }
}

#[async_trait]
impl ListingSource for FixtureListingSource {
    fn source_id(&self) -> &str {
        "fixture"
    }

    async fn fetch_listings(&self) -> Result<Snapshot, AdapterError> {
        let html = std::fs::read_to_string(&self.path).map_err(|source| FetchError::Io {
            path: self.path.clone(),
            source,
        })?;
        parse_listing_page(&html, self.observed_at.unwrap_or_else(Utc::now))
    }
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(format!("selector {css}: {e}")))
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn select_first_text(row: &ElementRef<'_>, sel: &Selector) -> Option<String> {
    row.select(sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

/// `"19,99 €"` becomes `"19.99€"`; nothing left after cleanup means unknown.
pub fn normalize_price(text: Option<&str>) -> Price {
    let Some(text) = text else {
        return Price::Unknown;
    };
    let cleaned: String = text
        .chars()
        .filter(|c| *c != '€' && !c.is_whitespace())
        .map(|c| if c == ',' { '.' } else { c })
        .collect();
    if cleaned.is_empty() {
        Price::Unknown
    } else {
        Price::known(format!("{cleaned}€"))
    }
}

/// Parse a specials search page into listing records.
///
/// Rows without a title or link are skipped with a warning; a missing discount
/// badge means 0% and a missing price element means an unknown price.
pub fn parse_listing_page(html: &str, observed_at: DateTime<Utc>) -> Result<Snapshot, AdapterError> {
    let document = Html::parse_document(html);
    let rows = selector(ROW_SELECTOR)?;
    let title = selector(TITLE_SELECTOR)?;
    let discount = selector(DISCOUNT_SELECTOR)?;
    let original = selector(ORIGINAL_PRICE_SELECTOR)?;
    let current = selector(FINAL_PRICE_SELECTOR)?;

    let mut listings = Snapshot::new();
    for (index, row) in document.select(&rows).enumerate() {
        let Some(name) = select_first_text(&row, &title) else {
            warn!(row = index, "listing row without a title; skipping");
            continue;
        };
        let Some(link) = row.value().attr("href").and_then(|h| text_or_none(h.to_string())) else {
            warn!(row = index, name = %name, "listing row without a link; skipping");
            continue;
        };

        let discount_text = select_first_text(&row, &discount).unwrap_or_else(|| "0%".to_string());
        let record = ListingRecord {
            name: name.clone(),
            discount_percent: parse_discount_percent(&discount_text),
            original_price: normalize_price(select_first_text(&row, &original).as_deref()),
            current_price: normalize_price(select_first_text(&row, &current).as_deref()),
            link,
            observed_at,
        };
        listings.insert(name, record);
    }

    debug!(listings = listings.len(), "parsed specials page");
    Ok(listings)
}

/// Acknowledgement of an accepted message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Delivered {
    pub message_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotifyError {
    #[error("rate limited by chat provider (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    #[error("timed out talking to chat provider")]
    Timeout,
    #[error("{0}")]
    Other(String),
}

impl NotifyError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::RateLimited { .. } | Self::Timeout => RetryDisposition::Retryable,
            Self::Other(_) => RetryDisposition::NonRetryable,
        }
    }
}

/// Delivers a single text message to the chat endpoint.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, text: &str) -> Result<Delivered, NotifyError>;
}

#[async_trait]
impl<T: Notifier + ?Sized> Notifier for Arc<T> {
    async fn send(&self, text: &str) -> Result<Delivered, NotifyError> {
        (**self).send(text).await
    }
}

#[derive(Clone)]
pub struct TelegramConfig {
    pub api_base: String,
    pub bot_token: String,
    pub chat_id: String,
    pub timeout: Duration,
}

impl fmt::Debug for TelegramConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelegramConfig")
            .field("api_base", &self.api_base)
            .field("bot_token", &"<redacted>")
            .field("chat_id", &self.chat_id)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Bot API `sendMessage` client posting HTML-formatted text.
pub struct TelegramNotifier {
    client: reqwest::Client,
    endpoint: String,
    chat_id: String,
}

impl fmt::Debug for TelegramNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelegramNotifier")
            .field("chat_id", &self.chat_id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'static str,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelegramReply {
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub error_code: Option<u16>,
    #[serde(default)]
    pub result: Option<TelegramMessage>,
    #[serde(default)]
    pub parameters: Option<TelegramParameters>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramMessage {
    pub message_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramParameters {
    #[serde(default)]
    pub retry_after: Option<u64>,
}

impl TelegramNotifier {
    pub fn new(config: TelegramConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("building telegram client")?;
        let endpoint = format!(
            "{}/bot{}/sendMessage",
            config.api_base.trim_end_matches('/'),
            config.bot_token
        );
        Ok(Self {
            client,
            endpoint,
            chat_id: config.chat_id,
        })
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, text: &str) -> Result<Delivered, NotifyError> {
        let request = SendMessageRequest {
            chat_id: &self.chat_id,
            text,
            parse_mode: "HTML",
        };

        let response = match self.client.post(&self.endpoint).json(&request).send().await {
            Ok(response) => response,
            Err(err) if err.is_timeout() => return Err(NotifyError::Timeout),
            Err(err) => return Err(NotifyError::Other(err.without_url().to_string())),
        };

        let status = response.status().as_u16();
        let body = match response.text().await {
            Ok(body) => body,
            Err(err) if err.is_timeout() => return Err(NotifyError::Timeout),
            Err(err) => return Err(NotifyError::Other(err.without_url().to_string())),
        };
        let reply = serde_json::from_str::<TelegramReply>(&body).ok();
        interpret_telegram_reply(status, reply)
    }
}

/// Map a Bot API HTTP status and (possibly unparseable) body to a send outcome.
pub fn interpret_telegram_reply(
    status: u16,
    reply: Option<TelegramReply>,
) -> Result<Delivered, NotifyError> {
    let reply = reply.unwrap_or_default();
    let description = reply.description.clone().unwrap_or_default();

    let rate_limited = status == 429
        || reply.error_code == Some(429)
        || description.contains("Too Many Requests");
    if rate_limited {
        let retry_after = reply
            .parameters
            .as_ref()
            .and_then(|p| p.retry_after)
            .map(Duration::from_secs)
            .or_else(|| retry_after_from_description(&description));
        return Err(NotifyError::RateLimited { retry_after });
    }

    if description.contains("Timed out") {
        return Err(NotifyError::Timeout);
    }

    if (200..300).contains(&status) && reply.ok {
        return Ok(Delivered {
            message_id: reply.result.map(|m| m.message_id),
        });
    }

    Err(NotifyError::Other(format!(
        "telegram responded {status}: {}",
        if description.is_empty() { "no description" } else { &description }
    )))
}

/// Pull the wait out of texts like "Too Many Requests: retry after 17" or "Retry in 5 seconds".
pub fn retry_after_from_description(description: &str) -> Option<Duration> {
    let lower = description.to_ascii_lowercase();
    let start = ["retry after", "retry in"]
        .iter()
        .find_map(|marker| lower.find(marker).map(|at| at + marker.len()))?;
    let digits: String = lower[start..]
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok().map(Duration::from_secs)
}

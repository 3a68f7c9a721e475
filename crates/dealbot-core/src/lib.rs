//! Core domain model for dealbot: listing records, prices and snapshots.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "dealbot-core";

/// On-disk marker for a price the storefront did not show.
pub const UNKNOWN_PRICE: &str = "N/A";

/// A formatted storefront price, or the absence of one.
///
/// Stored as a plain string so that tables stay hand-editable. Anything
/// containing [`UNKNOWN_PRICE`] (or blank) reads back as [`Price::Unknown`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Price {
    Known(String),
    #[default]
    Unknown,
}

impl Price {
    pub fn known(value: impl Into<String>) -> Self {
        let value = value.into();
        if value.trim().is_empty() || value.contains(UNKNOWN_PRICE) {
            Self::Unknown
        } else {
            Self::Known(value)
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Self::Known(_))
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Known(value) => value,
            Self::Unknown => UNKNOWN_PRICE,
        }
    }
}

impl From<String> for Price {
    fn from(value: String) -> Self {
        Self::known(value)
    }
}

impl From<Price> for String {
    fn from(value: Price) -> Self {
        match value {
            Price::Known(value) => value,
            Price::Unknown => UNKNOWN_PRICE.to_string(),
        }
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One promoted item as observed on the storefront at `observed_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingRecord {
    pub name: String,
    #[serde(default)]
    pub discount_percent: u32,
    #[serde(default)]
    pub original_price: Price,
    #[serde(default)]
    pub current_price: Price,
    pub link: String,
    pub observed_at: DateTime<Utc>,
}

/// Listings keyed by name. Ordered so iteration is ascending by name.
pub type Snapshot = BTreeMap<String, ListingRecord>;

/// Every listing ever observed, latest observation per name.
pub type HistorySnapshot = Snapshot;

/// Listings last delivered successfully; the change-detection baseline.
pub type BestDealsSnapshot = Snapshot;

/// Parse a storefront percentage such as `"-50%"` into `50`.
///
/// Only digits are considered. No digits, or a value that does not fit, gives `0`.
pub fn parse_discount_percent(text: &str) -> u32 {
    let digits: String = text.chars().filter(|c| c.is_ascii_digit()).collect();
    digits.parse().unwrap_or(0)
}

/// Overlay `fresh` onto `history`; fresh records win on name collisions.
pub fn merge_into(history: &mut HistorySnapshot, fresh: &Snapshot) {
    for (name, record) in fresh {
        history.insert(name.clone(), record.clone());
    }
}

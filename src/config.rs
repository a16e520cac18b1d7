//! Configuration loading and validation.
//!
//! The config file is YAML: global settings (`mode`, `notify_failure`,
//! directories) plus a `cards` map of card nickname -> merchant name ->
//! per-merchant settings. Everything is validated up front; a malformed or
//! incomplete file is a startup error, never a runtime one.
//!
//! The parsed [`Config`] is constructed once in `main` and passed by value
//! into each merchant's scheduler. There is no global configuration state.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Default day-of-month purchases may begin. Starting on the 2nd avoids
/// month-boundary off-by-one issues across merchant billing systems.
pub const DEFAULT_MIN_DAY: u32 = 2;

const DEFAULT_BURST_TIME_VARIANCE_SECS: u64 = 14_400; // 4 hours
const DEFAULT_BURST_INTRA_GAP_SECS: u64 = 30;
const DEFAULT_BURST_POLL_GAP_SECS: u64 = 300; // 5 minutes
const DEFAULT_SPREAD_MIN_GAP_SECS: u64 = 14_400; // 4 hours
const DEFAULT_SPREAD_TIME_VARIANCE_SECS: u64 = 14_400;

/// Errors raised while loading or validating the config file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("formatting error in config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("{merchant_id} config is missing \"burst_count\" (required in burst mode)")]
    MissingBurstCount { merchant_id: String },

    #[error("{merchant_id} has an invalid amount range: amount_min={amount_min} amount_max={amount_max}")]
    InvalidAmountRange {
        merchant_id: String,
        amount_min: u32,
        amount_max: u32,
    },

    #[error("{merchant_id} has an invalid day window: min_day={min_day} max_day={max_day:?}")]
    InvalidDayWindow {
        merchant_id: String,
        min_day: u32,
        max_day: Option<u32>,
    },

    #[error("{merchant_id} config field \"{field}\" must not be empty")]
    EmptyField {
        merchant_id: String,
        field: &'static str,
    },

    #[error("{merchant_id} card number must be at least 4 digits")]
    CardTooShort { merchant_id: String },

    #[error("{merchant_id} card number must contain only digits")]
    CardNotNumeric { merchant_id: String },

    #[error("{merchant_id} total_purchases must be at least 1")]
    ZeroPurchases { merchant_id: String },

    #[error("no enabled merchants in config; set \"enabled: true\" on at least one merchant")]
    NoEnabledMerchants,
}

/// Global scheduling mode. Applies to every merchant in the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Burst,
    Spread,
}

/// One merchant, fully validated and immutable for the process lifetime.
///
/// `usr`, `psw`, and `card` are opaque to the core: they are forwarded to
/// the site driver untouched and scrubbed from diagnostic captures.
#[derive(Debug, Clone)]
pub struct Merchant {
    /// Composite identity: `{card nickname}_{merchant name}`. Unique across
    /// the system and used as the ledger key.
    pub id: String,
    /// Merchant name, which is also the driver registry key.
    pub name: String,

    pub total_purchases: u32,
    /// Inclusive purchase amount range, in cents.
    pub amount_min: u32,
    pub amount_max: u32,

    /// Day-of-month window in which purchases are allowed.
    pub min_day: u32,
    pub max_day: Option<u32>,

    /// Number of purchases grouped into one burst (burst mode only).
    pub burst_count: u32,
    /// Fixed inter-burst gap in seconds; derived dynamically when absent.
    pub burst_min_gap: Option<u64>,
    pub burst_time_variance: u64,
    pub burst_intra_gap: u64,
    pub burst_poll_gap: u64,

    pub spread_min_gap: u64,
    pub spread_time_variance: u64,

    pub usr: String,
    pub psw: String,
    pub card: String,
}

impl Merchant {
    /// Last four digits of the card number, for scrubbing.
    pub fn card_last4(&self) -> &str {
        &self.card[self.card.len() - 4..]
    }
}

/// Fully validated application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    /// Webhook URL to POST sanitized terminal-failure summaries to.
    pub notify_failure: Option<String>,
    pub state_dir: PathBuf,
    pub failures_dir: PathBuf,
    /// Enabled merchants only; disabled entries are dropped at load time.
    pub merchants: Vec<Merchant>,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    mode: Mode,
    #[serde(default)]
    notify_failure: Option<String>,
    #[serde(default)]
    state_dir: Option<PathBuf>,
    #[serde(default)]
    failures_dir: Option<PathBuf>,
    #[serde(default)]
    cards: BTreeMap<String, BTreeMap<String, RawMerchant>>,
}

#[derive(Debug, Deserialize)]
struct RawMerchant {
    /// Must be explicitly `true` to schedule this merchant.
    #[serde(default)]
    enabled: bool,
    total_purchases: u32,
    amount_min: u32,
    amount_max: u32,
    usr: String,
    psw: String,
    card: String,
    #[serde(default)]
    burst_count: Option<u32>,
    #[serde(default)]
    advanced: RawAdvanced,
}

#[derive(Debug, Default, Deserialize)]
struct RawAdvanced {
    #[serde(default)]
    min_day: Option<u32>,
    #[serde(default)]
    max_day: Option<u32>,
    #[serde(default)]
    burst: RawBurst,
    #[serde(default)]
    spread: RawSpread,
}

#[derive(Debug, Default, Deserialize)]
struct RawBurst {
    #[serde(default)]
    min_gap: Option<u64>,
    #[serde(default)]
    time_variance: Option<u64>,
    #[serde(default)]
    intra_gap: Option<u64>,
    #[serde(default)]
    poll_gap: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawSpread {
    #[serde(default)]
    min_gap: Option<u64>,
    #[serde(default)]
    time_variance: Option<u64>,
}

impl Config {
    /// Load and validate the config file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate a config document.
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_yaml::from_str(contents)?;

        let mut merchants = Vec::new();
        for (card_key, entries) in raw.cards {
            for (merchant_name, entry) in entries {
                if !entry.enabled {
                    continue;
                }
                merchants.push(validate_merchant(raw.mode, &card_key, &merchant_name, entry)?);
            }
        }

        if merchants.is_empty() {
            return Err(ConfigError::NoEnabledMerchants);
        }

        Ok(Config {
            mode: raw.mode,
            notify_failure: raw.notify_failure,
            state_dir: raw.state_dir.unwrap_or_else(|| PathBuf::from("state")),
            failures_dir: raw
                .failures_dir
                .unwrap_or_else(|| PathBuf::from("failures")),
            merchants,
        })
    }
}

fn validate_merchant(
    mode: Mode,
    card_key: &str,
    merchant_name: &str,
    entry: RawMerchant,
) -> Result<Merchant, ConfigError> {
    let id = format!("{}_{}", card_key, merchant_name);

    let burst_count = match (mode, entry.burst_count) {
        (Mode::Burst, None) => {
            return Err(ConfigError::MissingBurstCount { merchant_id: id });
        }
        (Mode::Burst, Some(0)) => {
            return Err(ConfigError::MissingBurstCount { merchant_id: id });
        }
        (_, count) => count.unwrap_or(1),
    };

    if entry.total_purchases == 0 {
        return Err(ConfigError::ZeroPurchases { merchant_id: id });
    }

    if entry.amount_min == 0 || entry.amount_min > entry.amount_max {
        return Err(ConfigError::InvalidAmountRange {
            merchant_id: id,
            amount_min: entry.amount_min,
            amount_max: entry.amount_max,
        });
    }

    for (field, value) in [
        ("usr", &entry.usr),
        ("psw", &entry.psw),
        ("card", &entry.card),
    ] {
        if value.is_empty() {
            return Err(ConfigError::EmptyField {
                merchant_id: id,
                field,
            });
        }
    }

    // Digits-only also guarantees the last-4 suffix used for scrubbing is a
    // valid char boundary slice.
    if !entry.card.chars().all(|c| c.is_ascii_digit()) {
        return Err(ConfigError::CardNotNumeric { merchant_id: id });
    }

    if entry.card.len() < 4 {
        return Err(ConfigError::CardTooShort { merchant_id: id });
    }

    let min_day = entry.advanced.min_day.unwrap_or(DEFAULT_MIN_DAY);
    let max_day = entry.advanced.max_day;
    let day_window_valid = (1..=28).contains(&min_day)
        && max_day.map_or(true, |max| max >= min_day && max <= 31);
    if !day_window_valid {
        return Err(ConfigError::InvalidDayWindow {
            merchant_id: id,
            min_day,
            max_day,
        });
    }

    Ok(Merchant {
        id,
        name: merchant_name.to_string(),
        total_purchases: entry.total_purchases,
        amount_min: entry.amount_min,
        amount_max: entry.amount_max,
        min_day,
        max_day,
        burst_count,
        burst_min_gap: entry.advanced.burst.min_gap,
        burst_time_variance: entry
            .advanced
            .burst
            .time_variance
            .unwrap_or(DEFAULT_BURST_TIME_VARIANCE_SECS),
        burst_intra_gap: entry
            .advanced
            .burst
            .intra_gap
            .unwrap_or(DEFAULT_BURST_INTRA_GAP_SECS),
        burst_poll_gap: entry
            .advanced
            .burst
            .poll_gap
            .unwrap_or(DEFAULT_BURST_POLL_GAP_SECS),
        spread_min_gap: entry
            .advanced
            .spread
            .min_gap
            .unwrap_or(DEFAULT_SPREAD_MIN_GAP_SECS),
        spread_time_variance: entry
            .advanced
            .spread
            .time_variance
            .unwrap_or(DEFAULT_SPREAD_TIME_VARIANCE_SECS),
        usr: entry.usr,
        psw: entry.psw,
        card: entry.card,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
mode: burst
notify_failure: https://hooks.example.com/pacer
cards:
  mycard:
    example_merchant:
      enabled: true
      total_purchases: 10
      amount_min: 20
      amount_max: 50
      burst_count: 3
      usr: you@example.com
      psw: hunter2
      card: "4111222233334444"
      advanced:
        min_day: 3
        burst:
          time_variance: 7200
"#;

    #[test]
    fn parses_and_validates_sample() {
        let config = Config::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.mode, Mode::Burst);
        assert_eq!(config.merchants.len(), 1);

        let m = &config.merchants[0];
        assert_eq!(m.id, "mycard_example_merchant");
        assert_eq!(m.name, "example_merchant");
        assert_eq!(m.burst_count, 3);
        assert_eq!(m.min_day, 3);
        assert_eq!(m.burst_time_variance, 7200);
        // Untouched knobs fall back to defaults.
        assert_eq!(m.burst_intra_gap, DEFAULT_BURST_INTRA_GAP_SECS);
        assert_eq!(m.burst_poll_gap, DEFAULT_BURST_POLL_GAP_SECS);
        assert_eq!(m.spread_min_gap, DEFAULT_SPREAD_MIN_GAP_SECS);
        assert_eq!(m.card_last4(), "4444");
    }

    #[test]
    fn merchant_without_explicit_enable_is_dropped() {
        let yaml = SAMPLE.replace("enabled: true\n      ", "");
        let err = Config::from_yaml(&yaml).unwrap_err();
        assert!(matches!(err, ConfigError::NoEnabledMerchants));
    }

    #[test]
    fn burst_mode_requires_burst_count() {
        let yaml = SAMPLE.replace("burst_count: 3\n      ", "");
        let err = Config::from_yaml(&yaml).unwrap_err();
        assert!(matches!(err, ConfigError::MissingBurstCount { .. }));
    }

    #[test]
    fn spread_mode_does_not_require_burst_count() {
        let yaml = SAMPLE
            .replace("mode: burst", "mode: spread")
            .replace("burst_count: 3\n      ", "");
        let config = Config::from_yaml(&yaml).unwrap();
        assert_eq!(config.merchants[0].burst_count, 1);
    }

    #[test]
    fn rejects_inverted_amount_range() {
        let yaml = SAMPLE.replace("amount_min: 20", "amount_min: 90");
        let err = Config::from_yaml(&yaml).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidAmountRange { .. }));
    }

    #[test]
    fn rejects_malformed_yaml() {
        let err = Config::from_yaml("mode: [burst").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn rejects_short_card_number() {
        let yaml = SAMPLE.replace("\"4111222233334444\"", "\"411\"");
        let err = Config::from_yaml(&yaml).unwrap_err();
        assert!(matches!(err, ConfigError::CardTooShort { .. }));
    }

    #[test]
    fn rejects_non_digit_card_number() {
        // Separators are a common paste mistake.
        let yaml = SAMPLE.replace("\"4111222233334444\"", "\"4111 2222 3333 4444\"");
        let err = Config::from_yaml(&yaml).unwrap_err();
        assert!(matches!(err, ConfigError::CardNotNumeric { .. }));

        // Multi-byte digits would break the last-4 suffix slice.
        let yaml = SAMPLE.replace("\"4111222233334444\"", "\"４１１１２２２２３３３３４４４４\"");
        let err = Config::from_yaml(&yaml).unwrap_err();
        assert!(matches!(err, ConfigError::CardNotNumeric { .. }));
    }
}

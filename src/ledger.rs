//! Durable per-month purchase ledger.
//!
//! One YAML document per (year, month), mapping merchant id to its purchase
//! count and ordered transaction history. A new calendar month always starts
//! from an empty document; historical months are never touched again.
//!
//! All merchant schedulers share one [`LedgerStore`]. Writes take a single
//! store-wide lock spanning the whole load-mutate-write cycle so concurrent
//! completions never lose a transaction. Reads used only for scheduling
//! decisions skip the lock; a scheduler reloads before acting anyway.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Local};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

/// Errors from ledger persistence. A missing file is not an error; anything
/// else (I/O, parse) is surfaced to the caller.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("failed to read ledger {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write ledger {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse ledger {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("failed to serialize ledger: {0}")]
    Serialize(#[from] serde_yaml::Error),
}

/// One completed purchase. Append-only; insertion order is chronological.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Formatted as `"<int> cents"` in the persisted document.
    pub amount: String,
    pub human_time: String,
    pub unix_time: i64,
}

impl Transaction {
    pub fn new(amount_cents: u32, now: DateTime<Local>) -> Self {
        Self {
            amount: format!("{} cents", amount_cents),
            human_time: now.format("%Y-%m-%d %I:%M%p").to_string(),
            unix_time: now.timestamp(),
        }
    }

    /// Parse the amount back out of its `"<int> cents"` form.
    pub fn amount_cents(&self) -> Option<u32> {
        self.amount.strip_suffix(" cents")?.parse().ok()
    }
}

/// Per-merchant slice of a month's ledger.
///
/// Invariant: `purchase_count == transactions.len()` at all times.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerchantLedger {
    pub purchase_count: u32,
    pub transactions: Vec<Transaction>,
}

impl MerchantLedger {
    /// Unix time of the most recent transaction, if any.
    pub fn last_purchase_time(&self) -> Option<i64> {
        self.transactions.last().map(|t| t.unix_time)
    }
}

/// The full document for one month, keyed by merchant id.
pub type Ledger = BTreeMap<String, MerchantLedger>;

/// Store of per-month ledger documents under a state directory.
pub struct LedgerStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl LedgerStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Storage key is derived deterministically from (year, month).
    fn path_for(&self, year: i32, month: u32) -> PathBuf {
        self.dir.join(format!("pacer_{}_{:02}.yml", year, month))
    }

    /// Load the ledger for a month, or an empty ledger if none exists yet.
    pub async fn load(&self, year: i32, month: u32) -> Result<Ledger, LedgerError> {
        let path = self.path_for(year, month);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Ledger::new()),
            Err(source) => return Err(LedgerError::Read { path, source }),
        };

        serde_yaml::from_str(&contents).map_err(|source| LedgerError::Parse { path, source })
    }

    /// Append one transaction for `merchant_id` and return the new purchase
    /// count. Holds the store-wide write lock across the whole
    /// read-modify-write so concurrent recorders never clobber each other.
    pub async fn record(
        &self,
        merchant_id: &str,
        amount_cents: u32,
        now: DateTime<Local>,
    ) -> Result<u32, LedgerError> {
        let _guard = self.write_lock.lock().await;

        let year = now.year();
        let month = now.month();
        let mut ledger = self.load(year, month).await?;

        let entry = ledger.entry(merchant_id.to_string()).or_default();
        entry.purchase_count += 1;
        entry.transactions.push(Transaction::new(amount_cents, now));
        let new_count = entry.purchase_count;

        self.persist(&self.path_for(year, month), &ledger).await?;

        tracing::info!(
            merchant = %merchant_id,
            purchase_count = new_count,
            amount_cents,
            "Recorded successful purchase"
        );
        Ok(new_count)
    }

    /// Write the document to a temp file, then rename into place so readers
    /// never observe a partially written ledger.
    async fn persist(&self, path: &Path, ledger: &Ledger) -> Result<(), LedgerError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| LedgerError::Write {
                path: self.dir.clone(),
                source,
            })?;

        let serialized = serde_yaml::to_string(ledger)?;
        let tmp_path = path.with_extension("yml.tmp");

        tokio::fs::write(&tmp_path, serialized)
            .await
            .map_err(|source| LedgerError::Write {
                path: tmp_path.clone(),
                source,
            })?;
        tokio::fs::rename(&tmp_path, path)
            .await
            .map_err(|source| LedgerError::Write {
                path: path.to_path_buf(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_time(day: u32, hour: u32) -> DateTime<Local> {
        Local
            .with_ymd_and_hms(2026, 7, day, hour, 30, 0)
            .earliest()
            .unwrap()
    }

    #[tokio::test]
    async fn load_missing_month_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = LedgerStore::new(dir.path());
        let ledger = store.load(2026, 7).await.unwrap();
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn record_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = LedgerStore::new(dir.path());

        assert_eq!(
            store.record("card_shop", 25, fixed_time(3, 9)).await.unwrap(),
            1
        );
        assert_eq!(
            store.record("card_shop", 31, fixed_time(3, 14)).await.unwrap(),
            2
        );
        assert_eq!(
            store.record("card_shop", 47, fixed_time(5, 8)).await.unwrap(),
            3
        );

        let before = store.load(2026, 7).await.unwrap();

        // Simulate a restart: a fresh store over the same directory must
        // reconstruct an equal ledger.
        let reopened = LedgerStore::new(dir.path());
        let after = reopened.load(2026, 7).await.unwrap();
        assert_eq!(before, after);

        let entry = &after["card_shop"];
        assert_eq!(entry.purchase_count, 3);
        assert_eq!(entry.purchase_count as usize, entry.transactions.len());
        let amounts: Vec<u32> = entry
            .transactions
            .iter()
            .map(|t| t.amount_cents().unwrap())
            .collect();
        assert_eq!(amounts, vec![25, 31, 47]);
        assert_eq!(entry.transactions[0].amount, "25 cents");
        assert_eq!(entry.last_purchase_time(), Some(fixed_time(5, 8).timestamp()));
    }

    #[tokio::test]
    async fn next_month_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = LedgerStore::new(dir.path());
        store.record("card_shop", 25, fixed_time(31, 23)).await.unwrap();

        assert!(!store.load(2026, 7).await.unwrap().is_empty());
        assert!(store.load(2026, 8).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_records_are_all_kept() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(LedgerStore::new(dir.path()));

        let a = {
            let store = store.clone();
            tokio::spawn(async move { store.record("card_a", 10, fixed_time(4, 1)).await })
        };
        let b = {
            let store = store.clone();
            tokio::spawn(async move { store.record("card_b", 20, fixed_time(4, 1)).await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        let ledger = store.load(2026, 7).await.unwrap();
        assert_eq!(ledger["card_a"].purchase_count, 1);
        assert_eq!(ledger["card_b"].purchase_count, 1);
    }

    #[tokio::test]
    async fn corrupt_ledger_is_surfaced() {
        let dir = tempfile::tempdir().unwrap();
        let store = LedgerStore::new(dir.path());
        tokio::fs::create_dir_all(dir.path()).await.unwrap();
        tokio::fs::write(dir.path().join("pacer_2026_07.yml"), "{not yaml")
            .await
            .unwrap();

        let err = store.load(2026, 7).await.unwrap_err();
        assert!(matches!(err, LedgerError::Parse { .. }));
    }
}

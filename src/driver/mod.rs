//! Site-driver contract and registry.
//!
//! A site driver attempts exactly one purchase against one merchant's
//! website and reports the outcome. Its internals (page automation, form
//! filling) are opaque to the scheduling core; the core only depends on the
//! contract here.
//!
//! Drivers are resolved from a static [`DriverRegistry`] at startup, keyed
//! by merchant name. The shared automation session is a process-wide
//! resource: [`SessionPool`] hands out exclusive [`DriverSession`] guards so
//! one merchant's attempt (including its diagnostic capture) fully completes
//! before another begins.

mod example;

pub use example::ExampleMerchant;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::config::Merchant;

/// Outcome of a single purchase attempt.
///
/// Every consumer matches this exhaustively; a missed case would silently
/// skip a safety behavior (most importantly the fatal handling of
/// `Unverified`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurchaseOutcome {
    /// Purchase confirmed. Carries the amount actually charged, which the
    /// driver may have reduced below the requested amount (e.g. to match a
    /// smaller remaining balance).
    Success { amount_cents: u32 },
    /// Expected business condition (e.g. zero balance); not a failure. The
    /// caller imposes a cooldown before trying this merchant again.
    Skipped,
    /// The purchase command was issued but success could not be confirmed.
    /// Money may have moved; treated as fatal pending human review.
    Unverified,
    /// Unexpected condition; eligible for retry with backoff.
    Failed,
}

/// Unexpected driver-side errors. Equivalent to [`PurchaseOutcome::Failed`];
/// drivers must not raise on expected business conditions.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("automation step failed: {0}")]
    Automation(String),

    #[error("could not obtain an automation session: {0}")]
    Session(String),
}

/// Exclusive handle on the shared automation session.
///
/// Dropping the guard releases the session on every exit path, including
/// early returns and cancellation. Drivers stash their latest page state
/// here so a failure can be captured after the fact.
pub struct DriverSession {
    /// Raw markup of the last page the driver observed. Scrubbed of
    /// credentials before it leaves the process.
    pub page_html: Option<String>,
    /// PNG screenshot of the last page, if the driver captured one.
    pub screenshot_png: Option<Vec<u8>>,
    _permit: OwnedMutexGuard<()>,
}

/// Grants exclusive access to the one shared automation session per process.
#[derive(Clone)]
pub struct SessionPool {
    slot: Arc<Mutex<()>>,
}

impl SessionPool {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(())),
        }
    }

    /// Wait for the session to be free and claim it.
    pub async fn acquire(&self) -> DriverSession {
        let permit = Arc::clone(&self.slot).lock_owned().await;
        DriverSession {
            page_html: None,
            screenshot_png: None,
            _permit: permit,
        }
    }
}

impl Default for SessionPool {
    fn default() -> Self {
        Self::new()
    }
}

/// One purchase attempt against one merchant's website.
#[async_trait]
pub trait SiteDriver: Send + Sync {
    /// Registry key; matches the merchant name in the config file.
    fn name(&self) -> &str;

    /// Attempt a single purchase of `amount_cents`.
    ///
    /// Expected business conditions map to `Ok(Skipped)` or
    /// `Ok(Unverified)`; only unexpected conditions return `Ok(Failed)` or
    /// `Err`.
    async fn purchase(
        &self,
        session: &mut DriverSession,
        merchant: &Merchant,
        amount_cents: u32,
    ) -> Result<PurchaseOutcome, DriverError>;
}

/// Static mapping from merchant name to its site driver, built once at
/// startup. Replaces any runtime lookup-by-name dynamism: an unknown
/// merchant is a startup error.
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<dyn SiteDriver>>,
}

impl DriverRegistry {
    /// Registry with all built-in drivers.
    pub fn with_builtin() -> Self {
        let mut registry = Self {
            drivers: HashMap::new(),
        };
        registry.register(Arc::new(ExampleMerchant::new()));
        registry
    }

    pub fn register(&mut self, driver: Arc<dyn SiteDriver>) {
        self.drivers.insert(driver.name().to_string(), driver);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn SiteDriver>> {
        self.drivers.get(name).map(Arc::clone)
    }
}

/// Format a cents amount the way merchant payment fields expect.
/// `4` -> `"0.04"`, `50` -> `"0.50"`, `12345` -> `"123.45"`.
pub fn cents_to_str(cents: u32) -> String {
    format!("{}.{:02}", cents / 100, cents % 100)
}

/// Strip every non-digit and parse what remains as cents.
/// `"$77.84"` -> `7784`, `"balance: 1.50"` -> `150`.
pub fn str_to_cents(s: &str) -> Option<u32> {
    let digits: String = s.chars().filter(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

//! Reference site driver.
//!
//! How to add a new merchant driver: implement [`SiteDriver`] in a new file
//! in this directory, register it in `DriverRegistry::with_builtin`, and add
//! a config block whose merchant name matches `name()`. The driver must
//! return a [`PurchaseOutcome`] in every scenario it can distinguish:
//! a zero remaining balance is `Skipped` (not an error), an issued purchase
//! whose confirmation cannot be read is `Unverified`, and only genuinely
//! unexpected conditions return `Failed` or `Err`.
//!
//! This implementation performs no real web automation; it walks the same
//! decision points a real driver does so the contract is exercised end to
//! end against a simulated account.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};

use super::{cents_to_str, str_to_cents, DriverError, DriverSession, PurchaseOutcome, SiteDriver};
use crate::config::Merchant;

pub struct ExampleMerchant {
    /// Simulated remaining balance; decremented by each purchase.
    balance_cents: AtomicU32,
}

impl ExampleMerchant {
    pub fn new() -> Self {
        Self {
            balance_cents: AtomicU32::new(10_000),
        }
    }
}

impl Default for ExampleMerchant {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SiteDriver for ExampleMerchant {
    fn name(&self) -> &str {
        "example_merchant"
    }

    async fn purchase(
        &self,
        session: &mut DriverSession,
        merchant: &Merchant,
        amount_cents: u32,
    ) -> Result<PurchaseOutcome, DriverError> {
        tracing::info!(merchant = %merchant.id, amount = %cents_to_str(amount_cents), "Running example merchant purchase");

        let balance = self.balance_cents.load(Ordering::SeqCst);
        if balance == 0 {
            // Bill already paid in full; try again another day.
            tracing::warn!(merchant = %merchant.id, "Example merchant balance is zero, will try again later");
            return Ok(PurchaseOutcome::Skipped);
        }

        // A real driver reduces the charge to the remaining balance rather
        // than overpaying; the recorded amount must be the charged one.
        let charged = amount_cents.min(balance);
        self.balance_cents.fetch_sub(charged, Ordering::SeqCst);

        let page = format!(
            "<html><body>Payment of ${} submitted for {}</body></html>",
            cents_to_str(charged),
            merchant.usr,
        );

        // Read the charge back off the confirmation page; a mismatch means
        // money may have moved without proof of how much.
        let confirmed = page
            .split('$')
            .nth(1)
            .and_then(|rest| rest.split_whitespace().next())
            .and_then(str_to_cents);
        session.page_html = Some(page);

        if confirmed != Some(charged) {
            return Ok(PurchaseOutcome::Unverified);
        }

        Ok(PurchaseOutcome::Success {
            amount_cents: charged,
        })
    }
}

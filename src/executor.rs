//! Attempt executor: one purchase with bounded retry.
//!
//! Wraps a single site-driver call in the retry state machine. Each
//! iteration chooses a fresh amount and acquires a fresh session; the
//! session guard is released on every exit path. Outcomes map to exactly
//! one of: return success/skip to the scheduler, back off and retry, or
//! halt this merchant permanently.
//!
//! A shutdown signal always wins: every suspension point (session
//! acquisition, the driver call, backoff sleeps) is raced against the
//! cancellation token.

use std::time::Duration;

use chrono::{Datelike, Local};
use thiserror::Error;

use crate::amount;
use crate::context::MerchantContext;
use crate::driver::PurchaseOutcome;
use crate::ledger::LedgerError;

/// Consecutive failures after which a merchant is permanently halted.
pub const FAILURE_THRESHOLD: u32 = 5;

/// Backoff before retry `failures + 1`: `60 * failures^4` seconds
/// (1 min, 16 min, ~1.3 h, ~4.3 h, ~10.4 h).
pub fn backoff_delay(failures: u32) -> Duration {
    Duration::from_secs(60 * u64::from(failures).pow(4))
}

/// Non-terminal outcome of one executor cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Purchase confirmed and recorded in the ledger.
    Success,
    /// Driver declined for an expected reason; the scheduler imposes a
    /// cooldown before this merchant is reconsidered.
    Skipped,
}

/// Terminal conditions for one merchant's scheduling. None of these affect
/// other merchants.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("{merchant_id} failed {failures} times in a row. NOT scheduling more {merchant_id} purchases. Stop and re-run pacer to try again.")]
    RetriesExhausted { merchant_id: String, failures: u32 },

    #[error("unable to verify {merchant_id} purchase was successful. Just in case, NOT scheduling more {merchant_id} purchases. Stop and re-run pacer to try again.")]
    Unverified { merchant_id: String },

    #[error("shutdown requested")]
    Cancelled,

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Run purchase attempts for this merchant until one resolves.
///
/// On `Success` the ledger holds the amount the driver actually charged,
/// which may be lower than the requested amount.
pub async fn execute(ctx: &MerchantContext) -> Result<Outcome, ExecutorError> {
    let merchant = &ctx.merchant;
    let mut failures = 0u32;

    loop {
        if ctx.cancel.is_cancelled() {
            return Err(ExecutorError::Cancelled);
        }

        let now = Local::now();
        let ledger = ctx.ledger.load(now.year(), now.month()).await?;
        let amount = amount::choose_amount(merchant, ledger.get(&merchant.id));

        let mut session = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(ExecutorError::Cancelled),
            session = ctx.sessions.acquire() => session,
        };

        tracing::info!(merchant = %merchant.id, amount_cents = amount, "Attempting purchase");

        let result = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(ExecutorError::Cancelled),
            result = ctx.driver.purchase(&mut session, merchant, amount) => result,
        };

        // A driver error is the same thing as an explicit failure report.
        let mut error_msg = None;
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                error_msg = Some(e.to_string());
                PurchaseOutcome::Failed
            }
        };

        match outcome {
            PurchaseOutcome::Success { amount_cents } => {
                drop(session);
                ctx.ledger
                    .record(&merchant.id, amount_cents, Local::now())
                    .await?;
                return Ok(Outcome::Success);
            }

            PurchaseOutcome::Skipped => {
                drop(session);
                tracing::info!(merchant = %merchant.id, "Driver skipped the purchase, cooling down");
                return Ok(Outcome::Skipped);
            }

            PurchaseOutcome::Unverified => {
                ctx.diagnostics
                    .capture(
                        merchant,
                        "purchase command issued but confirmation was not observed",
                        &session,
                    )
                    .await;
                drop(session);

                let err = ExecutorError::Unverified {
                    merchant_id: merchant.id.clone(),
                };
                tracing::error!(merchant = %merchant.id, "{}", err);
                ctx.notifier
                    .notify_terminal_failure(&merchant.id, &err.to_string())
                    .await;
                return Err(err);
            }

            PurchaseOutcome::Failed => {
                let msg = error_msg.unwrap_or_else(|| "driver reported failure".to_string());
                tracing::error!(merchant = %merchant.id, error = %msg, "Purchase attempt failed");
                ctx.diagnostics.capture(merchant, &msg, &session).await;
                drop(session);

                failures += 1;
                if failures >= FAILURE_THRESHOLD {
                    let err = ExecutorError::RetriesExhausted {
                        merchant_id: merchant.id.clone(),
                        failures,
                    };
                    tracing::error!(merchant = %merchant.id, "{}", err);
                    ctx.notifier
                        .notify_terminal_failure(&merchant.id, &err.to_string())
                        .await;
                    return Err(err);
                }

                let delay = backoff_delay(failures);
                tracing::info!(
                    merchant = %merchant.id,
                    attempt = failures,
                    threshold = FAILURE_THRESHOLD,
                    retry_in_secs = delay.as_secs(),
                    "Trying again after backoff"
                );
                tokio::select! {
                    _ = ctx.cancel.cancelled() => return Err(ExecutorError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Merchant;
    use crate::diagnostics::Diagnostics;
    use crate::driver::scripted::ScriptedDriver;
    use crate::driver::{DriverError, SessionPool};
    use crate::ledger::LedgerStore;
    use crate::notify::Notifier;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn merchant() -> Merchant {
        Merchant {
            id: "card_shop".to_string(),
            name: "shop".to_string(),
            total_purchases: 10,
            amount_min: 20,
            amount_max: 50,
            min_day: 2,
            max_day: None,
            burst_count: 3,
            burst_min_gap: None,
            burst_time_variance: 14_400,
            burst_intra_gap: 30,
            burst_poll_gap: 300,
            spread_min_gap: 14_400,
            spread_time_variance: 14_400,
            usr: "usr@example.com".to_string(),
            psw: "psw".to_string(),
            card: "4111222233334444".to_string(),
        }
    }

    fn context(driver: Arc<ScriptedDriver>) -> (MerchantContext, TempDir, TempDir) {
        let state = tempfile::tempdir().unwrap();
        let failures = tempfile::tempdir().unwrap();
        let ctx = MerchantContext {
            merchant: merchant(),
            driver,
            ledger: Arc::new(LedgerStore::new(state.path())),
            sessions: SessionPool::new(),
            diagnostics: Diagnostics::new(failures.path()),
            notifier: Notifier::new(None),
            cancel: CancellationToken::new(),
        };
        (ctx, state, failures)
    }

    #[test]
    fn backoff_sequence_is_exact() {
        let secs: Vec<u64> = (1..=5).map(|n| backoff_delay(n).as_secs()).collect();
        assert_eq!(secs, vec![60, 960, 4860, 15360, 37500]);
    }

    #[tokio::test(start_paused = true)]
    async fn success_records_the_charged_amount() {
        // Driver adjusts the charge downward; the ledger must hold 17, not
        // whatever amount was requested.
        let driver = Arc::new(ScriptedDriver::new(vec![Ok(PurchaseOutcome::Success {
            amount_cents: 17,
        })]));
        let (ctx, _state, _failures) = context(driver.clone());

        let outcome = execute(&ctx).await.unwrap();
        assert_eq!(outcome, Outcome::Success);
        assert_eq!(driver.calls(), 1);

        let now = Local::now();
        let ledger = ctx.ledger.load(now.year(), now.month()).await.unwrap();
        let entry = &ledger["card_shop"];
        assert_eq!(entry.purchase_count, 1);
        assert_eq!(entry.transactions[0].amount_cents(), Some(17));
    }

    #[tokio::test(start_paused = true)]
    async fn skip_returns_without_retry_or_record() {
        let driver = Arc::new(ScriptedDriver::new(vec![Ok(PurchaseOutcome::Skipped)]));
        let (ctx, _state, _failures) = context(driver.clone());

        let outcome = execute(&ctx).await.unwrap();
        assert_eq!(outcome, Outcome::Skipped);
        assert_eq!(driver.calls(), 1);

        let now = Local::now();
        let ledger = ctx.ledger.load(now.year(), now.month()).await.unwrap();
        assert!(ledger.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unverified_is_fatal_without_retry() {
        let driver = Arc::new(ScriptedDriver::new(vec![
            Ok(PurchaseOutcome::Unverified),
            Ok(PurchaseOutcome::Success { amount_cents: 20 }),
        ]));
        let (ctx, _state, _failures) = context(driver.clone());

        let err = execute(&ctx).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Unverified { .. }));
        // The queued success must never be reached.
        assert_eq!(driver.calls(), 1);

        let now = Local::now();
        let ledger = ctx.ledger.load(now.year(), now.month()).await.unwrap();
        assert!(ledger.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn five_failures_back_off_then_halt_without_a_sixth_attempt() {
        let driver = Arc::new(ScriptedDriver::new(vec![])); // empty script => always Failed
        let (ctx, _state, _failures) = context(driver.clone());

        let start = tokio::time::Instant::now();
        let err = execute(&ctx).await.unwrap_err();
        let slept = start.elapsed();

        assert!(matches!(
            err,
            ExecutorError::RetriesExhausted { failures: 5, .. }
        ));
        assert_eq!(driver.calls(), 5);
        // Backoffs after failures 1-4; no sleep once the threshold is hit.
        assert_eq!(slept, Duration::from_secs(60 + 960 + 4860 + 15360));
    }

    #[tokio::test(start_paused = true)]
    async fn failure_then_success_recovers() {
        let driver = Arc::new(ScriptedDriver::new(vec![
            Err(DriverError::Automation("element not found".to_string())),
            Ok(PurchaseOutcome::Success { amount_cents: 33 }),
        ]));
        let (ctx, _state, _failures) = context(driver.clone());

        let outcome = execute(&ctx).await.unwrap();
        assert_eq!(outcome, Outcome::Success);
        assert_eq!(driver.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_bypasses_all_retry_logic() {
        let driver = Arc::new(ScriptedDriver::new(vec![]));
        let (ctx, _state, _failures) = context(driver.clone());
        ctx.cancel.cancel();

        let err = execute(&ctx).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Cancelled));
        assert_eq!(driver.calls(), 0);
    }
}

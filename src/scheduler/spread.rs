//! Spread scheduler.
//!
//! Distributes a merchant's purchases individually across the month. After
//! each purchase the next one is scheduled a randomized offset away: the
//! average gap divides the time left in the month by the purchases left,
//! and the jitter window shrinks when the average gap is tight. Once the
//! month's quota is met the next purchase waits for `min_day` of the next
//! month.
//!
//! Like the burst scheduler, every decision is recomputed from the ledger,
//! so a restart picks up the month wherever it stands.

use chrono::{DateTime, Datelike, Local};
use rand::Rng;
use thiserror::Error;

use super::{clock, sleep_or_cancel};
use crate::config::Merchant;
use crate::context::MerchantContext;
use crate::executor::{self, ExecutorError};
use crate::ledger::MerchantLedger;

/// Jitter below this many seconds stops shrinking.
const MIN_TIME_VARIANCE_SECS: u64 = 60;

#[derive(Debug, Error)]
pub enum SpreadError {
    #[error("could not determine the start of next month")]
    NextMonthStart,
}

/// What to do when the scheduler first comes up for the month.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bootstrap {
    /// No reason to wait: purchase immediately.
    PurchaseNow,
    /// The month's window has not opened yet.
    WaitSecs(u64),
    /// The ledger is current enough; fall through to normal scheduling.
    Reschedule,
}

/// Decide the first action of a (re)started month from the ledger.
pub fn bootstrap(
    merchant: &Merchant,
    entry: Option<&MerchantLedger>,
    now: DateTime<Local>,
) -> Result<Bootstrap, SpreadError> {
    let Some(entry) = entry else {
        // First run of the month.
        if now.day() >= merchant.min_day {
            return Ok(Bootstrap::PurchaseNow);
        }
        let window_open = clock::local_midnight(now.year(), now.month(), merchant.min_day)
            .ok_or(SpreadError::NextMonthStart)?;
        return Ok(Bootstrap::WaitSecs((window_open - now).num_seconds().max(0) as u64));
    };

    let behind = entry
        .last_purchase_time()
        .map(|t| now.timestamp() - t > merchant.spread_min_gap as i64)
        .unwrap_or(true);

    if entry.purchase_count < merchant.total_purchases && behind {
        Ok(Bootstrap::PurchaseNow)
    } else {
        Ok(Bootstrap::Reschedule)
    }
}

/// Seconds until the next purchase should run.
///
/// While the quota is unmet the offset is drawn around the average gap,
/// floored at `spread_min_gap`. Once met, it lands on `min_day` of next
/// month plus up to one jitter window.
pub fn next_spread_offset(
    merchant: &Merchant,
    cur_purchase_count: u32,
    now: DateTime<Local>,
    rng: &mut impl Rng,
) -> Result<u64, SpreadError> {
    if cur_purchase_count < merchant.total_purchases {
        let remaining = u64::from(merchant.total_purchases - cur_purchase_count);
        let remaining_secs = clock::remaining_secs_in_month(now, merchant.max_day);
        let average_gap = remaining_secs / remaining;

        let mut variance = merchant.spread_time_variance;
        while average_gap < variance * 2 && variance > MIN_TIME_VARIANCE_SECS {
            variance /= 2;
        }

        let range_min = average_gap.saturating_sub(variance).max(merchant.spread_min_gap);
        let range_max = (average_gap + variance).max(merchant.spread_min_gap);
        Ok(rng.gen_range(range_min..=range_max))
    } else {
        let (year, month) = clock::next_month(now.year(), now.month());
        let window_open = clock::local_midnight(year, month, merchant.min_day)
            .ok_or(SpreadError::NextMonthStart)?;

        let range_min = (window_open - now).num_seconds();
        if range_min <= 0 {
            return Err(SpreadError::NextMonthStart);
        }

        let range_min = range_min as u64;
        Ok(rng.gen_range(range_min..=range_min + merchant.spread_time_variance))
    }
}

/// Draw the next offset from the current ledger and sleep it out. Returns
/// `false` when the loop should end.
async fn wait_for_next_slot(ctx: &MerchantContext) -> bool {
    let id = &ctx.merchant.id;
    let now = Local::now();

    let ledger = match ctx.ledger.load(now.year(), now.month()).await {
        Ok(ledger) => ledger,
        Err(e) => {
            tracing::error!(merchant = %id, error = %e, "Could not read ledger, retrying after the minimum gap");
            return sleep_or_cancel(&ctx.cancel, ctx.merchant.spread_min_gap).await;
        }
    };
    let cur_purchase_count = ledger.get(id).map(|e| e.purchase_count).unwrap_or(0);

    let offset = {
        let mut rng = rand::thread_rng();
        match next_spread_offset(&ctx.merchant, cur_purchase_count, now, &mut rng) {
            Ok(offset) => offset,
            Err(e) => {
                tracing::error!(merchant = %id, error = %e, "Halting spread schedule");
                return false;
            }
        }
    };

    tracing::info!(
        merchant = %id,
        at = %clock::formatted_offset(now, offset),
        "Scheduling next purchase"
    );
    sleep_or_cancel(&ctx.cancel, offset).await
}

/// Spread scheduling loop for one merchant. Returns when shutdown is
/// requested or the merchant is permanently halted.
pub async fn run(ctx: MerchantContext) {
    let id = ctx.merchant.id.clone();

    let now = Local::now();
    let ledger = match ctx.ledger.load(now.year(), now.month()).await {
        Ok(ledger) => ledger,
        Err(e) => {
            tracing::error!(merchant = %id, error = %e, "Could not read ledger at startup");
            return;
        }
    };

    match bootstrap(&ctx.merchant, ledger.get(&id), now) {
        Ok(Bootstrap::PurchaseNow) => {}
        Ok(Bootstrap::WaitSecs(secs)) => {
            tracing::info!(
                merchant = %id,
                at = %clock::formatted_offset(now, secs),
                "Scheduling first purchase of the month"
            );
            if !sleep_or_cancel(&ctx.cancel, secs).await {
                return;
            }
        }
        Ok(Bootstrap::Reschedule) => {
            if !wait_for_next_slot(&ctx).await {
                return;
            }
        }
        Err(e) => {
            tracing::error!(merchant = %id, error = %e, "Halting spread schedule");
            return;
        }
    }

    loop {
        match executor::execute(&ctx).await {
            Ok(executor::Outcome::Success) | Ok(executor::Outcome::Skipped) => {}
            Err(ExecutorError::Cancelled) => return,
            Err(e) => {
                tracing::error!(merchant = %id, error = %e, "Halting spread schedule");
                return;
            }
        }

        if !wait_for_next_slot(&ctx).await {
            return;
        }
    }
}

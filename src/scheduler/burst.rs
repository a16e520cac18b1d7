//! Burst scheduler.
//!
//! Executes `burst_count` purchases back to back, then waits out an
//! inter-burst gap before the next group. The gap is either configured
//! explicitly or derived from the time left in the month so the purchase
//! budget is spent across roughly the first quarter of the remaining window,
//! and it is always jittered by a random variance.
//!
//! All scheduling state is reconstructed from the ledger on every loop
//! iteration, so a restart (even mid-burst) resumes where it left off: any
//! transactions recorded within the last partial burst shrink the next one.

use chrono::{DateTime, Datelike, Local};
use rand::Rng;

use super::{clock, sleep_or_cancel};
use crate::config::Merchant;
use crate::context::MerchantContext;
use crate::executor::{self, ExecutorError};
use crate::ledger::MerchantLedger;

/// Fallback inter-burst gap (22 hours) when the dynamic gap cannot be
/// derived or comes out longer.
pub const DEFAULT_BURST_MIN_GAP_SECS: u64 = 79_200;

/// Fraction of the remaining month the purchase budget is squeezed into.
const BURST_BUDGET_DIVISOR: u64 = 4;

/// A transaction this recent counts as part of an interrupted burst.
const RESUME_WINDOW_CAP_SECS: u64 = 3_600;

/// How long a driver skip pauses this merchant.
const SKIP_COOLDOWN_HOURS: i64 = 24;

/// Minimum seconds between the starts of two bursts.
///
/// The dynamic form spreads the remaining purchases over a quarter of the
/// time left in the month, scaled up by the burst size since each burst
/// consumes `burst_count` of them.
pub fn burst_min_gap(merchant: &Merchant, cur_purchase_count: u32, now: DateTime<Local>) -> u64 {
    if let Some(gap) = merchant.burst_min_gap {
        return gap;
    }

    let remaining = merchant.total_purchases.saturating_sub(cur_purchase_count);
    if remaining < 1 {
        return DEFAULT_BURST_MIN_GAP_SECS;
    }

    let remaining_secs = clock::remaining_secs_in_month(now, merchant.max_day);
    let dynamic = remaining_secs * u64::from(merchant.burst_count)
        / (BURST_BUDGET_DIVISOR * u64::from(remaining));
    dynamic.min(DEFAULT_BURST_MIN_GAP_SECS)
}

/// Size and ledger anchor of the next burst.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BurstPlan {
    /// Purchases to make in the next burst. Zero means nothing is owed right
    /// now (quota reached, or an interrupted burst already completed).
    pub count: u32,
    /// Unix time the previous full burst started, or 0 if none this month.
    pub prev_burst_time: i64,
}

/// Derive the next burst from the ledger alone.
pub fn plan_burst(
    merchant: &Merchant,
    entry: Option<&MerchantLedger>,
    now: DateTime<Local>,
) -> BurstPlan {
    let cur_purchase_count = entry.map(|e| e.purchase_count).unwrap_or(0);
    let mut count = merchant.burst_count;
    let mut prev_burst_time = 0;

    if let Some(entry) = entry {
        let burst_len = merchant.burst_count as usize;
        if entry.transactions.len() >= burst_len {
            prev_burst_time = entry.transactions[entry.transactions.len() - burst_len].unix_time;
        }

        // Transactions recorded moments before a restart belong to the burst
        // that was interrupted; finish that burst instead of starting over.
        let window = burst_min_gap(merchant, cur_purchase_count, now).min(RESUME_WINDOW_CAP_SECS);
        let cutoff = now.timestamp() - window as i64;
        let recent = entry
            .transactions
            .iter()
            .rev()
            .take(burst_len)
            .filter(|t| t.unix_time > cutoff)
            .count() as u32;
        count = count.saturating_sub(recent);
    }

    count = count.min(merchant.total_purchases.saturating_sub(cur_purchase_count));
    BurstPlan {
        count,
        prev_burst_time,
    }
}

/// Whether a burst may start right now.
pub fn gate_open(
    merchant: &Merchant,
    plan: &BurstPlan,
    cur_purchase_count: u32,
    burst_gap: u64,
    skip_until: DateTime<Local>,
    now: DateTime<Local>,
) -> bool {
    let end_day = clock::month_end_day(merchant.max_day, now.year(), now.month());

    plan.count > 0
        && plan.prev_burst_time < now.timestamp() - burst_gap as i64
        && now.day() >= merchant.min_day
        && now.day() <= end_day
        && cur_purchase_count < merchant.total_purchases
        && now > skip_until
}

/// When the next burst is expected, for idle logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextBurst {
    pub count: u32,
    pub at: DateTime<Local>,
}

/// Project when the gate will next open and how many purchases it will run.
pub fn next_burst_announcement(
    merchant: &Merchant,
    cur_purchase_count: u32,
    prev_burst_time: i64,
    burst_gap: u64,
    skip_until: DateTime<Local>,
    now: DateTime<Local>,
) -> NextBurst {
    let prev_plus_gap = clock::local_from_unix(prev_burst_time + burst_gap as i64);
    let end_day = clock::month_end_day(merchant.max_day, now.year(), now.month());

    let (mut at, count) = if now.day() < merchant.min_day {
        let month_start = clock::local_midnight(now.year(), now.month(), merchant.min_day);
        (
            prev_plus_gap.max(month_start.unwrap_or(now)),
            merchant.burst_count,
        )
    } else if cur_purchase_count >= merchant.total_purchases || now.day() > end_day {
        let (year, month) = clock::next_month(now.year(), now.month());
        let next_start = clock::local_midnight(year, month, merchant.min_day);
        (
            prev_plus_gap.max(next_start.unwrap_or(now)),
            merchant.burst_count,
        )
    } else {
        (
            prev_plus_gap,
            merchant
                .burst_count
                .min(merchant.total_purchases - cur_purchase_count),
        )
    };

    if at < skip_until {
        at = skip_until;
    }
    NextBurst { count, at }
}

/// Loop state after a burst finishes: the re-jittered inter-burst gap, and
/// the skip cooldown (a full day when the driver skipped, untouched
/// otherwise).
pub fn after_burst(
    merchant: &Merchant,
    outcome: executor::Outcome,
    cur_purchase_count: u32,
    attempts: u32,
    jitter: u64,
    skip_until: DateTime<Local>,
    now: DateTime<Local>,
) -> (u64, DateTime<Local>) {
    let skip_until = if outcome == executor::Outcome::Skipped {
        now + chrono::Duration::hours(SKIP_COOLDOWN_HOURS)
    } else {
        skip_until
    };

    let burst_gap = burst_min_gap(merchant, cur_purchase_count + attempts, now) + jitter;
    (burst_gap, skip_until)
}

/// Run up to `count` purchases back to back, stopping early on anything
/// other than a success. Returns the last outcome and how many attempts ran.
async fn run_burst(
    ctx: &MerchantContext,
    count: u32,
) -> Result<(executor::Outcome, u32), ExecutorError> {
    let mut last = executor::execute(ctx).await?;
    let mut attempts = 1;

    for _ in 1..count {
        if last != executor::Outcome::Success {
            break;
        }
        tracing::info!(
            merchant = %ctx.merchant.id,
            wait_secs = ctx.merchant.burst_intra_gap,
            "Waiting before next purchase in burst"
        );
        if !sleep_or_cancel(&ctx.cancel, ctx.merchant.burst_intra_gap).await {
            return Err(ExecutorError::Cancelled);
        }
        last = executor::execute(ctx).await?;
        attempts += 1;
    }

    Ok((last, attempts))
}

/// Burst scheduling loop for one merchant. Returns when shutdown is
/// requested or the merchant is permanently halted.
pub async fn run(ctx: MerchantContext) {
    let id = ctx.merchant.id.clone();
    let mut suppress_logs = false;
    let mut burst_gap: Option<u64> = None;
    let mut skip_until = clock::local_from_unix(0);

    loop {
        if ctx.cancel.is_cancelled() {
            return;
        }

        let now = Local::now();
        let ledger = match ctx.ledger.load(now.year(), now.month()).await {
            Ok(ledger) => ledger,
            Err(e) => {
                tracing::error!(merchant = %id, error = %e, "Could not read ledger, retrying later");
                if !sleep_or_cancel(&ctx.cancel, ctx.merchant.burst_poll_gap).await {
                    return;
                }
                continue;
            }
        };

        let entry = ledger.get(&id);
        let cur_purchase_count = entry.map(|e| e.purchase_count).unwrap_or(0);
        let plan = plan_burst(&ctx.merchant, entry, now);
        let gap = *burst_gap
            .get_or_insert_with(|| burst_min_gap(&ctx.merchant, cur_purchase_count, now));

        if gate_open(&ctx.merchant, &plan, cur_purchase_count, gap, skip_until, now) {
            tracing::info!(merchant = %id, count = plan.count, "Bursting purchases");

            let (outcome, attempts) = match run_burst(&ctx, plan.count).await {
                Ok(result) => result,
                Err(ExecutorError::Cancelled) => return,
                Err(e) => {
                    tracing::error!(merchant = %id, error = %e, "Halting burst schedule");
                    return;
                }
            };

            let jitter = rand::thread_rng().gen_range(0..=ctx.merchant.burst_time_variance);
            let (next_gap, next_skip) = after_burst(
                &ctx.merchant,
                outcome,
                cur_purchase_count,
                attempts,
                jitter,
                skip_until,
                now,
            );
            if outcome == executor::Outcome::Skipped {
                tracing::info!(
                    merchant = %id,
                    until = %next_skip.format("%Y-%m-%d %I:%M%p"),
                    "Driver skipped, pausing this merchant"
                );
            }
            burst_gap = Some(next_gap);
            skip_until = next_skip;
            suppress_logs = false;
        } else if !suppress_logs {
            let next = next_burst_announcement(
                &ctx.merchant,
                cur_purchase_count,
                plan.prev_burst_time,
                gap,
                skip_until,
                now,
            );
            tracing::info!(
                merchant = %id,
                count = next.count,
                after = %next.at.format("%Y-%m-%d %I:%M%p"),
                "Next burst scheduled"
            );
            suppress_logs = true;
        } else if !sleep_or_cancel(&ctx.cancel, ctx.merchant.burst_poll_gap).await {
            return;
        }
    }
}

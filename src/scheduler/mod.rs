//! Purchase schedulers.
//!
//! One scheduler task per merchant, spawned at startup according to the
//! global mode. Burst groups purchases tightly and spaces the groups out;
//! spread distributes purchases individually across the month. Both are
//! plain loops over pure planning functions so every scheduling decision is
//! testable without a clock.

pub mod burst;
pub mod clock;
pub mod spread;

use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Sleep for `secs`, or return `false` early if shutdown is requested.
async fn sleep_or_cancel(cancel: &CancellationToken, secs: u64) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(Duration::from_secs(secs)) => true,
    }
}

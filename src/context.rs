//! Per-merchant execution context.
//!
//! Everything a merchant's scheduler and attempt executor need, assembled
//! once at startup and owned by that merchant's task. Shared resources
//! (ledger store, session pool) are behind their own synchronization; the
//! context itself is never shared between merchants.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::Merchant;
use crate::diagnostics::Diagnostics;
use crate::driver::{SessionPool, SiteDriver};
use crate::ledger::LedgerStore;
use crate::notify::Notifier;

pub struct MerchantContext {
    pub merchant: Merchant,
    /// Site driver resolved from the registry at startup.
    pub driver: Arc<dyn SiteDriver>,
    /// Ledger store shared with every other merchant task.
    pub ledger: Arc<LedgerStore>,
    /// Shared automation session pool; acquisition is exclusive.
    pub sessions: SessionPool,
    pub diagnostics: Diagnostics,
    pub notifier: Notifier,
    /// Global shutdown token; cancelling it aborts sleeps and driver calls.
    pub cancel: CancellationToken,
}

//! pacer: schedules small recurring card purchases against merchant sites.
//!
//! Startup loads and validates the config, prints the month's progress from
//! the ledger, resolves a site driver for every enabled merchant, then
//! spawns one scheduler task per merchant. Ctrl-C cancels every task at its
//! next suspension point.

mod amount;
mod config;
mod context;
mod diagnostics;
mod driver;
mod executor;
mod ledger;
mod notify;
mod scheduler;
mod update;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::{Datelike, Local};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::config::{Config, Mode};
use crate::context::MerchantContext;
use crate::diagnostics::Diagnostics;
use crate::driver::{DriverRegistry, SessionPool};
use crate::ledger::LedgerStore;
use crate::notify::Notifier;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.yml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    update::check().await;

    let ledger = Arc::new(LedgerStore::new(config.state_dir.clone()));
    log_month_summary(&ledger).await?;

    let registry = DriverRegistry::with_builtin();
    let mut drivers = Vec::with_capacity(config.merchants.len());
    for merchant in &config.merchants {
        match registry.get(&merchant.name) {
            Some(driver) => drivers.push(driver),
            None => bail!("no driver registered for merchant \"{}\"", merchant.name),
        }
    }

    let cancel = CancellationToken::new();
    let sessions = SessionPool::new();
    let notifier = Notifier::new(config.notify_failure.clone());
    let diagnostics = Diagnostics::new(config.failures_dir.clone());

    let mut tasks = Vec::with_capacity(config.merchants.len());
    for (merchant, driver) in config.merchants.iter().cloned().zip(drivers) {
        let ctx = MerchantContext {
            merchant,
            driver,
            ledger: Arc::clone(&ledger),
            sessions: sessions.clone(),
            diagnostics: diagnostics.clone(),
            notifier: notifier.clone(),
            cancel: cancel.clone(),
        };

        let task = match config.mode {
            Mode::Burst => tokio::spawn(scheduler::burst::run(ctx)),
            Mode::Spread => tokio::spawn(scheduler::spread::run(ctx)),
        };
        tasks.push(task);
    }

    let mut all_done = tokio::spawn(async move {
        for task in tasks {
            let _ = task.await;
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
            cancel.cancel();
            let _ = all_done.await;
        }
        _ = &mut all_done => {
            tracing::info!("All merchant schedules have ended");
        }
    }
    Ok(())
}

/// Print the current month's purchase counts from the ledger.
async fn log_month_summary(ledger: &LedgerStore) -> anyhow::Result<()> {
    let now = Local::now();
    let month = now.format("%B %Y");
    let state = ledger.load(now.year(), now.month()).await?;

    if state.is_empty() {
        tracing::info!("No purchases yet complete for {}", month);
        return Ok(());
    }

    for (merchant_id, entry) in &state {
        let plural = if entry.purchase_count == 1 { "" } else { "s" };
        tracing::info!(
            "{} {} purchase{} complete for {}",
            entry.purchase_count,
            merchant_id,
            plural,
            month
        );
    }
    Ok(())
}

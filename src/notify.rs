//! Terminal-failure notification delivery.
//!
//! When a merchant's scheduling halts permanently (retries exhausted or an
//! unverified purchase), a sanitized summary is POSTed to the configured
//! webhook so the user learns about it without tailing logs. Delivery
//! problems are logged and swallowed; notification is never allowed to
//! affect scheduling.

use serde_json::json;

/// Sends terminal-failure summaries to an optional webhook.
#[derive(Clone)]
pub struct Notifier {
    webhook_url: Option<String>,
    client: reqwest::Client,
}

impl Notifier {
    pub fn new(webhook_url: Option<String>) -> Self {
        Self {
            webhook_url,
            client: reqwest::Client::new(),
        }
    }

    /// Report that `merchant_id` will not be scheduled again this run.
    ///
    /// `reason` must already be free of credentials; only identifiers and
    /// human-readable explanations belong in it.
    pub async fn notify_terminal_failure(&self, merchant_id: &str, reason: &str) {
        let Some(url) = &self.webhook_url else {
            return;
        };

        let payload = json!({
            "merchant": merchant_id,
            "reason": reason,
            "recovery": "Scheduling state is reconstructed from the ledger; stop and re-run pacer to try this merchant again.",
        });

        match self.client.post(url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {
                tracing::info!(merchant = %merchant_id, "Sent failure notification");
            }
            Ok(response) => {
                tracing::warn!(
                    merchant = %merchant_id,
                    status = %response.status(),
                    "Failure notification was not accepted"
                );
            }
            Err(e) => {
                tracing::warn!(merchant = %merchant_id, error = %e, "Unable to send failure notification");
            }
        }
    }
}

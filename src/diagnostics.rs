//! Diagnostic capture for failed or unverified purchase attempts.
//!
//! Each capture writes a timestamped bundle to the failures directory:
//! `{prefix}.txt` (version, OS, error text), `{prefix}.png` (screenshot, if
//! the driver took one), and `{prefix}.html` (page markup). Credentials and
//! the card number are replaced with fixed markers before any markup is
//! written, so nothing sharable ever contains them.
//!
//! Capture is best-effort: a failure to persist diagnostics is logged and
//! never interferes with the retry/fatal handling that triggered it.

use std::path::PathBuf;

use chrono::Local;

use crate::config::Merchant;
use crate::driver::DriverSession;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Writes failure bundles under a dedicated directory.
#[derive(Clone)]
pub struct Diagnostics {
    dir: PathBuf,
}

impl Diagnostics {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Persist a failure bundle for one attempt.
    pub async fn capture(&self, merchant: &Merchant, error_text: &str, session: &DriverSession) {
        if let Err(e) = self.try_capture(merchant, error_text, session).await {
            tracing::error!(merchant = %merchant.id, error = %e, "Failed to write failure diagnostics");
        }
    }

    async fn try_capture(
        &self,
        merchant: &Merchant,
        error_text: &str,
        session: &DriverSession,
    ) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let prefix = format!(
            "{}_{}",
            Local::now().format("%Y-%m-%d_%H-%M-%S-%f"),
            merchant.name
        );

        let info_and_error = format!("{} {} {}", VERSION, std::env::consts::OS, error_text);
        tokio::fs::write(self.dir.join(format!("{}.txt", prefix)), info_and_error).await?;

        if let Some(png) = &session.screenshot_png {
            tokio::fs::write(self.dir.join(format!("{}.png", prefix)), png).await?;
        }

        if let Some(html) = &session.page_html {
            let scrubbed = scrub_sensitive_data(html, merchant);
            tokio::fs::write(self.dir.join(format!("{}.html", prefix)), scrubbed).await?;
        }

        tracing::info!(merchant = %merchant.id, prefix = %prefix, "Wrote failure diagnostics");
        Ok(())
    }
}

/// Replace every occurrence of the merchant's username, password, full card
/// number, and card last-4 with fixed redaction markers.
pub fn scrub_sensitive_data(data: &str, merchant: &Merchant) -> String {
    data.replace(&merchant.usr, "***usr***")
        .replace(&merchant.psw, "***psw***")
        .replace(&merchant.card, "***card***")
        .replace(merchant.card_last4(), "***card***")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::SessionPool;

    fn merchant() -> Merchant {
        Merchant {
            id: "card_shop".to_string(),
            name: "shop".to_string(),
            total_purchases: 5,
            amount_min: 20,
            amount_max: 50,
            min_day: 2,
            max_day: None,
            burst_count: 1,
            burst_min_gap: None,
            burst_time_variance: 14_400,
            burst_intra_gap: 30,
            burst_poll_gap: 300,
            spread_min_gap: 14_400,
            spread_time_variance: 14_400,
            usr: "someone@example.com".to_string(),
            psw: "s3cretpw".to_string(),
            card: "4111222233334444".to_string(),
        }
    }

    #[test]
    fn scrub_removes_credentials_and_card() {
        let m = merchant();
        let page = "login someone@example.com pass s3cretpw card 4111222233334444 ending in 4444";
        let scrubbed = scrub_sensitive_data(page, &m);
        assert!(!scrubbed.contains("someone@example.com"));
        assert!(!scrubbed.contains("s3cretpw"));
        assert!(!scrubbed.contains("4111222233334444"));
        assert!(!scrubbed.contains("4444"));
        assert!(scrubbed.contains("***usr***"));
        assert!(scrubbed.contains("***psw***"));
        assert!(scrubbed.contains("***card***"));
    }

    #[tokio::test]
    async fn capture_writes_scrubbed_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let diagnostics = Diagnostics::new(dir.path());
        let pool = SessionPool::new();
        let mut session = pool.acquire().await;
        session.page_html = Some("<p>welcome someone@example.com, card 4444</p>".to_string());
        session.screenshot_png = Some(vec![0x89, 0x50, 0x4e, 0x47]);

        diagnostics.capture(&merchant(), "boom", &session).await;

        let mut txt = None;
        let mut png = None;
        let mut html = None;
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            let path = entry.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some("txt") => txt = Some(tokio::fs::read_to_string(&path).await.unwrap()),
                Some("png") => png = Some(tokio::fs::read(&path).await.unwrap()),
                Some("html") => html = Some(tokio::fs::read_to_string(&path).await.unwrap()),
                _ => {}
            }
        }

        assert!(txt.unwrap().contains("boom"));
        assert_eq!(png.unwrap(), vec![0x89, 0x50, 0x4e, 0x47]);
        let html = html.unwrap();
        assert!(!html.contains("someone@example.com"));
        assert!(!html.contains("4444"));
    }
}

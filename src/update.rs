//! Release update check.
//!
//! Fetches the published release counter once at startup and, when it is
//! ahead of this build, pulls the changelog entries in between and logs
//! them. Purely informational: any network or parse problem downgrades to a
//! single warning and the program carries on.

use std::time::Duration;

/// Monotonic release counter for this build. Bumped on every release,
/// independent of the semver string.
pub const VERSION_INT: u32 = 4;

const RELEASES_URL: &str = "https://pacer-releases.example.com";
const UPDATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Log whether a newer release exists, with its changelog when available.
pub async fn check() {
    let client = match reqwest::Client::builder().timeout(UPDATE_TIMEOUT).build() {
        Ok(client) => client,
        Err(e) => {
            tracing::warn!(error = %e, "Unable to check for updates");
            return;
        }
    };

    let latest = match fetch_latest(&client).await {
        Ok(latest) => latest,
        Err(e) => {
            tracing::warn!(error = %e, "Unable to check for updates");
            return;
        }
    };

    if VERSION_INT >= latest {
        return;
    }

    let mut changelog = String::from("Update available! Download the latest release.");
    for release in VERSION_INT + 1..=latest {
        match fetch_changelog(&client, release).await {
            Ok(notes) => {
                changelog.push('\n');
                changelog.push_str(notes.trim_end());
            }
            // Partial changelogs are still worth printing.
            Err(_) => break,
        }
    }

    tracing::info!(latest, current = VERSION_INT, "{}", changelog);
}

async fn fetch_latest(client: &reqwest::Client) -> Result<u32, anyhow::Error> {
    let body = client
        .get(format!("{}/latest.txt", RELEASES_URL))
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;
    Ok(body.trim().parse()?)
}

async fn fetch_changelog(client: &reqwest::Client, release: u32) -> Result<String, anyhow::Error> {
    Ok(client
        .get(format!("{}/changelogs/{}.txt", RELEASES_URL, release))
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?)
}

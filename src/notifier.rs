//! Media-server library refresh
//!
//! A best-effort HTTP call asking the media server to rescan one library
//! section. Failures are logged and swallowed: by the time the notifier
//! runs, the archive has already been materialized, and a missed rescan is
//! recoverable while a re-queued archive is not.

use crate::config::PlexConfig;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Request timeout for refresh calls.
const REFRESH_TIMEOUT: Duration = Duration::from_secs(10);

/// Best-effort notifier towards a Plex-style media server
pub struct LibraryNotifier {
    client: reqwest::Client,
    config: Option<PlexConfig>,
}

impl LibraryNotifier {
    /// Build a notifier; a `None` config disables it entirely.
    pub fn new(config: Option<PlexConfig>) -> Self {
        if config.is_none() {
            info!("no [plex] configuration, library refresh disabled");
        }
        let client = reqwest::Client::builder()
            .timeout(REFRESH_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { client, config }
    }

    /// Whether refresh calls will actually be issued.
    pub fn enabled(&self) -> bool {
        self.config.is_some()
    }

    /// Ask the media server to rescan `library_id`.
    ///
    /// Returns whether a refresh was issued and accepted; never propagates
    /// an error to the caller.
    pub async fn refresh_section(&self, library_id: &str) -> bool {
        let Some(config) = &self.config else {
            debug!(library_id, "refresh skipped, notifier disabled");
            return false;
        };

        let url = refresh_url(&config.host, library_id);
        let result = self
            .client
            .get(&url)
            .query(&[("X-Plex-Token", config.token.as_str())])
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                info!(library_id, "triggered library refresh");
                true
            }
            Ok(response) => {
                warn!(
                    library_id,
                    status = %response.status(),
                    "library refresh rejected"
                );
                false
            }
            Err(e) => {
                warn!(library_id, error = %e, "library refresh failed");
                false
            }
        }
    }
}

/// Refresh endpoint for a library section.
fn refresh_url(host: &str, library_id: &str) -> String {
    format!(
        "{}/library/sections/{}/refresh",
        host.trim_end_matches('/'),
        library_id
    )
}

//! Reaction fan-out for positive matches.
//!
//! A worker that finds matches hands the event here. The sequence is fixed:
//! optional AI triage, optional Discord notification, then every registered
//! plugin's `on_detected`. Each step's failure is a warning and never stops
//! the steps after it — a dead webhook must not prevent a tenant suspension.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::config::Config;
use crate::integrations::{ai, discord};
use crate::plugins::PluginSet;
use crate::scanner::Match;

/// Outbound HTTP budget shared by all integrations.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Owns the reaction sequence and the shared HTTP client.
pub struct Reactor {
    config: Arc<Config>,
    http: reqwest::Client,
    plugins: PluginSet,
}

impl Reactor {
    pub fn new(config: Arc<Config>, plugins: PluginSet) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            config,
            http,
            plugins,
        })
    }

    pub fn plugin_count(&self) -> usize {
        self.plugins.len()
    }

    /// Run the full reaction sequence for one detection.
    pub async fn on_match(&self, path: &Path, matches: &[Match], content: &[u8]) {
        let triage = if self.config.integration.ai.enabled {
            match ai::analyze(&self.http, &self.config.integration.ai, content).await {
                Ok(triage) => {
                    debug!(path = %path.display(), score = triage.score, "AI triage complete");
                    Some(triage)
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "AI analysis failed");
                    Some(ai::Triage::failed())
                }
            }
        } else {
            None
        };

        if self.config.integration.discord.enabled {
            let description = triage.as_ref().map(|t| t.description()).unwrap_or("");
            if let Err(e) = discord::send_alert(
                &self.http,
                &self.config.integration.discord,
                &self.config.machine_id,
                path,
                matches,
                description,
            )
            .await
            {
                warn!(path = %path.display(), error = %e, "discord webhook failed");
            }
        }

        for plugin in self.plugins.iter() {
            if let Err(e) = plugin.on_detected(path, matches).await {
                warn!(
                    plugin = plugin.name(),
                    path = %path.display(),
                    error = %e,
                    "plugin failed"
                );
            }
        }
    }
}

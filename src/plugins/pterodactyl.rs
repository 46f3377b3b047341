//! Pterodactyl auto-suspend remediator.
//!
//! Tenant volumes live under `/var/lib/pterodactyl/volumes/<uuid>/...`, so a
//! flagged path carries the server UUID as one of its components. On
//! detection the plugin resolves the UUID to a server id through the panel's
//! application API and issues a suspend. A UUID that resolves to nothing is
//! not an error — the volume may belong to a deleted server.

use std::path::{Component, Path};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tracing::{info, warn};

use crate::config::Config;
use crate::reaction::HTTP_TIMEOUT;
use crate::scanner::Match;

use super::Plugin;

/// Config table name under `[plugins]`.
pub const TABLE: &str = "pterodactyl_auto_suspend";

/// Lowercase hex UUID, matched against whole path components.
const UUID_PATTERN: &str =
    "^[a-f0-9]{8}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{12}$";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PterodactylConfig {
    pub hostname: String,
    pub api_key: String,
}

pub struct PterodactylAutoSuspend {
    http: reqwest::Client,
    uuid_re: Regex,
    config: PterodactylConfig,
}

impl PterodactylAutoSuspend {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            uuid_re: Regex::new(UUID_PATTERN).expect("UUID pattern is valid"),
            config: PterodactylConfig::default(),
        })
    }

    /// Find the server UUID component in a flagged path.
    ///
    /// The UUID names the volume directory, so it must be followed by at
    /// least one more component — a path ending at the UUID itself is the
    /// volume root, not a file inside it.
    fn extract_uuid(&self, path: &Path) -> Option<String> {
        let parts: Vec<&str> = path
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => s.to_str(),
                _ => None,
            })
            .collect();
        for (i, part) in parts.iter().enumerate() {
            if self.uuid_re.is_match(part) && i + 1 < parts.len() {
                return Some((*part).to_string());
            }
        }
        None
    }

    fn api_base(&self) -> &str {
        self.config.hostname.trim_end_matches('/')
    }

    /// Resolve a volume UUID to a panel server id. `Ok(None)` means the
    /// panel knows nothing about it.
    async fn lookup_server_id(&self, uuid: &str) -> Result<Option<u64>> {
        let url = format!(
            "{}/api/application/servers?filter[uuid]={}",
            self.api_base(),
            uuid
        );
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.config.api_key)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            bail!("panel API returned status {}", resp.status().as_u16());
        }

        let body: serde_json::Value = resp.json().await?;
        Ok(body["data"][0]["attributes"]["id"].as_u64())
    }

    async fn suspend_server(&self, server_id: u64) -> Result<()> {
        let url = format!(
            "{}/api/application/servers/{}/suspend",
            self.api_base(),
            server_id
        );
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .send()
            .await?;

        if resp.status() != reqwest::StatusCode::NO_CONTENT {
            bail!("suspend API returned status {}", resp.status().as_u16());
        }
        info!(server_id, "suspended server");
        Ok(())
    }
}

#[async_trait]
impl Plugin for PterodactylAutoSuspend {
    fn name(&self) -> &str {
        "Pterodactyl Auto Suspend"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    async fn on_start(&mut self, config: &Config) -> Result<()> {
        let table = config
            .plugin_table(TABLE)
            .with_context(|| format!("missing [plugins.{}] config section", TABLE))?;
        self.config = table
            .clone()
            .try_into()
            .with_context(|| format!("malformed [plugins.{}] config section", TABLE))?;
        if self.config.hostname.is_empty() {
            bail!("[plugins.{}] hostname must not be empty", TABLE);
        }
        info!("Pterodactyl Auto Suspend plugin started");
        Ok(())
    }

    async fn on_detected(&self, path: &Path, _matches: &[Match]) -> Result<()> {
        let Some(uuid) = self.extract_uuid(path) else {
            return Ok(());
        };

        match self.lookup_server_id(&uuid).await? {
            Some(server_id) => self.suspend_server(server_id).await,
            None => {
                warn!(uuid = %uuid, "no server found for volume UUID");
                Ok(())
            }
        }
    }
}

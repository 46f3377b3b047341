//! Configuration loading and serialization.
//!
//! Defines the TOML configuration schema for Sentinel. The root [`Config`]
//! struct carries the log-activity flags, the detection section (watch roots,
//! ignore globs, signature path, size cap), the integration sections (AI
//! triage, Discord webhook) and opaque per-plugin tables.
//!
//! All sections implement `Default` and `serde::Deserialize` with
//! `#[serde(default)]` so missing keys gracefully fall back. Config is loaded
//! from `/etc/sentinel/config.toml` by default; the `SENTINEL_CONFIG`
//! environment variable overrides the path. A missing file is created from
//! [`DEFAULT_CONFIG`] so a first-time install starts with a documented
//! template.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const APP_NAME: &str = "Sentinel";
pub const COMPANY: &str = "Novel";

/// Default config template written on first start.
pub const DEFAULT_CONFIG: &str = r#"# Sentinel Configuration by Novel
version = "1.0.0"
machine_id = "node1"

[logs]
process_start_msg = true
flagged_noti = true
file_modified = false
file_deleted = false
file_moved = false
file_created = false

[detection]
# Multiple roots can be monitored simultaneously
watch_paths = [
    "/var/lib/pterodactyl/volumes",
    # "/var/www/html",
]
signature_path = "/etc/sentinel/signatures"
ignore_paths = ["/etc/sentinel/signatures"]
ignore_files = ["config.toml"]
max_file_size_mb = 100

[integration.ai]
enabled = false
model = "llama3"
endpoints = ["http://localhost:11434/api/generate"]
auth_token = ""
prompt = "Analyze the given code and return an abuse score (0-10) with a brief reason. Example abuses: Crypto Mining, Shell Access, Nezha Proxy (VPN/Proxy usage), Disk Filling, Tor, DDoS, Abusive Resource Usage. Response format: '**5/10** <your reason>'. No extra messages."

[integration.discord]
enabled = false
webhook_url = "https://discord.com/api/webhooks/YOUR_WEBHOOK_ID/YOUR_WEBHOOK_TOKEN"
truncate_text = true

[plugins.pterodactyl_auto_suspend]
hostname = "https://panel.example.com"
api_key = "ptla_"
"#;

/// Root configuration struct, deserialized from TOML.
///
/// All sections use `#[serde(default)]` so a partial file still loads.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_machine_id")]
    pub machine_id: String,
    #[serde(default)]
    pub logs: LogsConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub integration: IntegrationConfig,
    /// Opaque per-plugin tables; each plugin parses its own section.
    #[serde(default)]
    pub plugins: HashMap<String, toml::Value>,
}

fn default_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_machine_id() -> String {
    "node1".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            machine_id: default_machine_id(),
            logs: LogsConfig::default(),
            detection: DetectionConfig::default(),
            integration: IntegrationConfig::default(),
            plugins: HashMap::new(),
        }
    }
}

/// Which steady-state events get logged beyond detections.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct LogsConfig {
    pub process_start_msg: bool,
    pub flagged_noti: bool,
    pub file_modified: bool,
    pub file_deleted: bool,
    pub file_moved: bool,
    pub file_created: bool,
}

/// Watch roots, ignore globs, signature location and the content size cap.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct DetectionConfig {
    /// Directory subtrees observed for changes.
    pub watch_paths: Vec<String>,
    /// File or directory of `.yar`/`.yara` rule sources.
    pub signature_path: String,
    /// Full-path globs never subscribed or processed.
    pub ignore_paths: Vec<String>,
    /// Basename globs whose events are dropped.
    pub ignore_files: Vec<String>,
    /// Files larger than this never reach the scanner.
    pub max_file_size_mb: u64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            watch_paths: vec!["/var/lib/pterodactyl/volumes".to_string()],
            signature_path: "/etc/sentinel/signatures".to_string(),
            ignore_paths: Vec::new(),
            ignore_files: Vec::new(),
            max_file_size_mb: 100,
        }
    }
}

impl DetectionConfig {
    /// Content size cap in bytes.
    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb * 1024 * 1024
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct IntegrationConfig {
    pub ai: AiConfig,
    pub discord: DiscordConfig,
}

/// LLM triage configuration.
///
/// Endpoints are tried in order until one answers 200. A URL containing
/// `/chat/completions` gets the chat-completion request shape; anything else
/// gets the generate shape.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct AiConfig {
    pub enabled: bool,
    pub model: String,
    pub endpoints: Vec<String>,
    /// Bearer token sent to chat-completion endpoints when non-empty.
    pub auth_token: String,
    pub prompt: String,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            model: "llama3".to_string(),
            endpoints: Vec::new(),
            auth_token: String::new(),
            prompt: "Analyze the given code and return an abuse score (0-10) with a brief reason. \
                     Response format: '**5/10** <your reason>'. No extra messages."
                .to_string(),
        }
    }
}

/// Discord webhook alert sink.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct DiscordConfig {
    pub enabled: bool,
    pub webhook_url: String,
    pub truncate_text: bool,
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            webhook_url: String::new(),
            truncate_text: true,
        }
    }
}

impl Config {
    /// Load the config from `path`, creating a default template first if the
    /// file does not exist. Malformed TOML is a hard error.
    pub fn load(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create config directory {}", dir.display()))?;
        }

        if !path.exists() {
            std::fs::write(path, DEFAULT_CONFIG)
                .with_context(|| format!("failed to write default config to {}", path.display()))?;
            tracing::info!(path = %path.display(), "created default config");
        }

        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let mut config: Config = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?;

        // The daemon is useless with nothing to watch.
        if config.detection.watch_paths.is_empty() {
            config.detection.watch_paths = DetectionConfig::default().watch_paths;
        }

        Ok(config)
    }

    /// Per-plugin table lookup, e.g. `[plugins.pterodactyl_auto_suspend]`.
    pub fn plugin_table(&self, name: &str) -> Option<&toml::Value> {
        self.plugins.get(name)
    }
}

/// Default config path, overridable via `SENTINEL_CONFIG`.
pub fn default_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("SENTINEL_CONFIG") {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }
    PathBuf::from("/etc/sentinel/config.toml")
}

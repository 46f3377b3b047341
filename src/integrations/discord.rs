//! Discord webhook alert delivery.
//!
//! A detection becomes one embed: the machine id leads the field list, every
//! match contributes an inline `rule → tags` field, the flagged path rides in
//! the author line and the triage text in the description. When the flagged
//! file still exists and is small enough it is attached via multipart form so
//! the responder can pull the sample straight from the channel.

use std::path::Path;

use anyhow::{bail, Result};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::DiscordConfig;
use crate::scanner::Match;

/// Discord rejects embed descriptions beyond this.
pub const MAX_DESCRIPTION_CHARS: usize = 4096;
/// Attachment cap: larger samples are alerted without the file.
pub const MAX_ATTACHMENT_BYTES: u64 = 10 * 1024 * 1024;

const ALERT_COLOR: u32 = 65280;

#[derive(Debug, Serialize)]
pub struct Webhook {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub embeds: Vec<Embed>,
}

#[derive(Debug, Serialize)]
pub struct Embed {
    pub title: String,
    pub description: String,
    pub color: u32,
    pub fields: Vec<Field>,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<Author>,
}

#[derive(Debug, Serialize)]
pub struct Author {
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct Field {
    pub name: String,
    pub value: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub inline: bool,
}

/// Char-safe truncation with a trailing ellipsis.
fn truncate_description(description: &str, limit: usize) -> String {
    if description.chars().count() <= limit {
        return description.to_string();
    }
    let mut out: String = description.chars().take(limit.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

/// Assemble the alert embed for a detection.
pub(crate) fn build_embed(
    cfg: &DiscordConfig,
    machine_id: &str,
    path: &Path,
    matches: &[Match],
    description: &str,
) -> Embed {
    let mut fields = vec![Field {
        name: "Machine ID".to_string(),
        value: machine_id.to_string(),
        inline: true,
    }];
    for m in matches {
        fields.push(Field {
            name: m.rule.clone(),
            value: m.tags.clone(),
            inline: true,
        });
    }

    let description = if cfg.truncate_text {
        truncate_description(description, MAX_DESCRIPTION_CHARS)
    } else {
        description.to_string()
    };

    Embed {
        title: format!("Sentinel Detection Alert - {}", machine_id),
        description,
        color: ALERT_COLOR,
        fields,
        timestamp: chrono::Utc::now().to_rfc3339(),
        author: Some(Author {
            name: path.display().to_string(),
        }),
    }
}

/// Post a detection alert to the configured webhook.
///
/// Attaches the flagged file when it exists and is under the attachment cap;
/// otherwise sends a plain JSON payload. 200 and 204 both count as delivered.
pub async fn send_alert(
    http: &reqwest::Client,
    cfg: &DiscordConfig,
    machine_id: &str,
    path: &Path,
    matches: &[Match],
    description: &str,
) -> Result<()> {
    if !cfg.enabled {
        return Ok(());
    }

    let webhook = Webhook {
        content: None,
        embeds: vec![build_embed(cfg, machine_id, path, matches, description)],
    };
    let payload = serde_json::to_string(&webhook)?;

    let attach = std::fs::metadata(path)
        .map(|m| m.is_file() && m.len() < MAX_ATTACHMENT_BYTES)
        .unwrap_or(false);

    let resp = if attach {
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                let filename = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| "sample".to_string());
                let form = reqwest::multipart::Form::new()
                    .text("payload_json", payload)
                    .part(
                        "file",
                        reqwest::multipart::Part::bytes(bytes).file_name(filename),
                    );
                http.post(&cfg.webhook_url).multipart(form).send().await?
            }
            Err(e) => {
                // File vanished between the stat and the read; alert without it.
                debug!(path = %path.display(), error = %e, "attachment read failed");
                http.post(&cfg.webhook_url)
                    .header(reqwest::header::CONTENT_TYPE, "application/json")
                    .body(payload)
                    .send()
                    .await?
            }
        }
    } else {
        http.post(&cfg.webhook_url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(payload)
            .send()
            .await?
    };

    let status = resp.status();
    if status != reqwest::StatusCode::OK && status != reqwest::StatusCode::NO_CONTENT {
        bail!("discord webhook failed with status {}", status.as_u16());
    }

    info!("discord webhook sent");
    Ok(())
}

//! LLM triage of flagged file content.
//!
//! Each configured endpoint is tried in order until one answers 200. Two
//! request shapes are supported, chosen by URL: endpoints containing
//! `/chat/completions` get an OpenAI-style chat body (with a Bearer token
//! when configured), everything else gets an Ollama-style generate body.
//!
//! The model is asked to answer in the `**N/10** <reason>` convention; the
//! parser extracts the score between the first pair of `**` markers and
//! treats the rest as the reason. Anything that does not fit the convention
//! scores 0 with the raw response preserved.

use anyhow::{bail, Context, Result};
use tracing::warn;

use crate::config::AiConfig;

/// Outcome of a triage call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Triage {
    /// Abuse score 0-10; 0 when the response did not parse.
    pub score: i32,
    pub reason: String,
    /// Raw response text.
    pub content: String,
}

impl Triage {
    /// Placeholder when every endpoint failed.
    pub fn failed() -> Self {
        Self {
            score: 0,
            reason: "AI analysis failed".to_string(),
            content: String::new(),
        }
    }

    /// Best text to show a human: the parsed reason, or the raw response.
    pub fn description(&self) -> &str {
        if self.reason.is_empty() {
            &self.content
        } else {
            &self.reason
        }
    }
}

/// Run triage against the configured endpoints, first 200 wins.
pub async fn analyze(http: &reqwest::Client, cfg: &AiConfig, content: &[u8]) -> Result<Triage> {
    let content = String::from_utf8_lossy(content);
    let prompt = format!("{}\n\n{}", cfg.prompt, content);

    for endpoint in &cfg.endpoints {
        match call_endpoint(http, cfg, endpoint, &prompt).await {
            Ok(text) => return Ok(parse_triage(&text)),
            Err(e) => {
                warn!(endpoint = %endpoint, error = %e, "AI endpoint failed, trying next");
            }
        }
    }

    bail!("all AI endpoints failed")
}

fn is_chat_endpoint(url: &str) -> bool {
    url.contains("/chat/completions")
}

async fn call_endpoint(
    http: &reqwest::Client,
    cfg: &AiConfig,
    endpoint: &str,
    prompt: &str,
) -> Result<String> {
    let chat = is_chat_endpoint(endpoint);
    let request = if chat {
        let body = serde_json::json!({
            "model": cfg.model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": 0.1,
            "max_tokens": 512,
        });
        let mut req = http.post(endpoint).json(&body);
        if !cfg.auth_token.is_empty() {
            req = req.bearer_auth(&cfg.auth_token);
        }
        req
    } else {
        http.post(endpoint).json(&serde_json::json!({
            "model": cfg.model,
            "prompt": prompt,
            "stream": false,
        }))
    };

    let resp = request.send().await?;
    let status = resp.status();
    let body = resp.text().await?;
    if status != reqwest::StatusCode::OK {
        bail!("AI API returned status {}: {}", status.as_u16(), body);
    }

    extract_content(chat, &body)
}

/// Pull the response text out of the endpoint-specific JSON envelope.
fn extract_content(chat: bool, body: &str) -> Result<String> {
    let value: serde_json::Value =
        serde_json::from_str(body).context("failed to parse AI response JSON")?;
    let content = if chat {
        value["choices"][0]["message"]["content"]
            .as_str()
            .context("no content in chat response")?
            .to_string()
    } else {
        value["response"].as_str().unwrap_or_default().to_string()
    };
    Ok(content)
}

/// Parse the `**N/10** <reason>` convention.
pub(crate) fn parse_triage(text: &str) -> Triage {
    if text.is_empty() {
        return Triage {
            score: 0,
            reason: String::new(),
            content: "No content in AI response".to_string(),
        };
    }

    let parts: Vec<&str> = text.splitn(3, "**").collect();
    if parts.len() < 3 {
        return Triage {
            score: 0,
            reason: String::new(),
            content: text.to_string(),
        };
    }

    let score_part = parts[1].trim();
    let score_part = score_part.strip_suffix("/10").unwrap_or(score_part).trim();
    let score = match score_part.parse::<i32>() {
        Ok(n) => n,
        Err(_) => {
            warn!(score = %score_part, "failed to parse abuse score");
            0
        }
    };

    Triage {
        score,
        reason: parts[2].trim().to_string(),
        content: text.to_string(),
    }
}

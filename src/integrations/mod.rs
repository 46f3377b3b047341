//! Outbound integrations: LLM triage and the Discord alert webhook.

pub mod ai;
pub mod discord;

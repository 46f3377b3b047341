//! Remediation plugin contract and registry.
//!
//! Plugins declare a name, a version, and hooks invoked by the pipeline.
//! The registry is assembled by [`PluginSetBuilder`] during startup and then
//! frozen: the resulting [`PluginSet`] is immutable and handed to the reaction
//! fan-out, so nothing registers (or mutates) plugins after the worker pool
//! starts.
//!
//! `on_start` runs once per plugin before any worker runs; a failure there
//! aborts startup. `on_detected` errors are isolated per plugin by the caller.

pub mod pterodactyl;

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::info;

use crate::config::Config;
use crate::scanner::Match;
use crate::watcher::FileOp;

/// A remediation hook set invoked around the scanning pipeline.
///
/// Implementations must be `Send + Sync`; a [`PluginSet`] is shared across
/// all worker tasks.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Human-readable plugin name.
    fn name(&self) -> &str;

    /// Plugin version string.
    fn version(&self) -> &str;

    /// Runs once before the worker pool starts. An error here is fatal to
    /// daemon startup.
    async fn on_start(&mut self, config: &Config) -> Result<()>;

    /// Invoked for every file with a non-empty match list.
    async fn on_detected(&self, path: &Path, matches: &[Match]) -> Result<()>;

    /// Reserved per-scan hook; declared for plugins that want visibility into
    /// clean scans, not currently driven by the pipeline.
    async fn on_scan(&self, _path: &Path, _content: &[u8], _op: FileOp) -> Result<()> {
        Ok(())
    }
}

/// Collects plugins during startup, then starts them all at once.
#[derive(Default)]
pub struct PluginSetBuilder {
    plugins: Vec<Box<dyn Plugin>>,
}

impl PluginSetBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, plugin: Box<dyn Plugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// Run every plugin's `on_start` and freeze the set.
    pub async fn build(self, config: &Config) -> Result<PluginSet> {
        let mut plugins = self.plugins;
        for plugin in &mut plugins {
            plugin
                .on_start(config)
                .await
                .with_context(|| format!("plugin {} failed to start", plugin.name()))?;
            info!(plugin = plugin.name(), version = plugin.version(), "plugin started");
        }
        Ok(PluginSet { plugins })
    }
}

/// Immutable, started set of plugins shared by the reaction fan-out.
pub struct PluginSet {
    plugins: Vec<Box<dyn Plugin>>,
}

impl PluginSet {
    /// A set with no plugins (detections still alert, nothing remediates).
    pub fn empty() -> Self {
        Self { plugins: Vec::new() }
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn Plugin> {
        self.plugins.iter().map(|p| p.as_ref())
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

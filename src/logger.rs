//! Log initialization.
//!
//! Installs the global `tracing` subscriber. The level comes from the
//! `--log-level` flag; daemon mode appends to a log file instead of stderr.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::filter::LevelFilter;

/// Map a `--log-level` string onto a tracing level filter.
/// Unrecognized values fall back to `info`.
pub fn level_filter(level: &str) -> LevelFilter {
    match level {
        "debug" => LevelFilter::DEBUG,
        "warn" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        _ => LevelFilter::INFO,
    }
}

/// Install the global subscriber writing to stderr.
pub fn init(level: &str) {
    tracing_subscriber::fmt()
        .with_max_level(level_filter(level))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Install the global subscriber appending to `path` (daemon mode).
/// Creates the parent directory if needed.
pub fn init_with_file(level: &str, path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create log directory {}", dir.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))?;

    tracing_subscriber::fmt()
        .with_max_level(level_filter(level))
        .with_target(false)
        .with_ansi(false)
        .with_writer(Arc::new(file))
        .init();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_filter_known_levels() {
        assert_eq!(level_filter("debug"), LevelFilter::DEBUG);
        assert_eq!(level_filter("info"), LevelFilter::INFO);
        assert_eq!(level_filter("warn"), LevelFilter::WARN);
        assert_eq!(level_filter("error"), LevelFilter::ERROR);
    }

    #[test]
    fn test_level_filter_unknown_defaults_to_info() {
        assert_eq!(level_filter("verbose"), LevelFilter::INFO);
        assert_eq!(level_filter(""), LevelFilter::INFO);
    }
}

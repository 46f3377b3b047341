//! Short-horizon deduplication of dispatched file events.
//!
//! A burst of filesystem events for one path should cost one scan, not ten.
//! Workers consult the cache on every dispatched event: inside the window the
//! event is dropped, outside it the entry is refreshed and processing
//! proceeds. Lookup-and-insert happens under one lock so two workers racing
//! on the same path cannot both win.
//!
//! The cache is process-local and lost on restart; a background sweeper keeps
//! it from growing without bound.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Suppression window for repeated events on one path.
pub const DEDUP_WINDOW: Duration = Duration::from_secs(5);
/// Entries older than this are removed by the sweeper.
pub const CACHE_TTL: Duration = Duration::from_secs(600);
/// How often the sweeper runs.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Path → last-dispatch-time map with atomic test-and-set semantics.
pub struct DedupCache {
    entries: Mutex<HashMap<PathBuf, Instant>>,
    window: Duration,
    ttl: Duration,
}

impl DedupCache {
    pub fn new() -> Self {
        Self::with_limits(DEDUP_WINDOW, CACHE_TTL)
    }

    pub fn with_limits(window: Duration, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            window,
            ttl,
        }
    }

    /// Returns true if the path should be processed, marking it dispatched.
    /// Returns false if a dispatch for the same path is younger than the
    /// window.
    pub fn check_and_mark(&self, path: &Path) -> bool {
        self.check_and_mark_at(path, Instant::now())
    }

    /// Clock-injected variant of [`check_and_mark`](Self::check_and_mark).
    pub fn check_and_mark_at(&self, path: &Path, now: Instant) -> bool {
        let mut entries = self.entries.lock();
        if let Some(last) = entries.get(path) {
            if now.saturating_duration_since(*last) < self.window {
                return false;
            }
        }
        entries.insert(path.to_path_buf(), now);
        true
    }

    /// Drop entries older than the TTL.
    pub fn sweep(&self) {
        self.sweep_at(Instant::now());
    }

    /// Clock-injected variant of [`sweep`](Self::sweep).
    pub fn sweep_at(&self, now: Instant) {
        self.entries
            .lock()
            .retain(|_, last| now.saturating_duration_since(*last) <= self.ttl);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new()
    }
}

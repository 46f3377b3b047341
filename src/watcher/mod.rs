//! Event-driven scanning pipeline.
//!
//! The filesystem observer streams raw change events into the batcher, which
//! coalesces them on a one-second tick, applies the ignore globs, reads file
//! content (bounded by the size cap) and offers `FileEvent`s to a bounded
//! work queue. A fixed pool of workers consumes the queue: each event passes
//! the dedup gate, gets scanned, and on a positive match drives the reaction
//! fan-out.
//!
//! Backpressure is lossy by design: a full queue drops the event with a
//! warning. Detection is best-effort; the daemon's liveness outranks any
//! individual file.
//!
//! Shutdown: one `watch` signal reaches the batcher, the sweeper and (via
//! queue closure) the workers. The observer is dropped first so no new events
//! arrive, the batcher flushes its pending buffer and exits — closing the
//! queue exactly once — and workers drain what remains under a five-second
//! budget before being aborted.

pub mod dedup;
pub mod tuning;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::{Config, DetectionConfig};
use crate::reaction::Reactor;
use crate::scanner::Scanner;

use dedup::{DedupCache, SWEEP_INTERVAL};
use tuning::Tuning;

/// Coalescing interval for raw filesystem events.
pub const BATCH_TICK: Duration = Duration::from_secs(1);
/// Overall shutdown budget; stragglers are abandoned past this.
pub const SHUTDOWN_BUDGET: Duration = Duration::from_secs(5);

/// Filesystem operation kinds the pipeline cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOp {
    Created,
    Written,
    Removed,
    Renamed,
}

/// A filesystem change plus the file content snapshot taken at batch time.
/// Content is empty for [`FileOp::Removed`].
#[derive(Debug, Clone)]
pub struct FileEvent {
    pub path: PathBuf,
    pub op: FileOp,
    pub content: Vec<u8>,
}

/// Raw event as delivered by the observer, before content is read.
#[derive(Debug)]
struct RawEvent {
    path: PathBuf,
    op: FileOp,
}

/// Map an observer event kind onto a pipeline op. `None` means dropped —
/// access and metadata-only changes (chmod, ownership) carry no new content.
fn map_event_kind(kind: &EventKind) -> Option<FileOp> {
    use notify::event::ModifyKind;
    match kind {
        EventKind::Create(_) => Some(FileOp::Created),
        EventKind::Modify(ModifyKind::Name(_)) => Some(FileOp::Renamed),
        EventKind::Modify(ModifyKind::Metadata(_)) => None,
        EventKind::Modify(_) => Some(FileOp::Written),
        EventKind::Remove(_) => Some(FileOp::Removed),
        _ => None,
    }
}

fn matches_any_glob(globs: &[String], candidate: &str) -> bool {
    globs.iter().any(|g| glob_match::glob_match(g, candidate))
}

fn is_ignored_path(detection: &DetectionConfig, path: &Path) -> bool {
    matches_any_glob(&detection.ignore_paths, &path.to_string_lossy())
}

/// Ignore-glob filter applied to every raw event before buffering.
fn should_process(detection: &DetectionConfig, path: &Path) -> bool {
    if is_ignored_path(detection, path) {
        return false;
    }
    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
        if matches_any_glob(&detection.ignore_files, name) {
            return false;
        }
    }
    true
}

/// Read file content for an event. `Ok(None)` means the file exceeds the cap.
/// A file of exactly the cap is accepted.
fn read_event_content(path: &Path, max_bytes: u64) -> std::io::Result<Option<Vec<u8>>> {
    let meta = std::fs::metadata(path)?;
    if meta.len() > max_bytes {
        return Ok(None);
    }
    Ok(Some(std::fs::read(path)?))
}

/// Supervisor owning the observer, batcher, sweeper and worker pool.
pub struct Watcher {
    config: Arc<Config>,
    scanner: Arc<Scanner>,
    reactor: Arc<Reactor>,
    tuning: Tuning,
    shutdown_tx: watch::Sender<bool>,
    fs_watcher: Option<RecommendedWatcher>,
    batcher: Option<JoinHandle<()>>,
    sweeper: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl Watcher {
    /// Create a watcher tuned to the host.
    pub fn new(config: Arc<Config>, scanner: Arc<Scanner>, reactor: Arc<Reactor>) -> Self {
        Self::with_tuning(config, scanner, reactor, tuning::auto_tune())
    }

    /// Create a watcher with explicit tuning (used by tests and benchmarks).
    pub fn with_tuning(
        config: Arc<Config>,
        scanner: Arc<Scanner>,
        reactor: Arc<Reactor>,
        tuning: Tuning,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            scanner,
            reactor,
            tuning,
            shutdown_tx,
            fs_watcher: None,
            batcher: None,
            sweeper: None,
            workers: Vec::new(),
        }
    }

    pub fn tuning(&self) -> Tuning {
        self.tuning
    }

    /// Subscribe the watch roots and spawn the pipeline tasks.
    pub fn start(&mut self) -> Result<()> {
        let (raw_tx, raw_rx) = mpsc::channel::<RawEvent>(1024);

        let mut fs_watcher = RecommendedWatcher::new(
            move |res: std::result::Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    if let Some(op) = map_event_kind(&event.kind) {
                        for path in event.paths {
                            let _ = raw_tx.blocking_send(RawEvent { path, op });
                        }
                    }
                }
                Err(e) => warn!(error = %e, "filesystem watcher error"),
            },
            notify::Config::default(),
        )
        .context("failed to create filesystem watcher")?;

        let mut watched_dirs = 0usize;
        for root in &self.config.detection.watch_paths {
            watched_dirs +=
                add_watch_recursive(&mut fs_watcher, Path::new(root), &self.config.detection);
        }
        self.fs_watcher = Some(fs_watcher);

        let (work_tx, work_rx) = mpsc::channel::<FileEvent>(self.tuning.buffer_size);
        let work_rx = Arc::new(Mutex::new(work_rx));
        let cache = Arc::new(DedupCache::new());

        self.batcher = Some(tokio::spawn(run_batcher(
            self.config.clone(),
            raw_rx,
            work_tx,
            self.shutdown_tx.subscribe(),
        )));

        self.sweeper = Some(tokio::spawn(run_sweeper(
            cache.clone(),
            self.shutdown_tx.subscribe(),
        )));

        for id in 0..self.tuning.workers {
            self.workers.push(tokio::spawn(run_worker(
                id,
                work_rx.clone(),
                cache.clone(),
                self.scanner.clone(),
                self.reactor.clone(),
                self.config.clone(),
            )));
        }

        info!(
            dirs = watched_dirs,
            workers = self.tuning.workers,
            buffer = self.tuning.buffer_size,
            "watcher started"
        );
        Ok(())
    }

    /// Drain and stop the pipeline. Safe to call more than once.
    ///
    /// Sequence: stop the observer, let the batcher flush into the queue,
    /// close the queue, then join workers within [`SHUTDOWN_BUDGET`].
    pub async fn stop(&mut self) {
        let _ = self.shutdown_tx.send(true);

        // Dropping the observer ends its callback thread; no new raw events.
        self.fs_watcher.take();

        // The batcher flushes pending events and exits, dropping the only
        // queue sender. Workers then drain to completion.
        if let Some(batcher) = self.batcher.take() {
            let _ = batcher.await;
        }
        if let Some(sweeper) = self.sweeper.take() {
            let _ = sweeper.await;
        }

        let workers = std::mem::take(&mut self.workers);
        let deadline = std::time::Instant::now() + SHUTDOWN_BUDGET;
        for mut handle in workers {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if tokio::time::timeout(remaining, &mut handle).await.is_err() {
                warn!("shutdown budget exceeded, aborting worker");
                handle.abort();
            }
        }

        info!("watcher stopped");
    }
}

/// Walk a root and subscribe every directory not matched by the ignore globs.
///
/// Per-entry walk errors are logged and skipped so one unreadable subtree
/// never blocks the rest. Symlinked directories are followed.
fn add_watch_recursive(
    fs_watcher: &mut RecommendedWatcher,
    root: &Path,
    detection: &DetectionConfig,
) -> usize {
    let mut count = 0usize;
    for entry in WalkDir::new(root).follow_links(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!(error = %e, "error accessing path during walk");
                continue;
            }
        };
        if !entry.file_type().is_dir() {
            continue;
        }
        let path = entry.path();
        if is_ignored_path(detection, path) {
            continue;
        }
        match fs_watcher.watch(path, RecursiveMode::NonRecursive) {
            Ok(()) => {
                debug!(path = %path.display(), "watching directory");
                count += 1;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to watch directory");
            }
        }
    }
    if count == 0 {
        warn!(root = %root.display(), "no directories watched under root");
    }
    count
}

/// Coalesce raw events on the batch tick and feed the work queue.
async fn run_batcher(
    config: Arc<Config>,
    mut raw_rx: mpsc::Receiver<RawEvent>,
    work_tx: mpsc::Sender<FileEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(BATCH_TICK);
    tick.tick().await; // the first tick completes immediately
    let mut pending: Vec<RawEvent> = Vec::new();

    loop {
        tokio::select! {
            maybe = raw_rx.recv() => {
                match maybe {
                    Some(raw) => {
                        if should_process(&config.detection, &raw.path) {
                            pending.push(raw);
                        }
                    }
                    // Observer gone: flush what we have and exit.
                    None => break,
                }
            }
            _ = tick.tick() => {
                flush_pending(&config, &mut pending, &work_tx);
            }
            _ = shutdown_rx.changed() => break,
        }
    }

    // Best-effort drain of the final batch before the queue closes.
    flush_pending(&config, &mut pending, &work_tx);
}

/// Read content for each buffered event and offer it to the queue.
fn flush_pending(config: &Config, pending: &mut Vec<RawEvent>, work_tx: &mpsc::Sender<FileEvent>) {
    let max_bytes = config.detection.max_file_size_bytes();
    for raw in pending.drain(..) {
        let content = if raw.op == FileOp::Removed {
            Vec::new()
        } else {
            match read_event_content(&raw.path, max_bytes) {
                Ok(Some(content)) => content,
                Ok(None) => {
                    debug!(path = %raw.path.display(), "file exceeds size limit, dropping event");
                    continue;
                }
                Err(e) => {
                    // The file may have been deleted between event and read.
                    debug!(path = %raw.path.display(), error = %e, "failed to read file, dropping event");
                    continue;
                }
            }
        };

        let event = FileEvent {
            path: raw.path,
            op: raw.op,
            content,
        };
        match work_tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(path = %event.path.display(), "work queue full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => return,
        }
    }
}

/// Periodically expire stale dedup entries.
async fn run_sweeper(cache: Arc<DedupCache>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(SWEEP_INTERVAL);
    tick.tick().await; // skip the immediate first tick
    loop {
        tokio::select! {
            _ = tick.tick() => cache.sweep(),
            _ = shutdown_rx.changed() => break,
        }
    }
}

/// Worker loop: dequeue, process, repeat until the queue closes.
async fn run_worker(
    id: usize,
    queue: Arc<Mutex<mpsc::Receiver<FileEvent>>>,
    cache: Arc<DedupCache>,
    scanner: Arc<Scanner>,
    reactor: Arc<Reactor>,
    config: Arc<Config>,
) {
    debug!(worker = id, "worker started");
    loop {
        let event = { queue.lock().await.recv().await };
        let Some(event) = event else { break };
        process_event(&event, &cache, &scanner, &reactor, &config).await;
    }
    debug!(worker = id, "worker stopped");
}

/// Dedup-gate, scan, and react to a single dispatched event.
async fn process_event(
    event: &FileEvent,
    cache: &DedupCache,
    scanner: &Scanner,
    reactor: &Reactor,
    config: &Config,
) {
    if !cache.check_and_mark(&event.path) {
        debug!(path = %event.path.display(), "skipping duplicate detection");
        return;
    }

    let matches = match scanner.scan(&event.content, &event.path) {
        Ok(matches) => matches,
        Err(e) => {
            debug!(path = %event.path.display(), error = %e, "scan failed");
            return;
        }
    };

    if !matches.is_empty() {
        info!(path = %event.path.display(), matches = matches.len(), "flagged");
        reactor.on_match(&event.path, &matches, &event.content).await;
    } else if config.logs.file_modified || config.logs.file_created {
        debug!(path = %event.path.display(), op = ?event.op, "processed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex as PlMutex;
    use std::io::Write;

    use crate::plugins::{Plugin, PluginSetBuilder};
    use crate::scanner::Match;

    const MINER_RULE: &str = r#"
rule miner_xmr {
    strings:
        $a = "MINER_XMR_V1"
    condition:
        $a
}
"#;

    struct RecordingPlugin {
        calls: Arc<PlMutex<Vec<(PathBuf, Vec<Match>)>>>,
    }

    #[async_trait]
    impl Plugin for RecordingPlugin {
        fn name(&self) -> &str {
            "recording"
        }

        fn version(&self) -> &str {
            "0.0.1"
        }

        async fn on_start(&mut self, _config: &Config) -> anyhow::Result<()> {
            Ok(())
        }

        async fn on_detected(&self, path: &Path, matches: &[Match]) -> anyhow::Result<()> {
            self.calls
                .lock()
                .push((path.to_path_buf(), matches.to_vec()));
            Ok(())
        }
    }

    struct Harness {
        _sig_dir: tempfile::TempDir,
        watch_dir: tempfile::TempDir,
        watcher: Watcher,
        calls: Arc<PlMutex<Vec<(PathBuf, Vec<Match>)>>>,
    }

    async fn harness(mutate: impl FnOnce(&mut Config)) -> Harness {
        let sig_dir = tempfile::tempdir().unwrap();
        std::fs::write(sig_dir.path().join("miner.yar"), MINER_RULE).unwrap();
        let watch_dir = tempfile::tempdir().unwrap();

        let mut config = Config::default();
        config.detection.watch_paths = vec![watch_dir.path().to_string_lossy().to_string()];
        config.detection.signature_path = sig_dir.path().to_string_lossy().to_string();
        mutate(&mut config);
        let config = Arc::new(config);

        let calls = Arc::new(PlMutex::new(Vec::new()));
        let plugins = PluginSetBuilder::new()
            .register(Box::new(RecordingPlugin {
                calls: calls.clone(),
            }))
            .build(&config)
            .await
            .unwrap();

        let scanner = Arc::new(Scanner::new(sig_dir.path()).unwrap());
        let reactor = Arc::new(Reactor::new(config.clone(), plugins).unwrap());
        let tuning = Tuning {
            workers: 2,
            buffer_size: 64,
            cpu_count: 2,
            ram_gb: 8,
        };
        let watcher = Watcher::with_tuning(config, scanner, reactor, tuning);

        Harness {
            _sig_dir: sig_dir,
            watch_dir,
            watcher,
            calls,
        }
    }

    /// Poll the recorder until `count` reactions arrive or the deadline hits.
    async fn wait_for_calls(
        calls: &Arc<PlMutex<Vec<(PathBuf, Vec<Match>)>>>,
        count: usize,
        deadline: Duration,
    ) -> bool {
        let start = tokio::time::Instant::now();
        while start.elapsed() < deadline {
            if calls.lock().len() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        calls.lock().len() >= count
    }

    #[tokio::test]
    async fn test_write_triggered_detection() {
        let mut h = harness(|_| {}).await;
        h.watcher.start().unwrap();

        let target = h.watch_dir.path().join("a.sh");
        std::fs::write(&target, "#!/bin/sh\nMINER_XMR_V1\n").unwrap();

        assert!(wait_for_calls(&h.calls, 1, Duration::from_secs(2)).await);
        // Wait one more tick to confirm the burst coalesced to one reaction.
        tokio::time::sleep(Duration::from_millis(1200)).await;
        let calls = h.calls.lock().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, target);
        assert_eq!(calls[0].1.len(), 1);
        assert_eq!(calls[0].1[0].rule, "miner_xmr");
        assert_eq!(calls[0].1[0].tags, "");

        h.watcher.stop().await;
    }

    #[tokio::test]
    async fn test_dedup_window_suppresses_double_write() {
        let mut h = harness(|_| {}).await;
        h.watcher.start().unwrap();

        let target = h.watch_dir.path().join("twice.sh");
        std::fs::write(&target, "MINER_XMR_V1 first\n").unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        std::fs::write(&target, "MINER_XMR_V1 second\n").unwrap();

        // Both writes land within the 5s window: exactly one reaction.
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(h.calls.lock().len(), 1);

        h.watcher.stop().await;
    }

    #[tokio::test]
    async fn test_ignored_file_glob_produces_no_reaction() {
        let mut h = harness(|c| {
            c.detection.ignore_files = vec!["*.log".to_string()];
        })
        .await;
        h.watcher.start().unwrap();

        std::fs::write(h.watch_dir.path().join("x.log"), "MINER_XMR_V1\n").unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(h.calls.lock().is_empty());

        h.watcher.stop().await;
    }

    #[tokio::test]
    async fn test_oversize_file_dropped() {
        let mut h = harness(|c| {
            c.detection.max_file_size_mb = 1;
        })
        .await;
        h.watcher.start().unwrap();

        let mut big = Vec::with_capacity(2 * 1024 * 1024);
        big.extend_from_slice(b"MINER_XMR_V1");
        big.resize(2 * 1024 * 1024, b'.');
        std::fs::write(h.watch_dir.path().join("big.bin"), &big).unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(h.calls.lock().is_empty());

        h.watcher.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let mut h = harness(|_| {}).await;
        h.watcher.start().unwrap();
        h.watcher.stop().await;
        // A second stop must be a no-op.
        h.watcher.stop().await;
    }

    #[tokio::test]
    async fn test_no_reaction_after_stop() {
        let mut h = harness(|_| {}).await;
        h.watcher.start().unwrap();
        h.watcher.stop().await;

        std::fs::write(h.watch_dir.path().join("late.sh"), "MINER_XMR_V1\n").unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(h.calls.lock().is_empty());
    }

    #[test]
    fn test_map_event_kind() {
        use notify::event::{CreateKind, DataChange, ModifyKind, RemoveKind, RenameMode};

        assert_eq!(
            map_event_kind(&EventKind::Create(CreateKind::File)),
            Some(FileOp::Created)
        );
        assert_eq!(
            map_event_kind(&EventKind::Modify(ModifyKind::Data(DataChange::Content))),
            Some(FileOp::Written)
        );
        assert_eq!(
            map_event_kind(&EventKind::Modify(ModifyKind::Name(RenameMode::To))),
            Some(FileOp::Renamed)
        );
        assert_eq!(
            map_event_kind(&EventKind::Remove(RemoveKind::File)),
            Some(FileOp::Removed)
        );
        assert_eq!(map_event_kind(&EventKind::Access(notify::event::AccessKind::Read)), None);
        assert_eq!(
            map_event_kind(&EventKind::Modify(ModifyKind::Metadata(
                notify::event::MetadataKind::Permissions
            ))),
            None
        );
    }

    #[test]
    fn test_should_process_ignore_paths() {
        let detection = DetectionConfig {
            ignore_paths: vec!["/etc/sentinel/signatures/**".to_string()],
            ..DetectionConfig::default()
        };
        assert!(!should_process(
            &detection,
            Path::new("/etc/sentinel/signatures/miner.yar")
        ));
        assert!(should_process(&detection, Path::new("/tmp/w/a.sh")));
    }

    #[test]
    fn test_should_process_ignore_files() {
        let detection = DetectionConfig {
            ignore_files: vec!["*.log".to_string(), "config.toml".to_string()],
            ..DetectionConfig::default()
        };
        assert!(!should_process(&detection, Path::new("/tmp/w/x.log")));
        assert!(!should_process(&detection, Path::new("/tmp/w/config.toml")));
        assert!(should_process(&detection, Path::new("/tmp/w/x.sh")));
    }

    #[test]
    fn test_read_event_content_size_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exact.bin");
        let cap = 1024u64;

        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(&vec![0u8; cap as usize]).unwrap();
        drop(file);
        // Exactly the cap is accepted.
        assert!(read_event_content(&path, cap).unwrap().is_some());

        std::fs::write(&path, vec![0u8; cap as usize + 1]).unwrap();
        // One byte over is rejected.
        assert!(read_event_content(&path, cap).unwrap().is_none());
    }

    #[test]
    fn test_read_event_content_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_event_content(&dir.path().join("gone.sh"), 1024).is_err());
    }
}

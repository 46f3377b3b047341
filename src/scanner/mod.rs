//! Signature engine: compiles YARA rule sources and scans byte buffers.
//!
//! Rule sources are loaded from a file or directory of `.yar`/`.yara` files.
//! Each source file compiles into its own ruleset; the set of compiled
//! rulesets forms an immutable snapshot shared by all workers. [`Scanner::reload`]
//! swaps the snapshot atomically so in-flight scans keep their view while new
//! scans see the fresh rules.
//!
//! Loading fails softly: a missing signature path, an empty directory, or a
//! directory where nothing compiles all yield an empty snapshot with a
//! warning, so the daemon can start before signatures have been synced.
//! Scanning against an empty snapshot is an error callers treat as a skip.

pub mod archive;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Wall-clock budget for a single direct scan.
pub const SCAN_TIMEOUT: Duration = Duration::from_secs(30);

/// A single rule hit: the rule identifier plus its comma-joined tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Match {
    pub rule: String,
    pub tags: String,
}

#[derive(Debug, Error)]
pub enum ScanError {
    /// No rules are loaded; detection is a no-op until a reload succeeds.
    #[error("scanner not initialized - no rules loaded")]
    NotInitialized,
    /// A signature file was passed directly with the wrong extension.
    #[error("signature file must have a .yar or .yara extension: {0}")]
    BadExtension(PathBuf),
    /// The container file could not be parsed as the archive format its
    /// extension claims.
    #[error("malformed {kind} archive: {reason}")]
    Archive { kind: &'static str, reason: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

type Snapshot = Arc<Vec<yara_x::Rules>>;

/// Compiled signature rules behind an atomically swappable snapshot.
#[derive(Debug)]
pub struct Scanner {
    rules: RwLock<Snapshot>,
}

impl Scanner {
    /// Compile rules from `signature_path` (file or directory).
    ///
    /// Soft-fails to an empty snapshot when the path is missing or nothing
    /// compiles; hard-fails only on a directly named file with the wrong
    /// extension.
    pub fn new(signature_path: &Path) -> Result<Self, ScanError> {
        let snapshot = compile_rules(signature_path)?;
        Ok(Self {
            rules: RwLock::new(snapshot),
        })
    }

    /// Number of compiled rule files in the current snapshot.
    pub fn ruleset_count(&self) -> usize {
        self.rules.read().len()
    }

    /// Recompile from `signature_path` and swap the snapshot.
    ///
    /// In-flight scans keep their snapshot reference; the write lock is held
    /// only for the pointer assignment. The previous snapshot is dropped once
    /// the last in-flight scan releases it.
    pub fn reload(&self, signature_path: &Path) -> Result<(), ScanError> {
        let snapshot = compile_rules(signature_path)?;
        *self.rules.write() = snapshot;
        Ok(())
    }

    /// Scan `data`, dispatching on the extension of `path`:
    /// `.jar`/`.zip` and `.rar` expand the archive and scan each inner entry,
    /// anything else is scanned directly.
    pub fn scan(&self, data: &[u8], path: &Path) -> Result<Vec<Match>, ScanError> {
        let snapshot = self.rules.read().clone();
        if snapshot.is_empty() {
            return Err(ScanError::NotInitialized);
        }
        scan_bytes(&snapshot, data, path)
    }
}

/// Extension-dispatched scan against a fixed snapshot.
///
/// Archive expansion recurses through here so every inner entry is scanned
/// against the same snapshot the outer file started with.
pub(crate) fn scan_bytes(
    rules: &[yara_x::Rules],
    data: &[u8],
    path: &Path,
) -> Result<Vec<Match>, ScanError> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("jar") | Some("zip") => archive::scan_zip(rules, data),
        Some("rar") => archive::scan_rar(rules, data),
        _ => Ok(scan_direct(rules, data)),
    }
}

/// Run every ruleset over `data` with the scan timeout applied.
/// A ruleset failure (including timeout) is a warning and counts as unmatched.
fn scan_direct(rules: &[yara_x::Rules], data: &[u8]) -> Vec<Match> {
    let mut all = Vec::new();
    for ruleset in rules {
        let mut scanner = yara_x::Scanner::new(ruleset);
        scanner.set_timeout(SCAN_TIMEOUT);
        match scanner.scan(data) {
            Ok(results) => {
                for rule in results.matching_rules() {
                    let tags: Vec<&str> = rule.tags().map(|t| t.identifier()).collect();
                    all.push(Match {
                        rule: rule.identifier().to_string(),
                        tags: tags.join(","),
                    });
                }
            }
            Err(e) => warn!(error = %e, "scan failed with ruleset"),
        }
    }
    all
}

fn has_rule_extension(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.ends_with(".yar") || n.ends_with(".yara"))
        .unwrap_or(false)
}

/// Compile each candidate source file into its own ruleset.
///
/// Per-file read or compile failures are warnings; the remainder still loads.
fn compile_rules(signature_path: &Path) -> Result<Snapshot, ScanError> {
    info!(path = %signature_path.display(), "loading signature rules");

    let meta = match std::fs::metadata(signature_path) {
        Ok(m) => m,
        Err(_) => {
            warn!(
                path = %signature_path.display(),
                "signature path not found - no rules will be applied"
            );
            return Ok(Arc::new(Vec::new()));
        }
    };

    let mut sources: Vec<PathBuf> = Vec::new();
    if meta.is_dir() {
        let entries = match std::fs::read_dir(signature_path) {
            Ok(e) => e,
            Err(e) => {
                warn!(
                    path = %signature_path.display(),
                    error = %e,
                    "failed to read signature directory - no rules will be applied"
                );
                return Ok(Arc::new(Vec::new()));
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() || !has_rule_extension(&path) {
                continue;
            }
            sources.push(path);
        }
        sources.sort();
        if sources.is_empty() {
            warn!(
                path = %signature_path.display(),
                "no signature files found in directory - scanner will not detect anything"
            );
            return Ok(Arc::new(Vec::new()));
        }
    } else {
        if !has_rule_extension(signature_path) {
            return Err(ScanError::BadExtension(signature_path.to_path_buf()));
        }
        sources.push(signature_path.to_path_buf());
    }

    let mut compiled = Vec::new();
    for rule_path in &sources {
        let src = match std::fs::read(rule_path) {
            Ok(s) => s,
            Err(e) => {
                warn!(path = %rule_path.display(), error = %e, "failed to read signature file");
                continue;
            }
        };
        let mut compiler = yara_x::Compiler::new();
        if let Err(e) = compiler.add_source(src.as_slice()) {
            warn!(path = %rule_path.display(), error = %e, "failed to compile signature file");
            continue;
        }
        debug!(path = %rule_path.display(), "added signature rules");
        compiled.push(compiler.build());
    }

    if compiled.is_empty() {
        warn!(
            files = sources.len(),
            "failed to compile any signature rules - scanner will not detect anything"
        );
    } else {
        info!(files = compiled.len(), "signature rules loaded");
    }

    Ok(Arc::new(compiled))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINER_RULE: &str = r#"
rule miner_xmr : miner {
    strings:
        $a = "MINER_XMR_V1"
    condition:
        $a
}
"#;

    const TUNNEL_RULE: &str = r#"
rule nezha_tunnel {
    strings:
        $a = "NEZHA_TUNNEL_V2"
    condition:
        $a
}
"#;

    fn scanner_with_rules(rules: &[(&str, &str)]) -> (tempfile::TempDir, Scanner) {
        let dir = tempfile::tempdir().unwrap();
        for (name, body) in rules {
            std::fs::write(dir.path().join(name), body).unwrap();
        }
        let scanner = Scanner::new(dir.path()).unwrap();
        (dir, scanner)
    }

    #[test]
    fn test_direct_scan_matches() {
        let (_dir, scanner) = scanner_with_rules(&[("miner.yar", MINER_RULE)]);
        let matches = scanner
            .scan(b"#!/bin/sh\nMINER_XMR_V1\n", Path::new("/tmp/w/a.sh"))
            .unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].rule, "miner_xmr");
        assert_eq!(matches[0].tags, "miner");
    }

    #[test]
    fn test_direct_scan_clean_file() {
        let (_dir, scanner) = scanner_with_rules(&[("miner.yar", MINER_RULE)]);
        let matches = scanner.scan(b"hello world", Path::new("/tmp/ok.txt")).unwrap();
        assert!(matches.is_empty());
    }

    #[test]
    fn test_scan_is_deterministic() {
        let (_dir, scanner) = scanner_with_rules(&[("miner.yar", MINER_RULE)]);
        let data = b"prefix MINER_XMR_V1 suffix";
        let a = scanner.scan(data, Path::new("x.bin")).unwrap();
        let b = scanner.scan(data, Path::new("x.bin")).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_missing_path_soft_fails_empty() {
        let scanner = Scanner::new(Path::new("/nonexistent/sentinel/sigs")).unwrap();
        assert_eq!(scanner.ruleset_count(), 0);
        let err = scanner.scan(b"MINER_XMR_V1", Path::new("a.sh")).unwrap_err();
        assert!(matches!(err, ScanError::NotInitialized));
    }

    #[test]
    fn test_empty_directory_soft_fails_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("README.txt"), "not a rule").unwrap();
        let scanner = Scanner::new(dir.path()).unwrap();
        assert_eq!(scanner.ruleset_count(), 0);
    }

    #[test]
    fn test_direct_file_wrong_extension_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.txt");
        std::fs::write(&path, MINER_RULE).unwrap();
        let err = Scanner::new(&path).unwrap_err();
        assert!(matches!(err, ScanError::BadExtension(_)));
    }

    #[test]
    fn test_uppercase_extension_not_loaded() {
        // Extension matching is case-sensitive.
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("miner.YAR"), MINER_RULE).unwrap();
        let scanner = Scanner::new(dir.path()).unwrap();
        assert_eq!(scanner.ruleset_count(), 0);
    }

    #[test]
    fn test_single_rule_file_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("miner.yara");
        std::fs::write(&path, MINER_RULE).unwrap();
        let scanner = Scanner::new(&path).unwrap();
        assert_eq!(scanner.ruleset_count(), 1);
    }

    #[test]
    fn test_bad_file_skipped_good_file_loads() {
        let (_dir, scanner) = scanner_with_rules(&[
            ("broken.yar", "rule { this is not yara"),
            ("miner.yar", MINER_RULE),
        ]);
        assert_eq!(scanner.ruleset_count(), 1);
        let matches = scanner.scan(b"MINER_XMR_V1", Path::new("a.sh")).unwrap();
        assert_eq!(matches[0].rule, "miner_xmr");
    }

    #[test]
    fn test_all_files_broken_soft_fails_empty() {
        let (_dir, scanner) = scanner_with_rules(&[("broken.yar", "rule { nope")]);
        assert_eq!(scanner.ruleset_count(), 0);
    }

    #[test]
    fn test_multiple_rule_files_all_apply() {
        let (_dir, scanner) = scanner_with_rules(&[
            ("miner.yar", MINER_RULE),
            ("tunnel.yara", TUNNEL_RULE),
        ]);
        assert_eq!(scanner.ruleset_count(), 2);
        let matches = scanner
            .scan(b"MINER_XMR_V1 and NEZHA_TUNNEL_V2", Path::new("combo.sh"))
            .unwrap();
        let rules: Vec<&str> = matches.iter().map(|m| m.rule.as_str()).collect();
        assert!(rules.contains(&"miner_xmr"));
        assert!(rules.contains(&"nezha_tunnel"));
    }

    #[test]
    fn test_untagged_rule_has_empty_tags() {
        let (_dir, scanner) = scanner_with_rules(&[("tunnel.yar", TUNNEL_RULE)]);
        let matches = scanner.scan(b"NEZHA_TUNNEL_V2", Path::new("t.sh")).unwrap();
        assert_eq!(matches[0].tags, "");
    }

    #[test]
    fn test_reload_swaps_rules() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("sig.yar"), MINER_RULE).unwrap();
        let scanner = Scanner::new(dir.path()).unwrap();
        assert!(!scanner.scan(b"MINER_XMR_V1", Path::new("a.sh")).unwrap().is_empty());

        std::fs::write(dir.path().join("sig.yar"), TUNNEL_RULE).unwrap();
        scanner.reload(dir.path()).unwrap();

        assert!(scanner.scan(b"MINER_XMR_V1", Path::new("a.sh")).unwrap().is_empty());
        assert!(!scanner.scan(b"NEZHA_TUNNEL_V2", Path::new("a.sh")).unwrap().is_empty());
        // Snapshot count did not accumulate across the reload.
        assert_eq!(scanner.ruleset_count(), 1);
    }

    #[test]
    fn test_reload_same_sources_matches_same_inputs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("sig.yar"), MINER_RULE).unwrap();
        let scanner = Scanner::new(dir.path()).unwrap();
        let before = scanner.scan(b"MINER_XMR_V1", Path::new("a.sh")).unwrap();
        scanner.reload(dir.path()).unwrap();
        let after = scanner.scan(b"MINER_XMR_V1", Path::new("a.sh")).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_zip_expansion_matches_inner_entry() {
        let (_dir, scanner) = scanner_with_rules(&[("miner.yar", MINER_RULE)]);

        let mut buf = Vec::new();
        {
            let mut writer = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
            let opts = zip::write::SimpleFileOptions::default();
            writer.start_file("inner.txt", opts).unwrap();
            writer.write_all(b"payload MINER_XMR_V1 payload").unwrap();
            writer.finish().unwrap();
        }

        let direct = scanner
            .scan(b"payload MINER_XMR_V1 payload", Path::new("inner.txt"))
            .unwrap();
        let expanded = scanner.scan(&buf, Path::new("/tmp/w/bad.zip")).unwrap();
        assert_eq!(expanded, direct);
    }

    #[test]
    fn test_jar_extension_uses_zip_expansion() {
        let (_dir, scanner) = scanner_with_rules(&[("miner.yar", MINER_RULE)]);

        let mut buf = Vec::new();
        {
            let mut writer = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
            let opts = zip::write::SimpleFileOptions::default();
            writer.start_file("Loader.class", opts).unwrap();
            writer.write_all(b"MINER_XMR_V1").unwrap();
            writer.finish().unwrap();
        }

        let matches = scanner.scan(&buf, Path::new("mod.jar")).unwrap();
        assert_eq!(matches.len(), 1);
    }

    #[test]
    fn test_zip_oversized_entry_skipped() {
        let (_dir, scanner) = scanner_with_rules(&[("miner.yar", MINER_RULE)]);

        let mut big = Vec::with_capacity(11 * 1024 * 1024);
        big.extend_from_slice(b"MINER_XMR_V1");
        big.resize(11 * 1024 * 1024, 0);

        let mut buf = Vec::new();
        {
            let mut writer = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
            let opts = zip::write::SimpleFileOptions::default();
            writer.start_file("big.bin", opts).unwrap();
            writer.write_all(&big).unwrap();
            writer.start_file("small.txt", opts).unwrap();
            writer.write_all(b"MINER_XMR_V1").unwrap();
            writer.finish().unwrap();
        }

        // Only the small entry may contribute a match.
        let matches = scanner.scan(&buf, Path::new("bad.zip")).unwrap();
        assert_eq!(matches.len(), 1);
    }

    #[test]
    fn test_malformed_zip_is_error() {
        let (_dir, scanner) = scanner_with_rules(&[("miner.yar", MINER_RULE)]);
        let err = scanner
            .scan(b"definitely not a zip file", Path::new("bad.zip"))
            .unwrap_err();
        assert!(matches!(err, ScanError::Archive { kind: "zip", .. }));
    }

    #[test]
    fn test_malformed_rar_is_error() {
        let (_dir, scanner) = scanner_with_rules(&[("miner.yar", MINER_RULE)]);
        let err = scanner
            .scan(b"definitely not a rar file", Path::new("bad.rar"))
            .unwrap_err();
        assert!(matches!(err, ScanError::Archive { kind: "rar", .. }));
    }

    #[test]
    fn test_nested_zip_inside_zip() {
        let (_dir, scanner) = scanner_with_rules(&[("miner.yar", MINER_RULE)]);

        let mut inner = Vec::new();
        {
            let mut writer = zip::ZipWriter::new(std::io::Cursor::new(&mut inner));
            let opts = zip::write::SimpleFileOptions::default();
            writer.start_file("payload.sh", opts).unwrap();
            writer.write_all(b"MINER_XMR_V1").unwrap();
            writer.finish().unwrap();
        }

        let mut outer = Vec::new();
        {
            let mut writer = zip::ZipWriter::new(std::io::Cursor::new(&mut outer));
            let opts = zip::write::SimpleFileOptions::default();
            writer.start_file("nested.zip", opts).unwrap();
            writer.write_all(&inner).unwrap();
            writer.finish().unwrap();
        }

        let matches = scanner.scan(&outer, Path::new("outer.zip")).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].rule, "miner_xmr");
    }
}

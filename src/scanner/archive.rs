//! Archive expansion for container file types.
//!
//! Zip-family archives (`.zip`, `.jar`) are enumerated in place from the byte
//! buffer. Rar archives go through a named temp file because the rar reader
//! works on paths, then stream entry by entry. Inner entries above the size
//! cap are skipped; every surviving entry is scanned recursively under its
//! own name, so an archive inside an archive still expands.

use std::io::{Read, Write};
use std::path::Path;

use tracing::{debug, warn};

use super::{scan_bytes, Match, ScanError};

/// Declared-uncompressed-size cap per inner entry.
pub const MAX_ENTRY_BYTES: u64 = 10 * 1024 * 1024;

/// Enumerate a zip archive and scan each inner file.
///
/// Directories and oversized entries are skipped; per-entry read or scan
/// failures are warnings and enumeration continues. A buffer that does not
/// parse as zip at all is an [`ScanError::Archive`] error.
pub(crate) fn scan_zip(rules: &[yara_x::Rules], data: &[u8]) -> Result<Vec<Match>, ScanError> {
    let cursor = std::io::Cursor::new(data);
    let mut archive = zip::ZipArchive::new(cursor).map_err(|e| ScanError::Archive {
        kind: "zip",
        reason: e.to_string(),
    })?;

    let mut all = Vec::new();
    for index in 0..archive.len() {
        let mut entry = match archive.by_index(index) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(index, error = %e, "failed to open zip entry");
                continue;
            }
        };
        if entry.is_dir() {
            continue;
        }
        if entry.size() > MAX_ENTRY_BYTES {
            debug!(entry = entry.name(), size = entry.size(), "skipping oversized zip entry");
            continue;
        }

        let name = entry.name().to_string();
        let mut content = Vec::with_capacity(entry.size() as usize);
        if let Err(e) = entry.read_to_end(&mut content) {
            warn!(entry = %name, error = %e, "failed to read zip entry");
            continue;
        }

        match scan_bytes(rules, &content, Path::new(&name)) {
            Ok(matches) => all.extend(matches),
            Err(e) => warn!(entry = %name, error = %e, "error scanning zip entry"),
        }
    }

    Ok(all)
}

/// Stream a rar archive and scan each inner file.
///
/// The rar reader consumes its cursor on a failed entry read, so a read error
/// ends enumeration (with a warning); matches collected so far are returned.
pub(crate) fn scan_rar(rules: &[yara_x::Rules], data: &[u8]) -> Result<Vec<Match>, ScanError> {
    let mut tmp = tempfile::NamedTempFile::new()?;
    tmp.write_all(data)?;
    tmp.flush()?;

    let mut archive = unrar::Archive::new(tmp.path())
        .open_for_processing()
        .map_err(|e| ScanError::Archive {
            kind: "rar",
            reason: e.to_string(),
        })?;

    let mut all = Vec::new();
    loop {
        let header = match archive.read_header() {
            Ok(Some(header)) => header,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "failed to read rar entry header");
                break;
            }
        };

        let name = header.entry().filename.to_string_lossy().to_string();
        archive = if !header.entry().is_file() {
            match header.skip() {
                Ok(rest) => rest,
                Err(e) => {
                    warn!(entry = %name, error = %e, "failed to skip rar entry");
                    break;
                }
            }
        } else if header.entry().unpacked_size as u64 > MAX_ENTRY_BYTES {
            debug!(entry = %name, "skipping oversized rar entry");
            match header.skip() {
                Ok(rest) => rest,
                Err(e) => {
                    warn!(entry = %name, error = %e, "failed to skip rar entry");
                    break;
                }
            }
        } else {
            match header.read() {
                Ok((content, rest)) => {
                    match scan_bytes(rules, &content, Path::new(&name)) {
                        Ok(matches) => all.extend(matches),
                        Err(e) => warn!(entry = %name, error = %e, "error scanning rar entry"),
                    }
                    rest
                }
                Err(e) => {
                    warn!(entry = %name, error = %e, "failed to read rar entry");
                    break;
                }
            }
        };
    }

    Ok(all)
}

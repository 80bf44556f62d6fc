//! # Bounded Tar Layer Extraction
//!
//! Streams an OCI layer (plain or gzip-compressed tar) into a destination
//! directory under four limits: manifest bytes, single file bytes, total
//! extracted bytes, and entry count. Totals are carried in
//! [`ExtractTotals`] so that a multi-layer pull is bounded as a whole.
//!
//! ## Security Model
//!
//! - **Path traversal**: every entry target is lexically cleaned and must
//!   equal the destination or sit below `dest + "/"`. Absolute entry names
//!   are joined, not honoured, so `/etc/passwd` lands at `dest/etc/passwd`.
//! - **Limits before creation**: size and count checks run against the tar
//!   header before the destination file is opened, so a rejected entry
//!   leaves nothing on disk.
//! - **Exact copy**: file bodies are copied through a reader limited to the
//!   header size and the byte count is verified afterwards.
//! - **Links and devices**: symlinks, hardlinks, and device nodes are
//!   skipped. Following them would require re-checking the resolved target.
//! - **Cancellation**: checked before every entry and on every read of a
//!   file body. A cancelled extraction stops without opening another file.

use crate::constants::{MAX_FILE_BYTES, MAX_FILE_COUNT, MAX_MANIFEST_BYTES, MAX_TOTAL_EXTRACT_BYTES};
use crate::error::{Error, ResourceLimitKind, Result};
use flate2::read::GzDecoder;
use std::fs;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use tar::{Archive, EntryType};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Per-client extraction limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractLimits {
    pub max_manifest_bytes: u64,
    pub max_file_bytes: u64,
    pub max_total_bytes: u64,
    pub max_file_count: u64,
}

impl Default for ExtractLimits {
    fn default() -> Self {
        Self {
            max_manifest_bytes: MAX_MANIFEST_BYTES,
            max_file_bytes: MAX_FILE_BYTES,
            max_total_bytes: MAX_TOTAL_EXTRACT_BYTES,
            max_file_count: MAX_FILE_COUNT,
        }
    }
}

/// Running totals across all layers of one pull.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractTotals {
    pub bytes: u64,
    pub files: u64,
}

/// Extracts a single layer stream into `dest`.
///
/// Gzip is detected from the stream's magic bytes. `totals` is updated in
/// place and checked against `limits` before every entry is materialized.
pub fn extract_layer<R: Read>(
    cancel: &CancellationToken,
    reader: R,
    dest: &Path,
    limits: &ExtractLimits,
    totals: &mut ExtractTotals,
) -> Result<()> {
    let mut buffered = BufReader::new(reader);
    let gzipped = buffered.fill_buf()?.starts_with(&GZIP_MAGIC);

    if gzipped {
        debug!("Extracting gzip layer into {}", dest.display());
        extract_tar(cancel, GzDecoder::new(buffered), dest, limits, totals)
    } else {
        debug!("Extracting plain tar layer into {}", dest.display());
        extract_tar(cancel, buffered, dest, limits, totals)
    }
}

fn extract_tar<R: Read>(
    cancel: &CancellationToken,
    reader: R,
    dest: &Path,
    limits: &ExtractLimits,
    totals: &mut ExtractTotals,
) -> Result<()> {
    let mut archive = Archive::new(reader);
    let dest_clean = clean_path(&to_slash(dest));
    let cancelled = || Error::Cancelled(format!("extract into {}", dest.display()));

    for entry in archive.entries()? {
        if cancel.is_cancelled() {
            return Err(cancelled());
        }
        let mut entry = entry?;
        let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();

        if name == "." || name == "./" {
            continue;
        }

        // SECURITY: Resolve lexically against the destination and require containment
        let target_clean = clean_path(&format!("{}/{}", dest_clean, name));
        if !is_within(&target_clean, &dest_clean) {
            return Err(Error::PathTraversal { path: name });
        }
        let target = PathBuf::from(&target_clean);

        match entry.header().entry_type() {
            EntryType::Directory => {
                check_count(totals, limits)?;
                fs::create_dir_all(&target)?;
                totals.files += 1;
                trace!(path = %name, "Created directory");
            }
            EntryType::Regular | EntryType::Continuous => {
                let size = entry.header().size()?;

                // SECURITY: All limits are checked before the file is opened
                if size > limits.max_file_bytes {
                    return Err(Error::ResourceLimit {
                        limit: ResourceLimitKind::FileSize,
                        size,
                        max: limits.max_file_bytes,
                    });
                }
                if totals.bytes + size > limits.max_total_bytes {
                    return Err(Error::ResourceLimit {
                        limit: ResourceLimitKind::TotalSize,
                        size: totals.bytes + size,
                        max: limits.max_total_bytes,
                    });
                }
                check_count(totals, limits)?;

                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mut file = fs::File::create(&target)?;
                let mut body = Cancellable {
                    inner: (&mut entry).take(size),
                    cancel,
                };
                let written = match std::io::copy(&mut body, &mut file) {
                    Ok(n) => n,
                    Err(_) if cancel.is_cancelled() => return Err(cancelled()),
                    Err(e) => return Err(e.into()),
                };

                if written != size {
                    return Err(Error::SizeMismatch {
                        subject: name,
                        expected: size,
                        actual: written,
                    });
                }

                totals.bytes += written;
                totals.files += 1;
                trace!(path = %name, size, "Extracted file");
            }
            other => {
                debug!(path = %name, kind = ?other, "Skipping unsupported tar entry");
            }
        }
    }

    Ok(())
}

/// Fails reads once the token is cancelled.
struct Cancellable<'a, R> {
    inner: R,
    cancel: &'a CancellationToken,
}

impl<R: Read> Read for Cancellable<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(std::io::Error::other("extraction cancelled"));
        }
        self.inner.read(buf)
    }
}

fn check_count(totals: &ExtractTotals, limits: &ExtractLimits) -> Result<()> {
    if totals.files + 1 > limits.max_file_count {
        return Err(Error::ResourceLimit {
            limit: ResourceLimitKind::FileCount,
            size: totals.files + 1,
            max: limits.max_file_count,
        });
    }
    Ok(())
}

/// Returns true if `target` equals `dest` or lies below it. Both must be clean.
pub fn is_within(target: &str, dest: &str) -> bool {
    if target == dest {
        return true;
    }
    if dest == "/" {
        return target.starts_with('/');
    }
    target.starts_with(&format!("{}/", dest))
}

fn to_slash(path: &Path) -> String {
    let s = path.to_string_lossy();
    if std::path::MAIN_SEPARATOR == '\\' {
        s.replace('\\', "/")
    } else {
        s.into_owned()
    }
}

/// Lexically cleans a slash-separated path.
///
/// Collapses repeated separators, drops `.` elements, and resolves `..`
/// against preceding elements. Leading `..` survive on relative paths and
/// are dropped on rooted ones.
pub fn clean_path(path: &str) -> String {
    let rooted = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();

    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => match parts.last() {
                Some(&last) if last != ".." => {
                    parts.pop();
                }
                _ if rooted => {}
                _ => parts.push(".."),
            },
            other => parts.push(other),
        }
    }

    let joined = parts.join("/");
    match (rooted, joined.is_empty()) {
        (true, _) => format!("/{}", joined),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

//! Deterministic content fingerprinting for berth
//!
//! This crate provides the content-hashing collaborators consumed by the
//! staging engine:
//! - SHA-256 fingerprints of files, symlinks, and filtered directory trees
//! - Recursive directory copy honoring the same filter semantics, so a
//!   staged copy and its hash always cover the same logical content set
//! - An emptiness probe for transformation output directories
//!
//! # Determinism
//!
//! Directory walks are sorted by file name, so a fingerprint is stable
//! across runs and across machines given unchanged content and unchanged
//! filter configuration. The filter configuration and optional extra salt
//! are folded into the digest: the same bytes hashed under different
//! filters yield different fingerprints.

mod filter;

pub use filter::{FilterMatcher, FilterSet};

use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Errors from fingerprinting and filtered copy operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Underlying I/O failure with path context.
    #[error("I/O {operation} failed: {}", path.display())]
    Io {
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
        /// Path that caused the error.
        path: PathBuf,
        /// Operation that failed (e.g., "open", "read", "copy").
        operation: String,
    },

    /// Invalid glob pattern in a filter set.
    #[error("Invalid filter pattern '{pattern}': {reason}")]
    InvalidPattern {
        /// The pattern that failed to compile.
        pattern: String,
        /// Why it is invalid.
        reason: String,
    },

    /// Entry kind that cannot be fingerprinted or copied (sockets, FIFOs).
    #[error("Unsupported file type: {}", path.display())]
    UnsupportedFileType {
        /// The offending path.
        path: PathBuf,
    },

    /// Directory traversal failure.
    #[error("Directory walk failed: {0}")]
    Walk(#[from] walkdir::Error),
}

/// Result type for fingerprint operations.
pub type Result<T> = std::result::Result<T, Error>;

fn io_err(source: std::io::Error, path: &Path, operation: &str) -> Error {
    Error::Io {
        source,
        path: path.to_path_buf(),
        operation: operation.to_string(),
    }
}

/// Options controlling fingerprint computation.
#[derive(Debug, Clone, Default)]
pub struct FingerprintOptions {
    /// Extra salt folded into the digest before any content.
    pub extra_hash: Option<String>,
    /// Entry selection filters, also honored by [`copy_directory`].
    pub filters: FilterSet,
}

/// Compute a deterministic SHA-256 fingerprint of a file, symlink, or
/// filtered directory tree.
///
/// The digest covers the filter configuration, the optional extra salt,
/// relative entry paths with their kinds, file contents, and symlink
/// targets (links are recorded, not followed).
///
/// # Errors
///
/// Returns an error on I/O failures, invalid filter patterns, or
/// unsupported entry kinds.
pub fn fingerprint(path: &Path, options: &FingerprintOptions) -> Result<String> {
    let _span = tracing::debug_span!("fingerprint", path = %path.display()).entered();

    let matcher = options.filters.matcher()?;
    let mut hasher = Sha256::new();

    if let Some(salt) = &options.extra_hash {
        hasher.update(b"salt:");
        hasher.update(salt.as_bytes());
        hasher.update(b"\n");
    }
    // The filter configuration is observable input: the same bytes hashed
    // under different filters must not collide.
    for pattern in &options.filters.include {
        hasher.update(b"include:");
        hasher.update(pattern.as_bytes());
        hasher.update(b"\n");
    }
    for pattern in &options.filters.exclude {
        hasher.update(b"exclude:");
        hasher.update(pattern.as_bytes());
        hasher.update(b"\n");
    }

    let meta = fs::symlink_metadata(path).map_err(|e| io_err(e, path, "metadata"))?;
    let file_type = meta.file_type();
    if file_type.is_file() {
        hash_file_into(&mut hasher, path)?;
    } else if file_type.is_dir() {
        hash_directory_into(&mut hasher, path, &matcher)?;
    } else if file_type.is_symlink() {
        let target = fs::read_link(path).map_err(|e| io_err(e, path, "read_link"))?;
        hasher.update(b"link:");
        hasher.update(target.as_os_str().as_encoded_bytes());
    } else {
        return Err(Error::UnsupportedFileType {
            path: path.to_path_buf(),
        });
    }

    let digest = hex::encode(hasher.finalize());
    tracing::trace!(path = %path.display(), digest = %digest, "Fingerprint computed");
    Ok(digest)
}

fn hash_file_into(hasher: &mut Sha256, path: &Path) -> Result<()> {
    let mut file = fs::File::open(path).map_err(|e| io_err(e, path, "open"))?;
    let mut buf = [0u8; 1024 * 64];
    loop {
        let n = file.read(&mut buf).map_err(|e| io_err(e, path, "read"))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(())
}

fn hash_directory_into(hasher: &mut Sha256, root: &Path, matcher: &FilterMatcher) -> Result<()> {
    for entry in filtered_walk(root, matcher) {
        let entry = entry?;
        let Ok(rel) = entry.path().strip_prefix(root) else {
            continue;
        };
        if rel.as_os_str().is_empty() {
            continue;
        }

        let file_type = entry.file_type();
        if file_type.is_dir() {
            hasher.update(b"dir:");
            hasher.update(rel.as_os_str().as_encoded_bytes());
            hasher.update(b"\n");
        } else if file_type.is_symlink() {
            if !matcher.selects(rel) {
                continue;
            }
            let target =
                fs::read_link(entry.path()).map_err(|e| io_err(e, entry.path(), "read_link"))?;
            hasher.update(b"link:");
            hasher.update(rel.as_os_str().as_encoded_bytes());
            hasher.update(b"->");
            hasher.update(target.as_os_str().as_encoded_bytes());
            hasher.update(b"\n");
        } else if file_type.is_file() {
            if !matcher.selects(rel) {
                continue;
            }
            hasher.update(b"file:");
            hasher.update(rel.as_os_str().as_encoded_bytes());
            hasher.update(b"\n");
            hash_file_into(hasher, entry.path())?;
        } else {
            return Err(Error::UnsupportedFileType {
                path: entry.path().to_path_buf(),
            });
        }
    }
    Ok(())
}

/// Sorted walk over `root`, pruning excluded subtrees. The root entry
/// itself is always kept.
fn filtered_walk<'a>(
    root: &'a Path,
    matcher: &'a FilterMatcher,
) -> impl Iterator<Item = walkdir::Result<walkdir::DirEntry>> + 'a {
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(move |entry| match entry.path().strip_prefix(root) {
            Ok(rel) if rel.as_os_str().is_empty() => true,
            Ok(rel) => matcher.descends_into(rel),
            Err(_) => true,
        })
}

/// Recursively copy `source` into `target`, honoring the same filter
/// semantics as [`fingerprint`].
///
/// Directories that survive exclusion are recreated (including empty
/// ones); include patterns apply to files and symlinks only. Symlinks are
/// recreated as links on Unix and copied through on other platforms.
///
/// # Errors
///
/// Returns an error on I/O failures, invalid filter patterns, or
/// unsupported entry kinds.
pub fn copy_directory(source: &Path, target: &Path, filters: &FilterSet) -> Result<()> {
    let _span = tracing::debug_span!(
        "copy_directory",
        source = %source.display(),
        target = %target.display()
    )
    .entered();

    let matcher = filters.matcher()?;
    fs::create_dir_all(target).map_err(|e| io_err(e, target, "create_dir_all"))?;

    let mut copied = 0u64;
    for entry in filtered_walk(source, &matcher) {
        let entry = entry?;
        let Ok(rel) = entry.path().strip_prefix(source) else {
            continue;
        };
        if rel.as_os_str().is_empty() {
            continue;
        }
        let dest = target.join(rel);

        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&dest).map_err(|e| io_err(e, &dest, "create_dir_all"))?;
        } else if file_type.is_symlink() {
            if !matcher.selects(rel) {
                continue;
            }
            copy_symlink(entry.path(), &dest)?;
            copied += 1;
        } else if file_type.is_file() {
            if !matcher.selects(rel) {
                continue;
            }
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).map_err(|e| io_err(e, parent, "create_dir_all"))?;
            }
            fs::copy(entry.path(), &dest).map_err(|e| io_err(e, &dest, "copy"))?;
            copied += 1;
        } else {
            return Err(Error::UnsupportedFileType {
                path: entry.path().to_path_buf(),
            });
        }
    }

    tracing::debug!(entries = copied, "Directory copy complete");
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(link: &Path, dest: &Path) -> Result<()> {
    let target = fs::read_link(link).map_err(|e| io_err(e, link, "read_link"))?;
    std::os::unix::fs::symlink(&target, dest).map_err(|e| io_err(e, dest, "symlink"))
}

#[cfg(not(unix))]
fn copy_symlink(link: &Path, dest: &Path) -> Result<()> {
    // No portable link recreation; copy the resolved content instead.
    fs::copy(link, dest)
        .map(|_| ())
        .map_err(|e| io_err(e, dest, "copy"))
}

/// Whether `directory` contains no entries at all.
///
/// # Errors
///
/// Returns an error if the directory cannot be read.
pub fn is_empty(directory: &Path) -> Result<bool> {
    let mut entries = fs::read_dir(directory).map_err(|e| io_err(e, directory, "read_dir"))?;
    Ok(entries.next().is_none())
}

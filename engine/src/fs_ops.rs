//! Filesystem operations module.
//!
//! This module provides low-level operations for:
//! - Enumerating the contents of a media folder
//! - Copying files in chunks with progress and modification time preservation
//! - Creating parent directories

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use crate::error::EngineError;
use crate::progress::ProgressSink;

/// Chunk size used when copying a file.
pub const COPY_CHUNK: usize = 1024 * 1024;

/// Enumerate a media folder recursively.
///
/// Directories are listed before their contents and entries are sorted by
/// name at every level, so the order is stable across runs. The root itself
/// is included as the first entry.
///
/// # Errors
/// Returns EngineError if the root cannot be read.
pub fn enumerate_tree(root: &Path) -> Result<Vec<PathBuf>, EngineError> {
    let mut items = vec![root.to_path_buf()];

    fn recurse(path: &Path, items: &mut Vec<PathBuf>) -> Result<(), EngineError> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(path).map_err(|e| EngineError::EnumerationFailed {
            path: path.to_path_buf(),
            source: e,
        })? {
            let entry = entry.map_err(|e| EngineError::EnumerationFailed {
                path: path.to_path_buf(),
                source: e,
            })?;
            let is_dir = entry
                .file_type()
                .map_err(|e| EngineError::EnumerationFailed {
                    path: entry.path(),
                    source: e,
                })?
                .is_dir();
            entries.push((entry.path(), is_dir));
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        for (entry_path, is_dir) in entries {
            items.push(entry_path.clone());
            if is_dir {
                recurse(&entry_path, items)?;
            }
        }
        Ok(())
    }

    recurse(root, &mut items)?;
    Ok(items)
}

/// How a chunked copy ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkedCopy {
    Completed { bytes: u64 },
    /// The progress sink asked to stop; the partial destination was removed
    Stopped { bytes: u64 },
}

/// Copy a file in chunks, reporting progress after each one.
///
/// The parent directory of `dst` is created if needed and the source
/// modification time is carried over.
///
/// # Errors
/// Returns EngineError if reading or writing fails.
pub fn copy_file_with_progress(
    src: &Path,
    dst: &Path,
    sink: &mut dyn ProgressSink,
) -> Result<ChunkedCopy, EngineError> {
    ensure_parent_dir_exists(dst)?;

    let mut src_file = fs::File::open(src).map_err(|e| EngineError::ReadError {
        path: src.to_path_buf(),
        source: e,
    })?;
    let src_metadata = src_file.metadata().map_err(|e| EngineError::ReadError {
        path: src.to_path_buf(),
        source: e,
    })?;
    let total = src_metadata.len();

    let mut dst_file = fs::File::create(dst).map_err(|e| EngineError::WriteError {
        path: dst.to_path_buf(),
        source: e,
    })?;

    let mut buffer = vec![0u8; COPY_CHUNK];
    let mut copied: u64 = 0;

    loop {
        let n = match src_file.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(EngineError::ReadError {
                    path: src.to_path_buf(),
                    source: e,
                })
            }
        };
        dst_file
            .write_all(&buffer[..n])
            .map_err(|e| EngineError::WriteError {
                path: dst.to_path_buf(),
                source: e,
            })?;
        copied += n as u64;

        if !sink.report(copied, total) {
            drop(dst_file);
            let _ = fs::remove_file(dst);
            return Ok(ChunkedCopy::Stopped { bytes: copied });
        }
    }

    if total == 0 && !sink.report(0, 0) {
        drop(dst_file);
        let _ = fs::remove_file(dst);
        return Ok(ChunkedCopy::Stopped { bytes: 0 });
    }

    dst_file.flush().map_err(|e| EngineError::WriteError {
        path: dst.to_path_buf(),
        source: e,
    })?;
    drop(dst_file);

    // Preserve modification time if available
    if let Ok(mtime) = src_metadata.modified() {
        let _ = filetime::set_file_mtime(dst, filetime::FileTime::from_system_time(mtime));
    }

    Ok(ChunkedCopy::Completed { bytes: copied })
}

/// Ensure the parent directory of a path exists, creating it if necessary.
///
/// # Errors
/// Returns EngineError if directory creation fails
pub fn ensure_parent_dir_exists(path: &Path) -> Result<(), EngineError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => return Ok(()),
    };

    match fs::metadata(parent) {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => Err(EngineError::DirectoryCreationFailed {
            path: parent.to_path_buf(),
            source: io::Error::new(
                io::ErrorKind::AlreadyExists,
                "Parent path exists but is not a directory",
            ),
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            fs::create_dir_all(parent).map_err(|e| EngineError::DirectoryCreationFailed {
                path: parent.to_path_buf(),
                source: e,
            })
        }
        Err(e) => Err(EngineError::DirectoryCreationFailed {
            path: parent.to_path_buf(),
            source: e,
        }),
    }
}

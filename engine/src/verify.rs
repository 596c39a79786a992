//! Post-copy file verification.
//!
//! This module provides three strategies for confirming that a destination
//! file matches its source:
//! - Size: compare lengths on disk
//! - Content: size check, then a chunked byte-for-byte comparison
//! - MD5: streaming digests of both files
//!
//! Verification never modifies either file and never returns an error: every
//! outcome, including unreadable files, is a `VerifyFileResult`.

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Buffer size for the byte-for-byte comparison.
const CONTENT_CHUNK: usize = 1024 * 1024;

/// Read size for MD5 digests.
const MD5_CHUNK: usize = 4096;

/// Verification strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifyOption {
    Size,
    Content,
    Md5,
}

impl fmt::Display for VerifyOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Size => write!(f, "size"),
            Self::Content => write!(f, "content"),
            Self::Md5 => write!(f, "md5"),
        }
    }
}

impl VerifyOption {
    /// Parse option from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "size" => Some(Self::Size),
            "content" | "byte" | "bytes" => Some(Self::Content),
            "md5" => Some(Self::Md5),
            _ => None,
        }
    }
}

/// Outcome of comparing a destination file with its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerifyFileResult {
    Equal,
    SizeDifferent,
    ContentDifferent,
    Md5Different,
    /// A file exists but could not be read
    FileBad,
    FileNotExist,
}

impl VerifyFileResult {
    pub fn is_equal(&self) -> bool {
        *self == VerifyFileResult::Equal
    }
}

impl fmt::Display for VerifyFileResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Equal => "files are equal",
            Self::SizeDifferent => "file sizes differ",
            Self::ContentDifferent => "file contents differ",
            Self::Md5Different => "MD5 digests differ",
            Self::FileBad => "file could not be read",
            Self::FileNotExist => "file does not exist",
        };
        f.write_str(text)
    }
}

/// Compare `dest` against `src` with the given strategy.
///
/// Returns the result together with a human-readable report naming both
/// files (and, for MD5, both digests).
pub fn verify_files(option: VerifyOption, src: &Path, dest: &Path) -> (VerifyFileResult, String) {
    for path in [src, dest] {
        if !path.is_file() {
            return (
                VerifyFileResult::FileNotExist,
                format!("File does not exist: {}", path.display()),
            );
        }
    }

    match option {
        VerifyOption::Size => verify_size(src, dest),
        VerifyOption::Content => verify_content(src, dest),
        VerifyOption::Md5 => verify_md5(src, dest),
    }
}

fn file_size(path: &Path) -> Result<u64, (VerifyFileResult, String)> {
    std::fs::metadata(path).map(|m| m.len()).map_err(|e| bad_file(path, &e))
}

fn bad_file(path: &Path, err: &io::Error) -> (VerifyFileResult, String) {
    (
        VerifyFileResult::FileBad,
        format!("Cannot read {}: {}", path.display(), err),
    )
}

fn verify_size(src: &Path, dest: &Path) -> (VerifyFileResult, String) {
    let (src_size, dest_size) = match (file_size(src), file_size(dest)) {
        (Ok(a), Ok(b)) => (a, b),
        (Err(e), _) | (_, Err(e)) => return e,
    };

    if src_size == dest_size {
        (
            VerifyFileResult::Equal,
            format!("{} and {} are both {} bytes", src.display(), dest.display(), src_size),
        )
    } else {
        (
            VerifyFileResult::SizeDifferent,
            format!(
                "Size mismatch: {} is {} bytes, {} is {} bytes",
                src.display(),
                src_size,
                dest.display(),
                dest_size
            ),
        )
    }
}

fn verify_content(src: &Path, dest: &Path) -> (VerifyFileResult, String) {
    let (result, report) = verify_size(src, dest);
    if !result.is_equal() {
        return (result, report);
    }

    let mut src_file = match File::open(src) {
        Ok(f) => f,
        Err(e) => return bad_file(src, &e),
    };
    let mut dest_file = match File::open(dest) {
        Ok(f) => f,
        Err(e) => return bad_file(dest, &e),
    };

    let mut src_buf = vec![0u8; CONTENT_CHUNK];
    let mut dest_buf = vec![0u8; CONTENT_CHUNK];
    let mut offset: u64 = 0;

    loop {
        let n = match read_full(&mut src_file, &mut src_buf) {
            Ok(n) => n,
            Err(e) => return bad_file(src, &e),
        };
        let m = match read_full(&mut dest_file, &mut dest_buf) {
            Ok(m) => m,
            Err(e) => return bad_file(dest, &e),
        };

        if n != m || src_buf[..n] != dest_buf[..m] {
            let first_diff = src_buf[..n]
                .iter()
                .zip(&dest_buf[..m])
                .position(|(a, b)| a != b)
                .unwrap_or(n.min(m));
            return (
                VerifyFileResult::ContentDifferent,
                format!(
                    "Content mismatch between {} and {} at byte {}",
                    src.display(),
                    dest.display(),
                    offset + first_diff as u64
                ),
            );
        }
        if n == 0 {
            break;
        }
        offset += n as u64;
    }

    (
        VerifyFileResult::Equal,
        format!("{} and {} are identical ({} bytes)", src.display(), dest.display(), offset),
    )
}

/// Fill `buf` as far as the reader allows; short only at end of file.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn verify_md5(src: &Path, dest: &Path) -> (VerifyFileResult, String) {
    let src_digest = match compute_md5(src) {
        Ok(d) => d,
        Err(e) => return bad_file(src, &e),
    };
    let dest_digest = match compute_md5(dest) {
        Ok(d) => d,
        Err(e) => return bad_file(dest, &e),
    };

    let report = format!(
        "MD5 {}: {}\nMD5 {}: {}",
        src.display(),
        src_digest,
        dest.display(),
        dest_digest
    );
    if src_digest == dest_digest {
        (VerifyFileResult::Equal, report)
    } else {
        (VerifyFileResult::Md5Different, report)
    }
}

/// Lowercase hex MD5 digest of a file, read in 4 KiB chunks.
pub fn compute_md5(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut context = md5::Context::new();
    let mut buffer = [0u8; MD5_CHUNK];

    loop {
        match file.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => context.consume(&buffer[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(format!("{:x}", context.compute()))
}

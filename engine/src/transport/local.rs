//! Local folder destination.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::TransferDriver;
use crate::error::{DriverError, EngineError};
use crate::fs_ops::{self, ChunkedCopy};
use crate::progress::ProgressSink;

/// Driver for a destination folder on a local or mounted filesystem.
#[derive(Debug)]
pub struct LocalDriver {
    root: PathBuf,
    connected: bool,
}

impl LocalDriver {
    pub fn new(root: PathBuf) -> Self {
        LocalDriver {
            root,
            connected: false,
        }
    }

    fn check_connected(&self) -> Result<(), DriverError> {
        if self.connected {
            Ok(())
        } else {
            Err(DriverError::NotConnected)
        }
    }
}

fn display(path: &Path) -> String {
    path.display().to_string()
}

impl TransferDriver for LocalDriver {
    fn describe(&self) -> String {
        display(&self.root)
    }

    fn connect(&mut self) -> Result<(), DriverError> {
        // The destination folder may not exist yet, but something on the way
        // to it must be writable.
        match self.ensure_directory_inner(&self.root, true) {
            Ok(_) => {
                self.connected = true;
                Ok(())
            }
            Err(DriverError::DirectoryCreation { message, .. }) => Err(DriverError::Connect {
                endpoint: display(&self.root),
                message,
            }),
            Err(e) => Err(e),
        }
    }

    fn ensure_directory(&mut self, path: &Path, create_if_missing: bool) -> Result<bool, DriverError> {
        self.check_connected()?;
        self.ensure_directory_inner(path, create_if_missing)
    }

    fn exists(&mut self, path: &Path, is_directory: bool) -> Result<bool, DriverError> {
        self.check_connected()?;
        match fs::metadata(path) {
            Ok(metadata) => Ok(metadata.is_dir() == is_directory),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(DriverError::io(display(path), e)),
        }
    }

    fn upload(
        &mut self,
        local: &Path,
        remote: &Path,
        sink: &mut dyn ProgressSink,
    ) -> Result<u64, DriverError> {
        self.check_connected()?;
        if let Some(parent) = remote.parent() {
            self.ensure_directory_inner(parent, true)?;
        }

        match fs_ops::copy_file_with_progress(local, remote, sink) {
            Ok(ChunkedCopy::Completed { bytes }) => Ok(bytes),
            Ok(ChunkedCopy::Stopped { bytes }) => {
                debug!(path = %remote.display(), bytes, "local copy stopped");
                Err(DriverError::Cancelled)
            }
            Err(EngineError::ReadError { path, source }) | Err(EngineError::WriteError { path, source }) => {
                Err(DriverError::io(display(&path), source))
            }
            Err(EngineError::DirectoryCreationFailed { path, source }) => Err(DriverError::DirectoryCreation {
                path: display(&path),
                message: source.to_string(),
            }),
            Err(other) => Err(DriverError::Transfer {
                path: display(remote),
                message: other.to_string(),
            }),
        }
    }

    fn delete(&mut self, path: &Path) -> Result<(), DriverError> {
        self.check_connected()?;
        fs::remove_file(path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                DriverError::NotFound { path: display(path) }
            } else {
                DriverError::io(display(path), e)
            }
        })
    }

    fn close(&mut self) {
        self.connected = false;
    }
}

impl LocalDriver {
    fn ensure_directory_inner(&self, path: &Path, create_if_missing: bool) -> Result<bool, DriverError> {
        // Shallowest first, so components are created one level at a time.
        let mut levels: Vec<&Path> = path.ancestors().filter(|p| !p.as_os_str().is_empty()).collect();
        levels.reverse();

        for level in levels {
            if level.is_dir() {
                continue;
            }
            if !create_if_missing {
                return Ok(false);
            }
            if let Err(e) = fs::create_dir(level) {
                if e.kind() != io::ErrorKind::AlreadyExists {
                    return Err(DriverError::DirectoryCreation {
                        path: display(level),
                        message: e.to_string(),
                    });
                }
            }
            if !level.is_dir() {
                return Err(DriverError::DirectoryCreation {
                    path: display(level),
                    message: "a file is in the way".to_string(),
                });
            }
        }
        Ok(true)
    }
}

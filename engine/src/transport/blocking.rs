//! FTP over the `ftp` crate's synchronous session.
//!
//! Directory walks change the remote working directory one component at a
//! time, starting from the server root.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::thread;
use std::time::Duration;

use ftp::types::FileType;
use ftp::{FtpError, FtpStream};
use tracing::{debug, info, warn};

use super::{remote_components, remote_path_string, split_remote, TransferDriver};
use crate::config::RemoteSettings;
use crate::error::DriverError;
use crate::progress::ProgressSink;

/// Pause between connection attempts, multiplied by the attempt number.
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Replies that can follow an interrupted STOR.
const STOR_CLOSING_CODES: [u32; 6] = [226, 250, 425, 426, 450, 451];

/// FTP session where every request blocks the calling thread until the
/// server answers.
pub struct BlockingFtpDriver {
    settings: RemoteSettings,
    stream: Option<FtpStream>,
}

impl BlockingFtpDriver {
    pub fn new(settings: RemoteSettings) -> Self {
        BlockingFtpDriver {
            settings,
            stream: None,
        }
    }

    fn open_session(&self) -> Result<FtpStream, DriverError> {
        let endpoint = self.settings.endpoint();
        let mut stream = FtpStream::connect(endpoint.as_str()).map_err(|e| DriverError::Connect {
            endpoint: endpoint.clone(),
            message: e.to_string(),
        })?;

        let timeout = Some(Duration::from_secs(self.settings.timeout_secs.max(1)));
        let _ = stream.get_ref().set_read_timeout(timeout);
        let _ = stream.get_ref().set_write_timeout(timeout);

        stream
            .login(&self.settings.user_name, &self.settings.password)
            .map_err(|e| login_error(&endpoint, e))?;
        stream
            .transfer_type(FileType::Binary)
            .map_err(|e| DriverError::Connect {
                endpoint: endpoint.clone(),
                message: e.to_string(),
            })?;
        Ok(stream)
    }

    fn stream(&mut self) -> Result<&mut FtpStream, DriverError> {
        self.stream.as_mut().ok_or(DriverError::NotConnected)
    }

    /// Change into `components` starting at the server root.
    fn walk(&mut self, components: &[String], create_if_missing: bool) -> Result<bool, DriverError> {
        let stream = self.stream()?;
        stream.cwd("/").map_err(|e| request_error("/", e))?;

        let mut current = String::new();
        for component in components {
            current.push('/');
            current.push_str(component);

            match stream.cwd(component) {
                Ok(()) => continue,
                Err(FtpError::ConnectionError(e)) => return Err(DriverError::io(current, e)),
                Err(_) if !create_if_missing => return Ok(false),
                Err(_) => {}
            }

            debug!(path = %current, "creating remote directory");
            match stream.mkdir(component) {
                Ok(()) => {}
                Err(FtpError::ConnectionError(e)) => return Err(DriverError::io(current, e)),
                // May already exist (created concurrently); the cwd decides.
                Err(e) => debug!(path = %current, error = %e, "MKD refused"),
            }
            stream.cwd(component).map_err(|e| DriverError::DirectoryCreation {
                path: current.clone(),
                message: e.to_string(),
            })?;
        }
        Ok(true)
    }
}

fn login_error(endpoint: &str, err: FtpError) -> DriverError {
    match err {
        FtpError::InvalidResponse(message) if message.contains("530") => DriverError::AccessDenied {
            endpoint: endpoint.to_string(),
            message: message.trim().to_string(),
        },
        other => DriverError::Connect {
            endpoint: endpoint.to_string(),
            message: other.to_string(),
        },
    }
}

fn request_error(path: &str, err: FtpError) -> DriverError {
    match err {
        FtpError::ConnectionError(e) => DriverError::io(path, e),
        other => DriverError::Transfer {
            path: path.to_string(),
            message: other.to_string(),
        },
    }
}

/// Reader that reports each chunk to the sink and fails once it says stop.
struct ProgressReader<'a, R> {
    inner: R,
    sent: u64,
    total: u64,
    sink: &'a mut dyn ProgressSink,
    stopped: bool,
}

impl<R: Read> Read for ProgressReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.stopped {
            return Err(io::Error::new(io::ErrorKind::Other, "transfer canceled"));
        }
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.sent += n as u64;
            if !self.sink.report(self.sent, self.total) {
                self.stopped = true;
                return Err(io::Error::new(io::ErrorKind::Other, "transfer canceled"));
            }
        }
        Ok(n)
    }
}

impl TransferDriver for BlockingFtpDriver {
    fn describe(&self) -> String {
        format!("FTP server {}", self.settings.endpoint())
    }

    fn connect(&mut self) -> Result<(), DriverError> {
        self.close();
        let attempts = self.settings.retry_count + 1;
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.open_session() {
                Ok(stream) => {
                    info!(endpoint = %self.settings.endpoint(), attempt, "FTP session opened");
                    self.stream = Some(stream);
                    return Ok(());
                }
                Err(e @ DriverError::AccessDenied { .. }) => return Err(e),
                Err(e) => {
                    warn!(endpoint = %self.settings.endpoint(), attempt, error = %e, "FTP connect failed");
                    last_error = Some(e);
                    if attempt < attempts {
                        thread::sleep(RETRY_BACKOFF * attempt);
                    }
                }
            }
        }
        Err(last_error.unwrap_or(DriverError::NotConnected))
    }

    fn ensure_directory(&mut self, path: &Path, create_if_missing: bool) -> Result<bool, DriverError> {
        self.walk(&remote_components(path), create_if_missing)
    }

    fn exists(&mut self, path: &Path, is_directory: bool) -> Result<bool, DriverError> {
        if is_directory {
            return self.walk(&remote_components(path), false);
        }
        let (parent, name) = split_remote(path)?;
        if !self.walk(&parent, false)? {
            return Ok(false);
        }
        match self.stream()?.size(&name) {
            Ok(_) => Ok(true),
            Err(FtpError::ConnectionError(e)) => Err(DriverError::io(remote_path_string(path), e)),
            Err(_) => Ok(false),
        }
    }

    fn upload(
        &mut self,
        local: &Path,
        remote: &Path,
        sink: &mut dyn ProgressSink,
    ) -> Result<u64, DriverError> {
        let remote_string = remote_path_string(remote);
        let (parent, name) = split_remote(remote)?;
        self.walk(&parent, true)?;

        let file = File::open(local).map_err(|e| DriverError::io(local.display().to_string(), e))?;
        let total = file
            .metadata()
            .map_err(|e| DriverError::io(local.display().to_string(), e))?
            .len();
        let mut reader = ProgressReader {
            inner: file,
            sent: 0,
            total,
            sink,
            stopped: false,
        };

        let stream = self.stream()?;
        match stream.put(&name, &mut reader) {
            Ok(()) => {
                debug!(path = %remote_string, bytes = reader.sent, "upload complete");
                Ok(reader.sent)
            }
            Err(_) if reader.stopped => {
                // The data connection is gone; collect the server's verdict on
                // it so the next request reads its own reply.
                let _ = stream.read_response_in(&STOR_CLOSING_CODES);
                if let Err(e) = stream.rm(&name) {
                    debug!(path = %remote_string, error = %e, "partial file not removed");
                }
                info!(path = %remote_string, bytes = reader.sent, "upload canceled");
                Err(DriverError::Cancelled)
            }
            Err(e) => Err(request_error(&remote_string, e)),
        }
    }

    fn delete(&mut self, path: &Path) -> Result<(), DriverError> {
        let remote_string = remote_path_string(path);
        let (parent, name) = split_remote(path)?;
        if !self.walk(&parent, false)? {
            return Err(DriverError::NotFound { path: remote_string });
        }
        match self.stream()?.rm(&name) {
            Ok(()) => Ok(()),
            Err(FtpError::ConnectionError(e)) => Err(DriverError::io(remote_string, e)),
            Err(_) => Err(DriverError::NotFound { path: remote_string }),
        }
    }

    fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.quit() {
                debug!(error = %e, "QUIT failed");
            }
            info!(endpoint = %self.settings.endpoint(), "FTP session closed");
        }
    }
}

impl Drop for BlockingFtpDriver {
    fn drop(&mut self) {
        self.close();
    }
}

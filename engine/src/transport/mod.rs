//! Transfer drivers.
//!
//! A `TransferDriver` owns one connection to a destination and offers the
//! small set of synchronous requests the export loop needs. Three drivers
//! implement it:
//!
//! - `LocalDriver`: a folder on the local filesystem
//! - `BlockingFtpDriver`: an FTP session where every request blocks until the
//!   server answers
//! - `EventLoopFtpDriver`: an FTP session whose requests are streams driven by
//!   an event loop; the driver runs the loop until the request's terminal event
//!   so callers see the same blocking contract
//!
//! Paths handed to a driver are absolute destination paths. Remote drivers
//! interpret them as slash-separated paths on the server.

mod blocking;
mod event_loop;
mod local;

use std::path::{Component, Path};

pub use blocking::BlockingFtpDriver;
pub use event_loop::EventLoopFtpDriver;
pub use local::LocalDriver;

use crate::config::TransportBackend;
use crate::error::{DriverError, EngineError};
use crate::model::Destination;
use crate::progress::ProgressSink;

/// Synchronous requests against one export destination.
pub trait TransferDriver: Send {
    /// Human-readable endpoint, used in messages.
    fn describe(&self) -> String;

    /// Open and authenticate the connection.
    fn connect(&mut self) -> Result<(), DriverError>;

    /// Walk `path` from the root one component at a time.
    ///
    /// With `create_if_missing` each missing component is created and then
    /// entered to confirm it exists; failure to do so is a
    /// `DirectoryCreation` error. Without it the first missing component
    /// yields `Ok(false)` and nothing is changed.
    fn ensure_directory(&mut self, path: &Path, create_if_missing: bool) -> Result<bool, DriverError>;

    /// Whether a file (or, with `is_directory`, a directory) exists.
    fn exists(&mut self, path: &Path, is_directory: bool) -> Result<bool, DriverError>;

    /// Copy `local` to `remote`, creating the remote parent directory when
    /// needed. Returns the number of bytes sent.
    ///
    /// The sink is called after every chunk; when it returns false the
    /// transfer stops with `DriverError::Cancelled`, the partial file is
    /// removed and the connection stays usable.
    fn upload(
        &mut self,
        local: &Path,
        remote: &Path,
        sink: &mut dyn ProgressSink,
    ) -> Result<u64, DriverError>;

    fn delete(&mut self, path: &Path) -> Result<(), DriverError>;

    /// Close the connection. Later calls are no-ops.
    fn close(&mut self);
}

/// Build the driver for a destination.
pub fn create_driver(destination: &Destination) -> Result<Box<dyn TransferDriver>, EngineError> {
    match destination {
        Destination::Local { folder } => Ok(Box::new(LocalDriver::new(folder.clone()))),
        Destination::Remote(settings) => {
            settings.validate()?;
            match settings.backend {
                TransportBackend::Blocking => Ok(Box::new(BlockingFtpDriver::new(settings.clone()))),
                TransportBackend::EventLoop => Ok(Box::new(EventLoopFtpDriver::new(settings.clone())?)),
            }
        }
    }
}

/// Normal components of a destination path, as strings.
pub(crate) fn remote_components(path: &Path) -> Vec<String> {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect()
}

/// Slash-separated absolute form of a destination path.
pub(crate) fn remote_path_string(path: &Path) -> String {
    format!("/{}", remote_components(path).join("/"))
}

/// Split a destination file path into its parent components and file name.
pub(crate) fn split_remote(path: &Path) -> Result<(Vec<String>, String), DriverError> {
    let mut components = remote_components(path);
    let name = components.pop().ok_or_else(|| DriverError::NotFound {
        path: remote_path_string(path),
    })?;
    Ok((components, name))
}

/// Parse the address out of a `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)`
/// reply.
pub(crate) fn parse_pasv_reply(text: &str) -> Option<std::net::SocketAddrV4> {
    let start = text.find('(')?;
    let end = text[start..].find(')')? + start;
    let numbers: Vec<u8> = text[start + 1..end]
        .split(',')
        .map(|n| n.trim().parse::<u8>())
        .collect::<Result<_, _>>()
        .ok()?;
    if numbers.len() != 6 {
        return None;
    }
    let ip = std::net::Ipv4Addr::new(numbers[0], numbers[1], numbers[2], numbers[3]);
    let port = (numbers[4] as u16) << 8 | numbers[5] as u16;
    Some(std::net::SocketAddrV4::new(ip, port))
}

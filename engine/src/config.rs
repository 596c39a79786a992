//! Destination settings.
//!
//! Remote settings can be loaded from a JSON file and then overridden from
//! the environment; the CLI applies its own flags on top.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::model::OverwritePolicy;

pub const DEFAULT_FTP_PORT: u16 = 21;
pub const DEFAULT_RETRY_COUNT: u32 = 2;

/// Which transport implementation drives an FTP session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportBackend {
    /// Every request blocks the worker thread until the server answers
    #[default]
    Blocking,
    /// Requests are streams driven by an event loop until their terminal event
    EventLoop,
}

impl TransportBackend {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "blocking" => Some(Self::Blocking),
            "event-loop" | "eventloop" | "event_loop" => Some(Self::EventLoop),
            _ => None,
        }
    }
}

/// Connection settings for an FTP destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteSettings {
    pub server_name: String,
    pub port: u16,
    /// Directory on the server the export is rooted at
    pub remote_directory: String,
    pub user_name: String,
    pub password: String,
    /// Extra connection attempts after a transient failure
    pub retry_count: u32,
    pub backend: TransportBackend,
    /// Control and data socket timeout
    pub timeout_secs: u64,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            server_name: String::new(),
            port: DEFAULT_FTP_PORT,
            remote_directory: "/".to_string(),
            user_name: "anonymous".to_string(),
            password: String::new(),
            retry_count: DEFAULT_RETRY_COUNT,
            backend: TransportBackend::default(),
            timeout_secs: 30,
        }
    }
}

impl RemoteSettings {
    /// `host:port`, as used in messages and socket addresses.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.server_name, self.port)
    }

    /// Remote directory as an absolute, slash-separated path.
    pub fn remote_root(&self) -> String {
        let trimmed = self.remote_directory.trim().trim_matches('/');
        if trimmed.is_empty() {
            "/".to_string()
        } else {
            format!("/{}", trimmed)
        }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.server_name.trim().is_empty() {
            return Err(EngineError::InvalidSettings {
                message: "server name is empty".to_string(),
            });
        }
        if self.port == 0 {
            return Err(EngineError::InvalidSettings {
                message: "port must be non-zero".to_string(),
            });
        }
        Ok(())
    }

    /// Apply overrides from a variable lookup (the process environment in
    /// production).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), EngineError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(server) = lookup("MEDIA_EXPORT_FTP_SERVER") {
            self.server_name = server;
        }
        if let Some(port) = lookup("MEDIA_EXPORT_FTP_PORT") {
            self.port = port.parse().map_err(|_| EngineError::InvalidSettings {
                message: format!("MEDIA_EXPORT_FTP_PORT is not a port number: {}", port),
            })?;
        }
        if let Some(user) = lookup("MEDIA_EXPORT_FTP_USER") {
            self.user_name = user;
        }
        if let Some(password) = lookup("MEDIA_EXPORT_FTP_PASSWORD") {
            self.password = password;
        }
        if let Some(dir) = lookup("MEDIA_EXPORT_FTP_DIR") {
            self.remote_directory = dir;
        }
        Ok(())
    }

    /// Load settings from a JSON file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let text = std::fs::read_to_string(path).map_err(|e| EngineError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;
        let mut settings = Self::from_json(&text)?;
        settings.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    pub fn from_json(text: &str) -> Result<Self, EngineError> {
        serde_json::from_str(text).map_err(|e| EngineError::InvalidSettings {
            message: format!("cannot parse remote settings: {}", e),
        })
    }
}

/// Export-wide defaults a host may persist.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportSettings {
    pub overwrite_policy: OverwritePolicy,
    pub remote: Option<RemoteSettings>,
}

impl ExportSettings {
    /// Load from a JSON file; environment overrides apply to the remote part.
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let text = std::fs::read_to_string(path).map_err(|e| EngineError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;
        let mut settings = Self::from_json(&text)?;
        if let Some(remote) = settings.remote.as_mut() {
            remote.apply_overrides(|key| std::env::var(key).ok())?;
        }
        Ok(settings)
    }

    pub fn from_json(text: &str) -> Result<Self, EngineError> {
        serde_json::from_str(text).map_err(|e| EngineError::InvalidSettings {
            message: format!("cannot parse export settings: {}", e),
        })
    }
}

//! Core data model for export operations.
//!
//! This module defines the structures an export is built from:
//! - MediaSource: what the caller wants exported
//! - ExportItem / DestinationPathMap: the manifest produced by the uniquifier
//! - CopyAction, MediaOutcome, OperationState: per-file, per-media and
//!   per-operation status
//! - ExportRequest / Destination: everything needed to construct an operation

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::RemoteSettings;
use crate::verify::VerifyOption;

/// Name of the folder under the destination root that receives media files.
/// The project file, if any, lands next to it at the root.
pub const MEDIA_FOLDER: &str = "media";

/// One logical clip the caller wants exported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSource {
    /// The media file, or a folder holding the whole clip
    pub media_path: PathBuf,

    /// Common ancestor directory; the first component below it becomes the
    /// top-level name at the destination
    pub stem: PathBuf,

    /// Extra files that travel with the media (XMP, proxies, ...)
    pub sidecars: Vec<PathBuf>,
}

impl MediaSource {
    pub fn new(media_path: impl Into<PathBuf>, stem: impl Into<PathBuf>) -> Self {
        MediaSource {
            media_path: media_path.into(),
            stem: stem.into(),
            sidecars: Vec::new(),
        }
    }

    pub fn with_sidecar(mut self, sidecar: impl Into<PathBuf>) -> Self {
        self.sidecars.push(sidecar.into());
        self
    }
}

/// The manifest of one logical clip being exported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportItem {
    /// Stem the paths are relative to
    pub source_stem: PathBuf,

    /// Concrete paths to transfer, directories listed before their contents
    pub export_file_paths: Vec<PathBuf>,

    /// Original top-level name -> unique name used at the destination.
    /// Only renamed names are present.
    pub top_level_names: BTreeMap<String, String>,
}

impl ExportItem {
    /// Compute where `file` lands under `media_root`.
    ///
    /// Returns None when `file` does not lie under this item's stem.
    pub fn destination_for(&self, file: &Path, media_root: &Path) -> Option<PathBuf> {
        let relative = file.strip_prefix(&self.source_stem).ok()?;
        let mut components = relative.components().filter_map(|c| match c {
            Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
            _ => None,
        });

        let top_level = components.next()?;
        let unique = self
            .top_level_names
            .get(&top_level)
            .cloned()
            .unwrap_or(top_level);

        let mut destination = media_root.join(unique);
        for component in components {
            destination.push(component);
        }
        Some(destination)
    }

    /// True if `file` sits under a top-level name that had to be renamed.
    pub fn is_renamed(&self, file: &Path) -> bool {
        top_level_name(file, &self.source_stem)
            .map(|name| self.top_level_names.contains_key(&name))
            .unwrap_or(false)
    }
}

/// First path component of `path` below `stem`.
pub fn top_level_name(path: &Path, stem: &Path) -> Option<String> {
    let relative = path.strip_prefix(stem).ok()?;
    relative.components().find_map(|c| match c {
        Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
        _ => None,
    })
}

/// Source media path -> export manifest, iterated in source path order.
pub type DestinationPathMap = BTreeMap<PathBuf, ExportItem>;

/// What happened to a single destination path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CopyAction {
    /// Transferred to a destination that did not exist
    Copied,
    /// Not transferred (source vanished, or existing destination kept)
    Ignored,
    /// Transferred over an existing destination
    Replaced,
    /// Transferred under a uniquified top-level name
    Renamed,
    /// Directory already existed or was created; nothing to copy
    NoFurtherAction,
}

impl CopyAction {
    /// True if the destination now holds the source content.
    pub fn is_transferred(&self) -> bool {
        matches!(
            self,
            CopyAction::Copied | CopyAction::Replaced | CopyAction::Renamed | CopyAction::NoFurtherAction
        )
    }
}

impl fmt::Display for CopyAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CopyAction::Copied => write!(f, "Copied"),
            CopyAction::Ignored => write!(f, "Ignored"),
            CopyAction::Replaced => write!(f, "Replaced"),
            CopyAction::Renamed => write!(f, "Renamed"),
            CopyAction::NoFurtherAction => write!(f, "NoFurtherAction"),
        }
    }
}

/// Final outcome of one media source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaOutcome {
    /// Every path of the item reached the destination
    Exported,
    /// At least one path was skipped, none failed
    Skipped,
    /// At least one path failed
    Failed,
}

/// Lifecycle of an export operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Idle,
    /// Connecting, building the export map, prechecking the destination
    Preparing,
    Transferring,
    FinalizingProject,
    Complete,
    Aborted,
    Failed,
}

impl OperationState {
    /// Returns true if no further transitions are expected.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationState::Complete | OperationState::Aborted | OperationState::Failed
        )
    }
}

/// Policy for destinations found to exist during the precheck.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverwritePolicy {
    /// Ask the caller once for all conflicts; declining cancels the export
    #[default]
    Ask,
    /// Overwrite without asking (each overwrite is still reported as a warning)
    Overwrite,
    /// Keep existing destination files and skip those sources
    Skip,
}

impl OverwritePolicy {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "ask" => Some(Self::Ask),
            "overwrite" => Some(Self::Overwrite),
            "skip" => Some(Self::Skip),
            _ => None,
        }
    }
}

impl fmt::Display for OverwritePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverwritePolicy::Ask => write!(f, "ask"),
            OverwritePolicy::Overwrite => write!(f, "overwrite"),
            OverwritePolicy::Skip => write!(f, "skip"),
        }
    }
}

/// Where an export goes.
#[derive(Debug, Clone)]
pub enum Destination {
    /// A folder on a local or mounted filesystem
    Local { folder: PathBuf },
    /// An FTP server
    Remote(RemoteSettings),
}

impl Destination {
    /// Root directory all destination paths are built from.
    pub fn root(&self) -> PathBuf {
        match self {
            Destination::Local { folder } => folder.clone(),
            Destination::Remote(settings) => PathBuf::from(settings.remote_root()),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Destination::Local { .. })
    }

    /// Human-readable name for messages.
    pub fn describe(&self) -> String {
        match self {
            Destination::Local { folder } => folder.display().to_string(),
            Destination::Remote(settings) => {
                format!("ftp://{}{}", settings.endpoint(), settings.remote_root())
            }
        }
    }
}

/// Everything an export operation needs.
#[derive(Debug, Clone)]
pub struct ExportRequest {
    pub sources: Vec<MediaSource>,
    pub destination: Destination,
    /// Project file to rewrite and export alongside the media
    pub project_file: Option<PathBuf>,
    pub overwrite_policy: OverwritePolicy,
    /// Verify each file after it is copied (local destinations only)
    pub verify: Option<VerifyOption>,
}

impl ExportRequest {
    pub fn new(sources: Vec<MediaSource>, destination: Destination) -> Self {
        ExportRequest {
            sources,
            destination,
            project_file: None,
            overwrite_policy: OverwritePolicy::Ask,
            verify: None,
        }
    }

    /// Root folder media files are placed under.
    pub fn media_root(&self) -> PathBuf {
        self.destination.root().join(MEDIA_FOLDER)
    }
}

/// A host-side record that the export reports success into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionResult {
    pub path: PathBuf,
    pub succeeded: bool,
}

impl ActionResult {
    pub fn pending(path: impl Into<PathBuf>) -> Self {
        ActionResult {
            path: path.into(),
            succeeded: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(stem: &str, renames: &[(&str, &str)]) -> ExportItem {
        ExportItem {
            source_stem: PathBuf::from(stem),
            export_file_paths: Vec::new(),
            top_level_names: renames
                .iter()
                .map(|(a, b)| (a.to_string(), b.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_destination_for_plain_file() {
        let item = item("/src", &[]);
        let dest = item
            .destination_for(Path::new("/src/clip.mov"), Path::new("/dst/media"))
            .expect("file is under stem");
        assert_eq!(dest, PathBuf::from("/dst/media/clip.mov"));
    }

    #[test]
    fn test_destination_for_renamed_folder() {
        let item = item("/srcB", &[("video", "video-a")]);
        let dest = item
            .destination_for(Path::new("/srcB/video/sub/clip.mov"), Path::new("/dst/media"))
            .expect("file is under stem");
        assert_eq!(dest, PathBuf::from("/dst/media/video-a/sub/clip.mov"));
        assert!(item.is_renamed(Path::new("/srcB/video/sub/clip.mov")));
    }

    #[test]
    fn test_destination_outside_stem() {
        let item = item("/src", &[]);
        assert!(item
            .destination_for(Path::new("/other/clip.mov"), Path::new("/dst"))
            .is_none());
    }

    #[test]
    fn test_overwrite_policy_from_str() {
        assert_eq!(OverwritePolicy::from_str("ASK"), Some(OverwritePolicy::Ask));
        assert_eq!(OverwritePolicy::from_str("skip"), Some(OverwritePolicy::Skip));
        assert_eq!(OverwritePolicy::from_str("nope"), None);
    }

    #[test]
    fn test_operation_state_terminal() {
        assert!(OperationState::Aborted.is_terminal());
        assert!(!OperationState::Transferring.is_terminal());
    }
}

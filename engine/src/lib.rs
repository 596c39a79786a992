//! # Export Engine - Media Export Transfer Library
//!
//! A headless engine that exports a set of media files, and optionally a
//! project file that references them, to an FTP server or a local folder.
//! Designed as the foundation for multiple front-ends (CLI, GUI, automation).
//!
//! ## Overview
//!
//! - Destination names are made unique before anything is copied: media from
//!   different source folders never overwrite each other
//! - Existing destination files are found up front and handled by an
//!   overwrite policy
//! - Transfers run on a worker thread and report progress through messages
//!   the caller drains on its own thread
//! - Cancellation is cooperative and checked between and inside files
//! - Copies can be verified by size, content or MD5
//!
//! ## Basic Usage
//!
//! ```no_run
//! use std::path::PathBuf;
//! use engine::{create_export_operation, Destination, ExportRequest, MediaSource};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let request = ExportRequest::new(
//!     vec![MediaSource::new("/cards/A/video", "/cards/A")],
//!     Destination::Local { folder: PathBuf::from("/exports/day1") },
//! );
//!
//! let mut operation = create_export_operation(request)?;
//! let report = operation.start_synchronous()?;
//! println!("{}: {} errors", report.result, report.errors.len());
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - **model**: Core data structures (MediaSource, ExportItem, ExportRequest, enums)
//! - **config**: FTP and export settings
//! - **error**: Result codes and error types
//! - **uniquify**: Destination path planning
//! - **transport**: Local, blocking FTP and event-loop FTP drivers
//! - **operation**: The batch export operation
//! - **progress**: Progress state, messages and cancellation
//! - **project**: Project file conversion
//! - **report**: Export report and user-facing messages
//! - **pending**: Listeners waiting on media
//! - **verify**: Post-copy file verification
//! - **fs_ops**: Low-level filesystem operations

pub mod config;
pub mod error;
pub mod fs_ops;
pub mod model;
pub mod operation;
pub mod pending;
pub mod progress;
pub mod project;
pub mod report;
pub mod transport;
pub mod uniquify;
pub mod verify;

// Re-export main types and functions
pub use config::{ExportSettings, RemoteSettings, TransportBackend};
pub use error::{DriverError, EngineError, ResultCode};
pub use model::{
    ActionResult, CopyAction, Destination, ExportItem, ExportRequest, MediaOutcome, MediaSource,
    OperationState, OverwritePolicy,
};
pub use operation::{create_export_operation, AcceptAll, ExportOperation, ExportPrompt};
pub use pending::{MediaStatus, PendingMediaRegistry};
pub use progress::{CancelToken, OperationMessage, ProgressSink, UNITS_PER_FILE};
pub use project::{ConversionRequest, ProjectConverter, TextPathRewriter};
pub use report::ExportReport;
pub use transport::{create_driver, TransferDriver};
pub use uniquify::{build_export_map, TopLevelRename, UniqueExportMap};
pub use verify::{compute_md5, verify_files, VerifyFileResult, VerifyOption};

//! Batch export operation.
//!
//! An `ExportOperation` owns one transfer driver and moves every path of the
//! export map to the destination, one file at a time. It runs either on a
//! worker thread (`start`) or on the calling thread (`start_synchronous`).
//!
//! The worker talks back through `OperationMessage`s. The caller drains them
//! with `pump`, which is also where a project conversion request runs: the
//! `ProjectConverter` belongs to the caller's thread and never crosses over.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{DriverError, EngineError, ResultCode};
use crate::model::{CopyAction, ExportRequest, MediaOutcome, OperationState, OverwritePolicy};
use crate::pending::{MediaStatus, PendingMediaRegistry};
use crate::progress::{CancelToken, FileProgress, MessagePoster, OperationMessage, UNITS_PER_FILE};
use crate::project::{ConversionRequest, ProjectConverter};
use crate::report::ExportReport;
use crate::transport::{create_driver, TransferDriver};
use crate::uniquify::{build_export_map, TopLevelRename, UniqueExportMap};
use crate::verify::verify_files;

/// How long the worker waits for a conversion reply between cancel checks.
const CONVERSION_POLL: Duration = Duration::from_millis(100);

/// Questions the operation asks the caller while preparing.
///
/// Both default to yes.
pub trait ExportPrompt: Send {
    /// Some top-level names had to be uniquified. Continue?
    fn confirm_renames(&mut self, _renames: &[TopLevelRename]) -> bool {
        true
    }

    /// These destination files already exist. Overwrite them?
    fn confirm_overwrite(&mut self, _existing: &[PathBuf]) -> bool {
        true
    }
}

/// Prompt that accepts everything.
#[derive(Debug, Default)]
pub struct AcceptAll;

impl ExportPrompt for AcceptAll {}

#[derive(Debug)]
struct Shared {
    state: OperationState,
    report: Option<ExportReport>,
}

/// Create an operation for `request` with the driver its destination needs.
pub fn create_export_operation(request: ExportRequest) -> Result<ExportOperation, EngineError> {
    let driver = create_driver(&request.destination)?;
    Ok(ExportOperation::new(request, driver))
}

pub struct ExportOperation {
    id: Uuid,
    request: Option<ExportRequest>,
    driver: Option<Box<dyn TransferDriver>>,
    prompt: Box<dyn ExportPrompt>,
    converter: Option<Box<dyn ProjectConverter>>,
    registry: Option<Arc<PendingMediaRegistry>>,
    cancel: CancelToken,
    shared: Arc<Mutex<Shared>>,
    sender: Sender<OperationMessage>,
    receiver: Receiver<OperationMessage>,
    worker: Option<JoinHandle<()>>,
    completed: bool,
}

impl ExportOperation {
    /// Create an operation that transfers through `driver`.
    pub fn new(request: ExportRequest, driver: Box<dyn TransferDriver>) -> Self {
        let (sender, receiver) = unbounded();
        ExportOperation {
            id: Uuid::new_v4(),
            request: Some(request),
            driver: Some(driver),
            prompt: Box::new(AcceptAll),
            converter: None,
            registry: None,
            cancel: CancelToken::new(),
            shared: Arc::new(Mutex::new(Shared {
                state: OperationState::Idle,
                report: None,
            })),
            sender,
            receiver,
            worker: None,
            completed: false,
        }
    }

    pub fn with_prompt(mut self, prompt: impl ExportPrompt + 'static) -> Self {
        self.prompt = Box::new(prompt);
        self
    }

    /// Converter for the request's project file. Without one the project is
    /// exported unchanged.
    pub fn with_converter(mut self, converter: impl ProjectConverter + 'static) -> Self {
        self.converter = Some(Box::new(converter));
        self
    }

    pub fn with_registry(mut self, registry: Arc<PendingMediaRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Run the export on a new worker thread and return immediately.
    ///
    /// Progress, descriptions and the final result arrive through `pump`.
    pub fn start(&mut self) -> Result<(), EngineError> {
        let worker = self.take_worker()?;
        let via_caller = self.converter.is_some();
        let handle = thread::Builder::new()
            .name(format!("export-{}", self.id))
            .spawn(move || {
                let mode = if via_caller {
                    ConversionMode::Caller
                } else {
                    ConversionMode::Unchanged
                };
                worker.run(mode);
            })
            .map_err(|e| EngineError::Unknown {
                message: format!("cannot start export worker: {}", e),
            })?;
        self.worker = Some(handle);
        Ok(())
    }

    /// Run the export on the calling thread and return its report.
    pub fn start_synchronous(&mut self) -> Result<ExportReport, EngineError> {
        let worker = self.take_worker()?;
        let mode = match self.converter.as_deref_mut() {
            Some(converter) => ConversionMode::Inline(converter),
            None => ConversionMode::Unchanged,
        };
        Ok(worker.run(mode))
    }

    /// Cancel the export and wait for the worker to finish.
    pub fn abort(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                self.lock().state = OperationState::Failed;
            }
            return;
        }

        // Never started: finish here so result() is defined.
        if self.request.take().is_some() {
            self.driver = None;
            let mut report = ExportReport::new();
            report.finish(ResultCode::UserCanceled);
            {
                let mut shared = self.lock();
                shared.state = OperationState::Aborted;
                shared.report = Some(report);
            }
            let _ = self.sender.send(OperationMessage::Complete(ResultCode::UserCanceled));
        }
    }

    /// Drain messages for up to `timeout`, passing each one to `handler`.
    ///
    /// Project conversion requests are run here with this operation's
    /// converter. Returns true once the completion message has been seen.
    pub fn pump<F>(&mut self, timeout: Duration, mut handler: F) -> bool
    where
        F: FnMut(&OperationMessage),
    {
        if self.completed {
            return true;
        }
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let message = match self.receiver.recv_timeout(remaining) {
                Ok(message) => message,
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => return false,
            };
            handler(&message);
            match message {
                OperationMessage::ConvertProject(request) => match self.converter.as_mut() {
                    Some(converter) => request.run(&mut **converter),
                    None => request.decline("no project converter is installed"),
                },
                OperationMessage::Complete(_) => {
                    self.completed = true;
                    if let Some(handle) = self.worker.take() {
                        let _ = handle.join();
                    }
                    return true;
                }
                _ => {}
            }
        }
    }

    pub fn state(&self) -> OperationState {
        self.lock().state
    }

    /// The result code, once the operation has finished.
    pub fn result(&self) -> Option<ResultCode> {
        let shared = self.lock();
        if shared.state.is_terminal() {
            shared.report.as_ref().map(|r| r.result)
        } else {
            None
        }
    }

    pub fn report(&self) -> Option<ExportReport> {
        self.lock().report.clone()
    }

    pub fn error_message(&self) -> String {
        self.lock()
            .report
            .as_ref()
            .map(ExportReport::error_message)
            .unwrap_or_default()
    }

    pub fn warning_message(&self) -> String {
        self.lock()
            .report
            .as_ref()
            .map(ExportReport::warning_message)
            .unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take_worker(&mut self) -> Result<ExportWorker, EngineError> {
        let (request, driver) = match (self.request.take(), self.driver.take()) {
            (Some(request), Some(driver)) => (request, driver),
            _ => {
                return Err(EngineError::InvalidState {
                    message: "export operation was already started".to_string(),
                })
            }
        };
        Ok(ExportWorker {
            id: self.id,
            request,
            driver,
            prompt: std::mem::replace(&mut self.prompt, Box::new(AcceptAll)),
            registry: self.registry.clone(),
            cancel: self.cancel.clone(),
            poster: MessagePoster::new(self.sender.clone()),
            shared: Arc::clone(&self.shared),
            deferred: None,
            media_destinations: HashMap::new(),
        })
    }
}

impl Drop for ExportOperation {
    fn drop(&mut self) {
        if let Some(handle) = self.worker.take() {
            self.cancel.cancel();
            let _ = handle.join();
        }
    }
}

/// Where the project conversion runs.
enum ConversionMode<'a> {
    /// No converter: the project is exported as is
    Unchanged,
    /// Posted to the caller, who runs it from `pump`
    Caller,
    /// Run right here (synchronous operations)
    Inline(&'a mut dyn ProjectConverter),
}

/// One path of the export plan.
#[derive(Debug)]
struct PlannedPath {
    media: PathBuf,
    source: PathBuf,
    destination: PathBuf,
    is_dir: bool,
    renamed: bool,
}

/// Removes the file when dropped.
struct TempFile(PathBuf);

impl Drop for TempFile {
    fn drop(&mut self) {
        if self.0.exists() {
            if let Err(e) = fs::remove_file(&self.0) {
                debug!(path = %self.0.display(), error = %e, "temporary file not removed");
            }
        }
    }
}

/// Destination conflicts found by the precheck and what to do about them.
#[derive(Debug, Default)]
struct Conflicts {
    existing: HashSet<PathBuf>,
    skip: HashSet<PathBuf>,
}

struct ExportWorker {
    id: Uuid,
    request: ExportRequest,
    driver: Box<dyn TransferDriver>,
    prompt: Box<dyn ExportPrompt>,
    registry: Option<Arc<PendingMediaRegistry>>,
    cancel: CancelToken,
    poster: MessagePoster,
    shared: Arc<Mutex<Shared>>,
    /// First failure that did not stop the export
    deferred: Option<ResultCode>,
    /// Media path -> where it lands
    media_destinations: HashMap<PathBuf, PathBuf>,
}

impl ExportWorker {
    fn run(mut self, mut conversion: ConversionMode<'_>) -> ExportReport {
        info!(
            operation = %self.id,
            destination = %self.request.destination.describe(),
            sources = self.request.sources.len(),
            "export started"
        );
        let mut report = ExportReport::new();
        let code = match self.execute(&mut report, &mut conversion) {
            Ok(()) => self.deferred.unwrap_or(ResultCode::Success),
            Err(code) => code,
        };

        self.driver.close();
        self.notify_registry(&report, code);
        report.finish(code);

        let state = match code {
            ResultCode::Success => OperationState::Complete,
            ResultCode::UserCanceled => OperationState::Aborted,
            _ => OperationState::Failed,
        };
        {
            let mut shared = self.shared.lock().unwrap_or_else(|e| e.into_inner());
            shared.state = state;
            shared.report = Some(report.clone());
        }
        self.poster.post(OperationMessage::Complete(code));
        info!(
            operation = %self.id,
            result = %code,
            errors = report.errors.len(),
            warnings = report.warnings.len(),
            "export finished"
        );
        report
    }

    fn set_state(&self, state: OperationState) {
        debug!(operation = %self.id, ?state, "state change");
        self.shared.lock().unwrap_or_else(|e| e.into_inner()).state = state;
    }

    fn check_cancel(&self) -> Result<(), ResultCode> {
        if self.cancel.is_cancelled() {
            info!(operation = %self.id, "export canceled");
            Err(ResultCode::UserCanceled)
        } else {
            Ok(())
        }
    }

    fn execute(
        &mut self,
        report: &mut ExportReport,
        conversion: &mut ConversionMode<'_>,
    ) -> Result<(), ResultCode> {
        self.set_state(OperationState::Preparing);
        self.poster
            .describe(format!("Connecting to {}", self.request.destination.describe()));
        if let Err(e) = self.driver.connect() {
            let message = match e {
                DriverError::Connect { .. } => e.to_string(),
                _ => format!("Cannot connect to {}: {}", self.request.destination.describe(), e),
            };
            report.add_error(message);
            return Err(e.result_code());
        }
        self.check_cancel()?;

        let map = build_export_map(&self.request.sources).map_err(|e| {
            report.add_error(e.to_string());
            e.result_code()
        })?;
        debug!(operation = %self.id, items = map.items.len(), files = map.file_count(), "export map built");
        report.renames = map.renames.clone();
        if !map.renames.is_empty() && !self.prompt.confirm_renames(&map.renames) {
            info!(operation = %self.id, "renames declined");
            return Err(ResultCode::UserCanceled);
        }
        self.check_cancel()?;

        let plan = self.plan(&map);
        let project_destination = self.project_destination();
        let conflicts = self.precheck(&plan, project_destination.as_deref(), report)?;
        self.check_cancel()?;

        self.set_state(OperationState::Transferring);
        let file_count = plan.iter().filter(|p| !p.is_dir).count() as u64
            + u64::from(project_destination.is_some());
        self.poster.post(OperationMessage::Started {
            total_units: file_count * UNITS_PER_FILE,
        });

        for entry in &plan {
            self.check_cancel()?;
            self.transfer(entry, &conflicts, report)?;
        }
        self.check_cancel()?;

        if let (Some(project), Some(destination)) =
            (self.request.project_file.clone(), project_destination)
        {
            self.set_state(OperationState::FinalizingProject);
            self.finalize_project(&project, &destination, &map, &conflicts, report, conversion)?;
        }
        Ok(())
    }

    fn plan(&mut self, map: &UniqueExportMap) -> Vec<PlannedPath> {
        let media_root = self.request.media_root();
        let mut plan = Vec::new();
        for (media, item) in &map.items {
            if let Some(destination) = item.destination_for(media, &media_root) {
                self.media_destinations.insert(media.clone(), destination);
            }
            for file in &item.export_file_paths {
                match item.destination_for(file, &media_root) {
                    Some(destination) => plan.push(PlannedPath {
                        media: media.clone(),
                        source: file.clone(),
                        destination,
                        is_dir: file.is_dir(),
                        renamed: item.is_renamed(file),
                    }),
                    None => debug!(path = %file.display(), "path outside its stem, not exported"),
                }
            }
        }
        plan
    }

    fn project_destination(&self) -> Option<PathBuf> {
        let project = self.request.project_file.as_ref()?;
        let name = project.file_name()?;
        Some(self.request.destination.root().join(name))
    }

    /// Probe every destination and apply the overwrite policy to the files
    /// that already exist.
    fn precheck(
        &mut self,
        plan: &[PlannedPath],
        project_destination: Option<&Path>,
        report: &mut ExportReport,
    ) -> Result<Conflicts, ResultCode> {
        self.poster.describe("Checking destination");
        let mut missing_dirs: HashSet<PathBuf> = HashSet::new();
        let mut existing: Vec<PathBuf> = Vec::new();

        let files = plan
            .iter()
            .map(|p| (p.destination.as_path(), p.is_dir))
            .chain(project_destination.map(|p| (p, false)));
        for (destination, is_dir) in files {
            // Nothing can exist below a directory that does not.
            if destination
                .parent()
                .map(|parent| missing_dirs.contains(parent))
                .unwrap_or(false)
            {
                if is_dir {
                    missing_dirs.insert(destination.to_path_buf());
                }
                continue;
            }

            let probe = if is_dir {
                self.driver.ensure_directory(destination, false)
            } else {
                self.driver.exists(destination, false)
            };
            match probe {
                Ok(true) if !is_dir => existing.push(destination.to_path_buf()),
                Ok(true) => {}
                Ok(false) if is_dir => {
                    missing_dirs.insert(destination.to_path_buf());
                }
                Ok(false) => {}
                Err(e) => {
                    report.add_error(format!("Cannot check {}: {}", destination.display(), e));
                    return Err(e.result_code());
                }
            }
        }

        let mut conflicts = Conflicts::default();
        if existing.is_empty() {
            return Ok(conflicts);
        }
        debug!(count = existing.len(), policy = %self.request.overwrite_policy, "existing destinations");
        match self.request.overwrite_policy {
            OverwritePolicy::Ask => {
                if !self.prompt.confirm_overwrite(&existing) {
                    info!(operation = %self.id, "overwrite declined");
                    return Err(ResultCode::UserCanceled);
                }
            }
            OverwritePolicy::Overwrite => {}
            OverwritePolicy::Skip => conflicts.skip = existing.iter().cloned().collect(),
        }
        conflicts.existing = existing.into_iter().collect();
        Ok(conflicts)
    }

    fn transfer(
        &mut self,
        entry: &PlannedPath,
        conflicts: &Conflicts,
        report: &mut ExportReport,
    ) -> Result<(), ResultCode> {
        let destination = &entry.destination;

        if !entry.source.exists() {
            report.add_warning(format!(
                "Source no longer exists and was skipped: {}",
                entry.source.display()
            ));
            self.skipped(entry, report);
            return Ok(());
        }

        if entry.is_dir {
            match self.driver.ensure_directory(destination, true) {
                Ok(_) => {
                    report.record_action(destination, CopyAction::NoFurtherAction);
                    report.record_outcome(&entry.media, MediaOutcome::Exported);
                }
                Err(e) => {
                    report.add_error(format!("Cannot create folder {}: {}", destination.display(), e));
                    report.record_outcome(&entry.media, MediaOutcome::Failed);
                    if e.is_connection_fatal() {
                        return Err(e.result_code());
                    }
                    self.deferred.get_or_insert(e.result_code());
                }
            }
            return Ok(());
        }

        if conflicts.skip.contains(destination) {
            report.add_warning(format!(
                "Destination already exists and was kept: {}",
                destination.display()
            ));
            self.skipped(entry, report);
            return Ok(());
        }

        self.poster
            .describe(format!("Exporting {}", entry.source.display()));
        debug!(src = %entry.source.display(), dst = %destination.display(), "uploading");
        let mut progress = FileProgress::new(&self.poster, &self.cancel);
        let uploaded = self.driver.upload(&entry.source, destination, &mut progress);

        match uploaded {
            Ok(bytes) => {
                progress.complete();
                debug!(path = %destination.display(), bytes, "exported");
            }
            Err(DriverError::Cancelled) => {
                report.record_action(destination, CopyAction::Ignored);
                report.record_outcome(&entry.media, MediaOutcome::Skipped);
                return Err(ResultCode::UserCanceled);
            }
            Err(e) => {
                report.add_error(format!("Cannot export {}: {}", entry.source.display(), e));
                report.record_outcome(&entry.media, MediaOutcome::Failed);
                return Err(e.result_code());
            }
        }

        let action = if conflicts.existing.contains(destination) {
            report.add_warning(format!("Overwrote existing file: {}", destination.display()));
            CopyAction::Replaced
        } else if entry.renamed {
            CopyAction::Renamed
        } else {
            CopyAction::Copied
        };
        report.record_action(destination, action);

        if let Some(option) = self.request.verify {
            if self.request.destination.is_local() {
                let (outcome, detail) = verify_files(option, &entry.source, destination);
                if !outcome.is_equal() {
                    report.add_error(format!(
                        "Verification of {} failed ({}): {}",
                        destination.display(),
                        outcome,
                        detail
                    ));
                    report.record_outcome(&entry.media, MediaOutcome::Failed);
                    return Err(ResultCode::Unknown);
                }
            }
        }
        report.record_outcome(&entry.media, MediaOutcome::Exported);
        Ok(())
    }

    fn skipped(&self, entry: &PlannedPath, report: &mut ExportReport) {
        report.record_action(&entry.destination, CopyAction::Ignored);
        report.record_outcome(&entry.media, MediaOutcome::Skipped);
        if !entry.is_dir {
            self.poster.progress(UNITS_PER_FILE);
        }
    }

    fn finalize_project(
        &mut self,
        project: &Path,
        destination: &Path,
        map: &UniqueExportMap,
        conflicts: &Conflicts,
        report: &mut ExportReport,
        conversion: &mut ConversionMode<'_>,
    ) -> Result<(), ResultCode> {
        if conflicts.skip.contains(destination) {
            report.add_warning(format!(
                "Project file already exists and was kept: {}",
                destination.display()
            ));
            report.record_action(destination, CopyAction::Ignored);
            self.poster.progress(UNITS_PER_FILE);
            return Ok(());
        }

        self.poster
            .describe(format!("Converting project {}", project.display()));
        let rewrites = map.destinations(&self.request.media_root());
        let file_name = project
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp = TempFile(
            std::env::temp_dir().join(format!("media-export-{}-{}", Uuid::new_v4(), file_name)),
        );

        let converted = match conversion {
            ConversionMode::Unchanged => None,
            ConversionMode::Inline(converter) => Some(converter.convert(project, &rewrites, &temp.0)),
            ConversionMode::Caller => Some(self.convert_on_caller(project, rewrites, &temp.0)?),
        };
        let upload_source = match converted {
            None => project.to_path_buf(),
            Some(Ok(())) => temp.0.clone(),
            Some(Err(message)) => {
                report.add_error(format!("Cannot convert project {}: {}", project.display(), message));
                return Err(ResultCode::Unknown);
            }
        };
        self.check_cancel()?;

        self.poster
            .describe(format!("Exporting project {}", destination.display()));
        let mut progress = FileProgress::new(&self.poster, &self.cancel);
        match self.driver.upload(&upload_source, destination, &mut progress) {
            Ok(_) => progress.complete(),
            Err(DriverError::Cancelled) => {
                report.record_action(destination, CopyAction::Ignored);
                return Err(ResultCode::UserCanceled);
            }
            Err(e) => {
                report.add_error(format!("Cannot export project {}: {}", project.display(), e));
                return Err(e.result_code());
            }
        }

        let action = if conflicts.existing.contains(destination) {
            report.add_warning(format!("Overwrote existing file: {}", destination.display()));
            CopyAction::Replaced
        } else {
            CopyAction::Copied
        };
        report.record_action(destination, action);
        Ok(())
    }

    /// Post the conversion to the caller and wait for the reply, giving up if
    /// the operation is canceled meanwhile.
    fn convert_on_caller(
        &self,
        project: &Path,
        rewrites: Vec<(PathBuf, PathBuf)>,
        output: &Path,
    ) -> Result<Result<(), String>, ResultCode> {
        let (reply, replies) = crossbeam_channel::bounded(1);
        self.poster.post(OperationMessage::ConvertProject(ConversionRequest::new(
            project.to_path_buf(),
            rewrites,
            output.to_path_buf(),
            reply,
        )));
        loop {
            self.check_cancel()?;
            match replies.recv_timeout(CONVERSION_POLL) {
                Ok(result) => return Ok(result),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Ok(Err("the conversion request was dropped".to_string()))
                }
            }
        }
    }

    fn notify_registry(&self, report: &ExportReport, code: ResultCode) {
        let registry = match &self.registry {
            Some(registry) => registry,
            None => return,
        };
        for source in &self.request.sources {
            let status = match (
                report.outcomes.get(&source.media_path),
                self.media_destinations.get(&source.media_path),
            ) {
                (Some(MediaOutcome::Exported), Some(destination)) => MediaStatus::Exported {
                    destination: destination.clone(),
                },
                (Some(MediaOutcome::Skipped), _) => MediaStatus::Failed {
                    reason: "skipped".to_string(),
                },
                (Some(_), _) => MediaStatus::Failed {
                    reason: "export failed".to_string(),
                },
                (None, _) => MediaStatus::Failed {
                    reason: format!("export ended before this media was transferred ({})", code),
                },
            };
            registry.notify(&source.media_path, &status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Destination, MediaSource};
    use crate::progress::ProgressSink;
    use crate::project::TextPathRewriter;
    use crate::verify::VerifyOption;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn local_request(sources: Vec<MediaSource>, dst: &Path) -> ExportRequest {
        ExportRequest::new(
            sources,
            Destination::Local {
                folder: dst.to_path_buf(),
            },
        )
    }

    fn write(path: &Path, contents: &[u8]) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("Failed to create parent");
        }
        fs::write(path, contents).expect("Failed to write file");
    }

    struct Decline;

    impl ExportPrompt for Decline {
        fn confirm_overwrite(&mut self, _existing: &[PathBuf]) -> bool {
            false
        }
    }

    #[test]
    fn test_single_file_export() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src");
        let dst = temp_dir.path().join("dst");
        write(&src.join("clip.mov"), b"frames");

        let request = local_request(vec![MediaSource::new(src.join("clip.mov"), &src)], &dst);
        let mut operation = create_export_operation(request).expect("Failed to create operation");
        let report = operation.start_synchronous().expect("Failed to run");

        assert_eq!(report.result, ResultCode::Success);
        assert!(report.errors.is_empty());
        assert_eq!(
            fs::read(dst.join("media").join("clip.mov")).expect("Failed to read copy"),
            b"frames"
        );
        assert_eq!(report.count_actions(CopyAction::Copied), 1);
        assert_eq!(operation.state(), OperationState::Complete);
        assert_eq!(operation.result(), Some(ResultCode::Success));
    }

    #[test]
    fn test_colliding_folders_are_both_exported() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src_a = temp_dir.path().join("srcA");
        let src_b = temp_dir.path().join("srcB");
        let dst = temp_dir.path().join("dst");
        write(&src_a.join("video").join("clip.mov"), b"from a");
        write(&src_b.join("video").join("clip.mov"), b"from b");

        let request = local_request(
            vec![
                MediaSource::new(src_a.join("video"), &src_a),
                MediaSource::new(src_b.join("video"), &src_b),
            ],
            &dst,
        );
        let mut operation = create_export_operation(request).expect("Failed to create operation");
        let report = operation.start_synchronous().expect("Failed to run");

        assert_eq!(report.result, ResultCode::Success);
        let media = dst.join("media");
        assert_eq!(fs::read(media.join("video").join("clip.mov")).expect("read a"), b"from a");
        assert_eq!(fs::read(media.join("video-a").join("clip.mov")).expect("read b"), b"from b");
        assert_eq!(report.renames.len(), 1);
        assert_eq!(report.renames[0].renamed, "video-a");
        assert_eq!(report.count_actions(CopyAction::Renamed), 1);
        assert_eq!(report.exported_media().count(), 2);
    }

    #[test]
    fn test_empty_media_folder_counts_as_exported() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src");
        let dst = temp_dir.path().join("dst");
        let card = src.join("EMPTY_CARD");
        fs::create_dir_all(&card).expect("Failed to create folder");

        let request = local_request(vec![MediaSource::new(&card, &src)], &dst);
        let registry = Arc::new(PendingMediaRegistry::new());
        let exported = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&exported);
        registry.register(&card, move |_, status| {
            if matches!(status, MediaStatus::Exported { .. }) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        let mut operation = create_export_operation(request)
            .expect("Failed to create operation")
            .with_registry(Arc::clone(&registry));
        let report = operation.start_synchronous().expect("Failed to run");

        assert_eq!(report.result, ResultCode::Success);
        assert!(dst.join("media").join("EMPTY_CARD").is_dir());
        assert_eq!(report.outcomes.get(&card), Some(&MediaOutcome::Exported));
        let mut results = vec![crate::model::ActionResult::pending(&card)];
        assert_eq!(report.merge_into(&mut results), 1);
        assert!(results[0].succeeded);
        assert_eq!(exported.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_declined_overwrite_copies_nothing() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src");
        let dst = temp_dir.path().join("dst");
        write(&src.join("a.mov"), b"new a");
        write(&src.join("b.mov"), b"new b");
        write(&dst.join("media").join("b.mov"), b"old b");

        let request = local_request(
            vec![
                MediaSource::new(src.join("a.mov"), &src),
                MediaSource::new(src.join("b.mov"), &src),
            ],
            &dst,
        );
        let mut operation = create_export_operation(request)
            .expect("Failed to create operation")
            .with_prompt(Decline);
        let report = operation.start_synchronous().expect("Failed to run");

        assert_eq!(report.result, ResultCode::UserCanceled);
        assert!(report.actions.is_empty());
        assert!(!dst.join("media").join("a.mov").exists());
        assert_eq!(fs::read(dst.join("media").join("b.mov")).expect("read b"), b"old b");
        assert_eq!(operation.state(), OperationState::Aborted);
    }

    #[test]
    fn test_skip_policy_keeps_existing_files() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src");
        let dst = temp_dir.path().join("dst");
        write(&src.join("a.mov"), b"new a");
        write(&dst.join("media").join("a.mov"), b"old a");

        let mut request = local_request(vec![MediaSource::new(src.join("a.mov"), &src)], &dst);
        request.overwrite_policy = OverwritePolicy::Skip;
        let mut operation = create_export_operation(request).expect("Failed to create operation");
        let report = operation.start_synchronous().expect("Failed to run");

        assert_eq!(report.result, ResultCode::Success);
        assert_eq!(report.count_actions(CopyAction::Ignored), 1);
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(fs::read(dst.join("media").join("a.mov")).expect("read a"), b"old a");
    }

    #[test]
    fn test_overwrite_policy_replaces_with_warning() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src");
        let dst = temp_dir.path().join("dst");
        write(&src.join("a.mov"), b"new a");
        write(&dst.join("media").join("a.mov"), b"old a");

        let mut request = local_request(vec![MediaSource::new(src.join("a.mov"), &src)], &dst);
        request.overwrite_policy = OverwritePolicy::Overwrite;
        request.verify = Some(VerifyOption::Md5);
        let mut operation = create_export_operation(request).expect("Failed to create operation");
        let report = operation.start_synchronous().expect("Failed to run");

        assert_eq!(report.result, ResultCode::Success);
        assert_eq!(report.count_actions(CopyAction::Replaced), 1);
        assert!(report.warning_message().contains("Overwrote existing file"));
        assert_eq!(fs::read(dst.join("media").join("a.mov")).expect("read a"), b"new a");
    }

    #[test]
    fn test_missing_source_fails_before_transfer() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src");
        fs::create_dir_all(&src).expect("Failed to create src");
        let dst = temp_dir.path().join("dst");

        let request = local_request(vec![MediaSource::new(src.join("gone.mov"), &src)], &dst);
        let mut operation = create_export_operation(request).expect("Failed to create operation");
        let report = operation.start_synchronous().expect("Failed to run");

        assert_eq!(report.result, ResultCode::PathNotFound);
        assert!(operation.error_message().contains("gone.mov"));
        assert_eq!(operation.state(), OperationState::Failed);
    }

    #[test]
    fn test_second_start_is_rejected() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src");
        write(&src.join("clip.mov"), b"x");
        let request = local_request(
            vec![MediaSource::new(src.join("clip.mov"), &src)],
            &temp_dir.path().join("dst"),
        );
        let mut operation = create_export_operation(request).expect("Failed to create operation");
        operation.start_synchronous().expect("Failed to run");
        assert!(matches!(
            operation.start(),
            Err(EngineError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_threaded_export_converts_project_on_caller() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src");
        let dst = temp_dir.path().join("dst");
        let clip = src.join("clip.mov");
        write(&clip, b"frames");
        let project = temp_dir.path().join("show.txt");
        write(&project, format!("clip={}\n", clip.display()).as_bytes());

        let mut request = local_request(vec![MediaSource::new(&clip, &src)], &dst);
        request.project_file = Some(project);
        let registry = Arc::new(PendingMediaRegistry::new());
        let exported = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&exported);
        registry.register(&clip, move |_, status| {
            if matches!(status, MediaStatus::Exported { .. }) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let mut operation = create_export_operation(request)
            .expect("Failed to create operation")
            .with_converter(TextPathRewriter)
            .with_registry(Arc::clone(&registry));
        operation.start().expect("Failed to start");

        let mut total_units = 0;
        let mut progressed = 0;
        let mut conversions = 0;
        let deadline = Instant::now() + Duration::from_secs(10);
        while !operation.pump(Duration::from_millis(50), |message| match message {
            OperationMessage::Started { total_units: units } => total_units = *units,
            OperationMessage::Progress { delta } => progressed += delta,
            OperationMessage::ConvertProject(_) => conversions += 1,
            _ => {}
        }) {
            assert!(Instant::now() < deadline, "export did not finish");
        }

        assert_eq!(operation.result(), Some(ResultCode::Success));
        assert_eq!(conversions, 1);
        assert_eq!(total_units, 2 * UNITS_PER_FILE);
        assert_eq!(progressed, total_units);
        let converted = fs::read_to_string(dst.join("show.txt")).expect("Failed to read project");
        assert_eq!(
            converted,
            format!("clip={}\n", dst.join("media").join("clip.mov").display())
        );
        assert_eq!(exported.load(Ordering::SeqCst), 1);
    }

    /// Driver whose uploads never finish on their own.
    struct StallingDriver {
        uploads: Arc<AtomicUsize>,
    }

    impl TransferDriver for StallingDriver {
        fn describe(&self) -> String {
            "stalling".to_string()
        }

        fn connect(&mut self) -> Result<(), DriverError> {
            Ok(())
        }

        fn ensure_directory(&mut self, _path: &Path, _create: bool) -> Result<bool, DriverError> {
            Ok(false)
        }

        fn exists(&mut self, _path: &Path, _is_directory: bool) -> Result<bool, DriverError> {
            Ok(false)
        }

        fn upload(
            &mut self,
            _local: &Path,
            _remote: &Path,
            sink: &mut dyn ProgressSink,
        ) -> Result<u64, DriverError> {
            self.uploads.fetch_add(1, Ordering::SeqCst);
            let mut sent = 0;
            loop {
                sent += 1;
                if !sink.report(sent, 1_000_000) {
                    return Err(DriverError::Cancelled);
                }
                thread::sleep(Duration::from_millis(5));
            }
        }

        fn delete(&mut self, _path: &Path) -> Result<(), DriverError> {
            Ok(())
        }

        fn close(&mut self) {}
    }

    #[test]
    fn test_abort_stops_within_one_file() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src");
        write(&src.join("a.mov"), b"a");
        write(&src.join("b.mov"), b"b");
        let request = local_request(
            vec![
                MediaSource::new(src.join("a.mov"), &src),
                MediaSource::new(src.join("b.mov"), &src),
            ],
            &temp_dir.path().join("dst"),
        );
        let uploads = Arc::new(AtomicUsize::new(0));
        let mut operation = ExportOperation::new(
            request,
            Box::new(StallingDriver {
                uploads: Arc::clone(&uploads),
            }),
        );

        operation.start().expect("Failed to start");
        thread::sleep(Duration::from_millis(100));
        operation.abort();

        assert_eq!(operation.result(), Some(ResultCode::UserCanceled));
        assert_eq!(operation.state(), OperationState::Aborted);
        assert!(uploads.load(Ordering::SeqCst) <= 1);
    }

    #[test]
    fn test_abort_before_start() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let request = local_request(Vec::new(), temp_dir.path());
        let mut operation = create_export_operation(request).expect("Failed to create operation");

        operation.abort();
        assert_eq!(operation.result(), Some(ResultCode::UserCanceled));
        assert!(operation.pump(Duration::from_millis(10), |_| {}));
    }
}

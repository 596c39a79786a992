//! Export results.
//!
//! The worker fills an `ExportReport` as it goes; the caller only sees it once
//! the operation has finished. Instead of mutating host-owned result lists
//! from the worker, the report carries per-media outcomes the host merges with
//! `merge_into`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::error::ResultCode;
use crate::model::{ActionResult, CopyAction, MediaOutcome};
use crate::uniquify::TopLevelRename;

/// Warnings beyond this count are summarised instead of listed.
pub const MAX_DISPLAYED_WARNINGS: usize = 10;

#[derive(Debug, Clone)]
pub struct ExportReport {
    pub result: ResultCode,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    /// Destination path and what happened to it, in transfer order
    pub actions: Vec<(PathBuf, CopyAction)>,
    /// Source media path -> outcome
    pub outcomes: BTreeMap<PathBuf, MediaOutcome>,
    pub renames: Vec<TopLevelRename>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Default for ExportReport {
    fn default() -> Self {
        ExportReport {
            result: ResultCode::Success,
            errors: Vec::new(),
            warnings: Vec::new(),
            actions: Vec::new(),
            outcomes: BTreeMap::new(),
            renames: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }
}

impl ExportReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!(error = %message, "export error");
        self.errors.push(message);
    }

    pub fn add_warning(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!(warning = %message, "export warning");
        self.warnings.push(message);
    }

    pub fn record_action(&mut self, destination: &Path, action: CopyAction) {
        self.actions.push((destination.to_path_buf(), action));
    }

    /// Fold a file's result into its media's outcome. Failure wins over skip,
    /// skip wins over success.
    pub fn record_outcome(&mut self, media: &Path, outcome: MediaOutcome) {
        let entry = self
            .outcomes
            .entry(media.to_path_buf())
            .or_insert(MediaOutcome::Exported);
        *entry = match (*entry, outcome) {
            (MediaOutcome::Failed, _) | (_, MediaOutcome::Failed) => MediaOutcome::Failed,
            (MediaOutcome::Skipped, _) | (_, MediaOutcome::Skipped) => MediaOutcome::Skipped,
            _ => MediaOutcome::Exported,
        };
    }

    pub fn finish(&mut self, result: ResultCode) {
        self.result = result;
        self.finished_at = Some(Utc::now());
    }

    /// All errors, one per line.
    pub fn error_message(&self) -> String {
        self.errors.join("\n")
    }

    /// Warnings, one per line, capped at `MAX_DISPLAYED_WARNINGS`.
    pub fn warning_message(&self) -> String {
        let shown = self.warnings.len().min(MAX_DISPLAYED_WARNINGS);
        let mut lines: Vec<String> = self.warnings[..shown].to_vec();
        if self.warnings.len() > MAX_DISPLAYED_WARNINGS {
            lines.push(format!(
                "Not all warnings are shown ({} more).",
                self.warnings.len() - MAX_DISPLAYED_WARNINGS
            ));
        }
        lines.join("\n")
    }

    /// Media paths whose every file reached the destination.
    pub fn exported_media(&self) -> impl Iterator<Item = &PathBuf> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| **outcome == MediaOutcome::Exported)
            .map(|(path, _)| path)
    }

    /// Mark host results whose path was exported as succeeded. Entries that
    /// do not match keep their current value.
    pub fn merge_into(&self, results: &mut [ActionResult]) -> usize {
        let mut updated = 0;
        for result in results.iter_mut() {
            if self.outcomes.get(&result.path) == Some(&MediaOutcome::Exported) {
                result.succeeded = true;
                updated += 1;
            }
        }
        updated
    }

    pub fn count_actions(&self, action: CopyAction) -> usize {
        self.actions.iter().filter(|(_, a)| *a == action).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warning_message_is_capped() {
        let mut report = ExportReport::new();
        for i in 0..13 {
            report.add_warning(format!("warning {}", i));
        }

        let message = report.warning_message();
        assert_eq!(message.lines().count(), MAX_DISPLAYED_WARNINGS + 1);
        assert!(message.contains("warning 9"));
        assert!(!message.contains("warning 10"));
        assert!(message.ends_with("Not all warnings are shown (3 more)."));
    }

    #[test]
    fn test_short_warning_list_has_no_note() {
        let mut report = ExportReport::new();
        report.add_warning("one");
        assert_eq!(report.warning_message(), "one");
    }

    #[test]
    fn test_outcome_folding() {
        let mut report = ExportReport::new();
        let media = Path::new("/src/clip");
        report.record_outcome(media, MediaOutcome::Exported);
        report.record_outcome(media, MediaOutcome::Skipped);
        assert_eq!(report.outcomes[media], MediaOutcome::Skipped);
        report.record_outcome(media, MediaOutcome::Exported);
        assert_eq!(report.outcomes[media], MediaOutcome::Skipped);
        report.record_outcome(media, MediaOutcome::Failed);
        assert_eq!(report.outcomes[media], MediaOutcome::Failed);
    }

    #[test]
    fn test_merge_into_only_touches_exported_paths() {
        let mut report = ExportReport::new();
        report.record_outcome(Path::new("/src/a.mov"), MediaOutcome::Exported);
        report.record_outcome(Path::new("/src/b.mov"), MediaOutcome::Failed);

        let mut results = vec![
            ActionResult::pending("/src/a.mov"),
            ActionResult::pending("/src/b.mov"),
            ActionResult {
                path: PathBuf::from("/src/c.mov"),
                succeeded: true,
            },
        ];
        let updated = report.merge_into(&mut results);

        assert_eq!(updated, 1);
        assert!(results[0].succeeded);
        assert!(!results[1].succeeded);
        assert!(results[2].succeeded, "unmatched entries keep their value");
    }
}

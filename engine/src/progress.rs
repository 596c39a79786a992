//! Progress reporting and cancellation.
//!
//! Drivers report raw byte counts to a `ProgressSink`; the sink's return value
//! doubles as the stop signal. The export operation normalises those counts
//! into a fixed number of units per file and posts the deltas as
//! `OperationMessage`s, so the host can render progress without knowing file
//! sizes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::Sender;

use crate::error::ResultCode;
use crate::project::ConversionRequest;

/// Progress units allotted to each transferred file.
pub const UNITS_PER_FILE: u64 = 100;

/// Receives byte counts while a file is transferred.
pub trait ProgressSink {
    /// Called after each chunk with the cumulative bytes sent for this file.
    ///
    /// Return false to stop the transfer.
    fn report(&mut self, bytes_done: u64, bytes_total: u64) -> bool;
}

/// A sink that ignores progress and never stops.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&mut self, _bytes_done: u64, _bytes_total: u64) -> bool {
        true
    }
}

impl<F> ProgressSink for F
where
    F: FnMut(u64, u64) -> bool,
{
    fn report(&mut self, bytes_done: u64, bytes_total: u64) -> bool {
        self(bytes_done, bytes_total)
    }
}

/// Per-file progress counter.
///
/// `current_progress` never decreases and never exceeds `total_progress`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgressState {
    total_progress: u64,
    current_progress: u64,
}

impl TransferProgressState {
    pub fn new(total_progress: u64) -> Self {
        TransferProgressState {
            total_progress,
            current_progress: 0,
        }
    }

    pub fn total(&self) -> u64 {
        self.total_progress
    }

    pub fn current(&self) -> u64 {
        self.current_progress
    }

    /// Move to `value` (clamped to the total). Returns the forward delta; a
    /// value below the current position is ignored.
    pub fn advance_to(&mut self, value: u64) -> u64 {
        let clamped = value.min(self.total_progress);
        if clamped <= self.current_progress {
            return 0;
        }
        let delta = clamped - self.current_progress;
        self.current_progress = clamped;
        delta
    }

    /// Advance according to a byte count, scaled onto the unit total.
    pub fn advance_bytes(&mut self, bytes_done: u64, bytes_total: u64) -> u64 {
        if bytes_total == 0 {
            return self.advance_to(self.total_progress);
        }
        let scaled = (bytes_done as u128 * self.total_progress as u128 / bytes_total as u128) as u64;
        self.advance_to(scaled)
    }

    /// Jump to the end, returning whatever was still outstanding.
    pub fn finish(&mut self) -> u64 {
        self.advance_to(self.total_progress)
    }
}

/// Cooperative cancellation flag shared between the caller and the worker.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Notifications posted from the worker to the caller's thread.
#[derive(Debug)]
pub enum OperationMessage {
    /// Total units the progress bar will reach
    Started { total_units: u64 },
    Progress { delta: u64 },
    Description(String),
    /// Work that must run on the caller's thread
    ConvertProject(ConversionRequest),
    Complete(ResultCode),
}

/// Posts messages to the caller; a disconnected receiver is not an error.
#[derive(Debug, Clone)]
pub struct MessagePoster {
    sender: Sender<OperationMessage>,
}

impl MessagePoster {
    pub fn new(sender: Sender<OperationMessage>) -> Self {
        MessagePoster { sender }
    }

    pub fn post(&self, message: OperationMessage) {
        let _ = self.sender.send(message);
    }

    pub fn progress(&self, delta: u64) {
        if delta > 0 {
            self.post(OperationMessage::Progress { delta });
        }
    }

    pub fn describe(&self, text: impl Into<String>) {
        self.post(OperationMessage::Description(text.into()));
    }
}

/// Sink used for one file: turns byte counts into unit deltas and stops when
/// the operation is cancelled.
pub struct FileProgress<'a> {
    state: TransferProgressState,
    poster: &'a MessagePoster,
    cancel: &'a CancelToken,
}

impl<'a> FileProgress<'a> {
    pub fn new(poster: &'a MessagePoster, cancel: &'a CancelToken) -> Self {
        FileProgress {
            state: TransferProgressState::new(UNITS_PER_FILE),
            poster,
            cancel,
        }
    }

    /// Post whatever is left of this file's units.
    pub fn complete(&mut self) {
        let delta = self.state.finish();
        self.poster.progress(delta);
    }

    pub fn state(&self) -> &TransferProgressState {
        &self.state
    }
}

impl ProgressSink for FileProgress<'_> {
    fn report(&mut self, bytes_done: u64, bytes_total: u64) -> bool {
        let delta = self.state.advance_bytes(bytes_done, bytes_total);
        self.poster.progress(delta);
        !self.cancel.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    #[test]
    fn test_progress_is_monotonic_and_clamped() {
        let mut state = TransferProgressState::new(100);
        assert_eq!(state.advance_to(30), 30);
        assert_eq!(state.advance_to(10), 0);
        assert_eq!(state.current(), 30);
        assert_eq!(state.advance_to(250), 70);
        assert_eq!(state.current(), 100);
        assert_eq!(state.advance_to(101), 0);
    }

    #[test]
    fn test_progress_scaling() {
        let mut state = TransferProgressState::new(100);
        assert_eq!(state.advance_bytes(512, 2048), 25);
        assert_eq!(state.advance_bytes(1024, 2048), 25);
        assert_eq!(state.advance_bytes(4096, 2048), 50);
    }

    #[test]
    fn test_empty_file_completes_immediately() {
        let mut state = TransferProgressState::new(100);
        assert_eq!(state.advance_bytes(0, 0), 100);
    }

    #[test]
    fn test_random_sequence_never_regresses() {
        let mut state = TransferProgressState::new(100);
        let mut last = 0;
        for value in [5u64, 3, 40, 40, 39, 80, 1000, 0, 99] {
            state.advance_to(value);
            assert!(state.current() >= last);
            assert!(state.current() <= state.total());
            last = state.current();
        }
    }

    #[test]
    fn test_file_progress_posts_deltas_and_stops_on_cancel() {
        let (tx, rx) = unbounded();
        let poster = MessagePoster::new(tx);
        let cancel = CancelToken::new();
        let mut sink = FileProgress::new(&poster, &cancel);

        assert!(sink.report(50, 100));
        cancel.cancel();
        assert!(!sink.report(60, 100));
        sink.complete();

        let deltas: Vec<u64> = rx
            .try_iter()
            .filter_map(|m| match m {
                OperationMessage::Progress { delta } => Some(delta),
                _ => None,
            })
            .collect();
        assert_eq!(deltas, vec![50, 10, 40]);
    }
}

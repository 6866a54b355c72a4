//! Task progress reporting.
//!
//! The runner emits an event as each subtask starts and finishes and as
//! record counts come in, so a host application can surface "3/7
//! subtasks, 12,400 records" without polling the task row.

use tracing::info;

/// A single progress event for a running task.
#[derive(Clone, Debug)]
pub enum ProgressEvent {
    /// A subtask began: n of total in the scheduled order.
    SubtaskStarted {
        subtask: String,
        number: usize,
        total: usize,
    },
    /// A subtask finished and contributed this many records.
    SubtaskFinished {
        subtask: String,
        number: usize,
        total: usize,
        records: u64,
    },
}

/// Receives progress events from the runner.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

/// Reporter that mirrors events into the log stream.
pub struct LogProgress;

impl ProgressReporter for LogProgress {
    fn report(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::SubtaskStarted {
                subtask,
                number,
                total,
            } => info!(%subtask, number, total, "subtask started"),
            ProgressEvent::SubtaskFinished {
                subtask,
                number,
                total,
                records,
            } => info!(%subtask, number, total, records, "subtask finished"),
        }
    }
}

//! Asynchronous report sink.
//!
//! The driver enqueues reports without blocking; one consumer thread writes
//! them to `log` and `failLog` in arrival order. After [`ReportLogger::close`]
//! the consumer drains whatever is still queued, settles the exit status and
//! hands the run summary to the exit hook. A failed log write ends the run
//! at once with status 1 and abandons the rest of the queue.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crate::artifact::RunSummary;
use crate::runtime::Report;

pub const MAIN_LOG: &str = "log";
pub const FAIL_LOG: &str = "failLog";

/// Runs on the logger thread once the run is settled. A hook that ends the
/// process makes the logger the owner of shutdown.
pub type ExitHook = Box<dyn FnOnce(&RunSummary) + Send + 'static>;

#[derive(Default)]
struct QueueState {
    reports: VecDeque<Report>,
    closed: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until a report is available or the queue is closed and empty.
    fn next(&self) -> Option<Report> {
        let mut state = self.lock();
        while state.reports.is_empty() && !state.closed {
            state = self
                .ready
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.reports.pop_front()
    }
}

pub struct ReportLogger {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<i32>>,
}

impl ReportLogger {
    pub fn spawn(log_dir: impl Into<PathBuf>) -> io::Result<Self> {
        Self::spawn_with_hook(log_dir, Box::new(|_: &RunSummary| {}))
    }

    /// Creates `log_dir`, truncates both logs and starts the consumer.
    pub fn spawn_with_hook(log_dir: impl Into<PathBuf>, on_exit: ExitHook) -> io::Result<Self> {
        let log_dir = log_dir.into();
        fs::create_dir_all(&log_dir)?;
        File::create(log_dir.join(MAIN_LOG))?;
        File::create(log_dir.join(FAIL_LOG))?;

        let shared = Arc::new(Shared::default());
        let consumer = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("report-logger".to_string())
            .spawn(move || {
                let mut summary = consume(&consumer, &log_dir);
                let status = summary.finish();
                if let Err(err) = summary.write_json(&log_dir) {
                    tracing::error!(dir = %log_dir.display(), "failed to write run summary: {err}");
                }
                tracing::info!(
                    passed = summary.passed_count(),
                    failed = summary.failed_count(),
                    status,
                    "report logger finished"
                );
                on_exit(&summary);
                status
            })?;

        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    pub fn enqueue(&self, report: Report) {
        let mut state = self.shared.lock();
        if state.closed {
            tracing::warn!(test = %report.test_id, "report logger closed; dropping report");
            return;
        }
        state.reports.push_back(report);
        self.shared.ready.notify_one();
    }

    /// Signals that no more reports will arrive and wakes the consumer.
    pub fn close(&self) {
        self.shared.lock().closed = true;
        self.shared.ready.notify_all();
    }

    /// Closes the queue and waits for the consumer's exit status.
    pub fn wait(mut self) -> i32 {
        self.close();
        match self.handle.take().map(JoinHandle::join) {
            Some(Ok(status)) => status,
            Some(Err(_)) => {
                tracing::error!("report logger thread panicked");
                1
            }
            None => 1,
        }
    }
}

impl Drop for ReportLogger {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.close();
        }
    }
}

fn consume(shared: &Shared, log_dir: &Path) -> RunSummary {
    let mut summary = RunSummary::default();
    while let Some(report) = shared.next() {
        if let Err(err) = write_report(log_dir, &report) {
            let pending = shared.lock().reports.len();
            tracing::error!(test = %report.test_id, pending, "failed to write log: {err}");
            summary.abort(err.to_string());
            break;
        }
        summary.record(&report);
    }
    summary
}

fn write_report(log_dir: &Path, report: &Report) -> io::Result<()> {
    append(&log_dir.join(MAIN_LOG), &format!("{report}\n"))?;
    if report.passed() {
        return Ok(());
    }

    let mut block = format!("{report}\n");
    for failure in report.failures() {
        block.push_str(&format!("{failure}\n"));
    }
    append(&log_dir.join(FAIL_LOG), &block)
}

fn append(path: &Path, text: &str) -> io::Result<()> {
    let mut file = OpenOptions::new().append(true).open(path)?;
    file.write_all(text.as_bytes())?;
    file.flush()
}

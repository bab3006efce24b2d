use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::thread;
use std::time::Duration;

use crate::script::{script_id, ScriptExpander};
use crate::step::{ActionExecutor, Step, StepFailure};

/// The application under test, opened before and closed after each script.
pub trait ActionableTarget {
    fn start_application(&mut self);
    fn exit_application(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub script_id: String,
    pub step_number: usize,
    pub message: String,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.script_id, self.step_number, self.message)
    }
}

/// Outcome of one top-level script. Passing exactly when no failure was
/// recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub test_id: String,
    failures: Vec<Failure>,
}

impl Report {
    pub fn new(test_id: impl Into<String>) -> Self {
        Self {
            test_id: test_id.into(),
            failures: Vec::new(),
        }
    }

    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failures(&self) -> &[Failure] {
        &self.failures
    }

    pub fn record(&mut self, failure: Failure) {
        self.failures.push(failure);
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.passed() { "pass" } else { "FAIL" };
        write!(f, "{} {status}", self.test_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    Passed,
    Failed,
}

pub struct ExecutionEngine {
    expander: ScriptExpander,
    target: Box<dyn ActionableTarget>,
    actions: Box<dyn ActionExecutor>,
    start_delay: Duration,
    shutdown_delay: Duration,
}

impl ExecutionEngine {
    pub fn new(
        expander: ScriptExpander,
        target: Box<dyn ActionableTarget>,
        actions: Box<dyn ActionExecutor>,
    ) -> Self {
        Self {
            expander,
            target,
            actions,
            start_delay: Duration::ZERO,
            shutdown_delay: Duration::ZERO,
        }
    }

    pub fn with_delays(mut self, start_delay: Duration, shutdown_delay: Duration) -> Self {
        self.start_delay = start_delay;
        self.shutdown_delay = shutdown_delay;
        self
    }

    pub fn expander(&self) -> &ScriptExpander {
        &self.expander
    }

    /// Expands and runs one top-level script. Never fails: parse errors and
    /// step failures end up in the report.
    pub fn run(&mut self, path: &Path) -> Report {
        let test_id = script_id(path);
        let mut report = Report::new(test_id.as_str());

        let steps = match self.expander.expand(path) {
            Ok(steps) => steps,
            Err(err) => {
                tracing::warn!(script = %test_id, "{err}");
                report.record(Failure {
                    script_id: test_id,
                    step_number: 0,
                    message: err.to_string(),
                });
                return report;
            }
        };
        tracing::info!(script = %test_id, steps = steps.len(), "running script");

        self.target.start_application();
        pause(self.start_delay);

        self.run_steps(&steps, &mut report);

        self.target.exit_application();
        pause(self.shutdown_delay);

        tracing::info!(script = %test_id, passed = report.passed(), "finished script");
        report
    }

    /// Runs `steps` in order, recording one failure per failed step and
    /// stopping after a failed step that is abort-flagged.
    pub fn run_steps(&mut self, steps: &[Step], report: &mut Report) {
        for (idx, step) in steps.iter().enumerate() {
            if let StepStatus::Failed = self.run_step(step, report) {
                if step.policy.abort_if_failed {
                    tracing::warn!(
                        step = %step,
                        skipped = steps.len() - idx - 1,
                        "aborting script after failed step"
                    );
                    break;
                }
            }
        }
    }

    fn run_step(&mut self, step: &Step, report: &mut Report) -> StepStatus {
        match attempt_with_retries(step, self.actions.as_mut()) {
            Ok(()) => StepStatus::Passed,
            Err(failure) => {
                report.record(Failure {
                    script_id: step.script_id.clone(),
                    step_number: step.step_number,
                    message: failure.to_string(),
                });
                StepStatus::Failed
            }
        }
    }
}

/// One initial attempt plus up to `retry_times` re-attempts, each preceded by
/// the retry delay. The error is the last attempt's.
fn attempt_with_retries(step: &Step, actions: &mut dyn ActionExecutor) -> Result<(), StepFailure> {
    let mut attempt = 0u32;
    loop {
        tracing::debug!(step = %step, attempt, "executing step");
        let failure = match step.execute(actions) {
            Ok(()) => return Ok(()),
            Err(failure) => failure,
        };
        if attempt >= step.policy.retry_times {
            return Err(failure);
        }
        attempt += 1;
        tracing::warn!(
            step = %step,
            attempt,
            of = step.policy.retry_times,
            "{failure}; retrying"
        );
        pause(step.policy.retry_delay());
    }
}

fn pause(duration: Duration) {
    if !duration.is_zero() {
        thread::sleep(duration);
    }
}

use comfy_table::{presets::ASCII_FULL, Table};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::runtime::{Failure, Report};

pub const SUMMARY_FILE: &str = "summary.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportRecord {
    pub test_id: String,
    pub passed: bool,
    #[serde(default)]
    pub failures: Vec<Failure>,
}

impl From<&Report> for ReportRecord {
    fn from(report: &Report) -> Self {
        Self {
            test_id: report.test_id.clone(),
            passed: report.passed(),
            failures: report.failures().to_vec(),
        }
    }
}

/// Everything the report logger saw during one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub generated_at: String,
    pub exit_status: i32,
    /// The logging error that ended the run early, if any.
    #[serde(default)]
    pub aborted: Option<String>,
    pub reports: Vec<ReportRecord>,
}

impl RunSummary {
    pub fn record(&mut self, report: &Report) {
        self.reports.push(ReportRecord::from(report));
    }

    pub fn abort(&mut self, reason: impl Into<String>) {
        self.aborted = Some(reason.into());
    }

    pub fn passed_count(&self) -> usize {
        self.reports.iter().filter(|report| report.passed).count()
    }

    pub fn failed_count(&self) -> usize {
        self.reports.len() - self.passed_count()
    }

    /// Stamps the summary and settles the exit status: 0 only when nothing
    /// failed and logging completed.
    pub fn finish(&mut self) -> i32 {
        self.generated_at = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_else(|_| "unknown".to_string());
        self.exit_status = if self.aborted.is_none() && self.failed_count() == 0 {
            0
        } else {
            1
        };
        self.exit_status
    }

    pub fn write_json(&self, dir: &Path) -> io::Result<PathBuf> {
        let path = dir.join(SUMMARY_FILE);
        let json = serde_json::to_string_pretty(self).map_err(io::Error::other)?;
        fs::write(&path, json)?;
        Ok(path)
    }

    pub fn render_table(&self) -> String {
        let mut display = Table::new();
        display.load_preset(ASCII_FULL);
        display.set_header(vec!["script", "result", "failures"]);

        for report in &self.reports {
            let failures = report
                .failures
                .iter()
                .map(|failure| format!("{} #{}: {}", failure.script_id, failure.step_number, failure.message))
                .collect::<Vec<_>>()
                .join("\n");
            let result = if report.passed { "pass" } else { "FAIL" };
            display.add_row(vec![report.test_id.clone(), result.to_string(), failures]);
        }

        let mut rendered = display.to_string();
        rendered.push_str(&format!(
            "\n{} passed, {} failed",
            self.passed_count(),
            self.failed_count()
        ));
        if let Some(reason) = &self.aborted {
            rendered.push_str(&format!("\nlogging aborted: {reason}"));
        }
        rendered
    }
}

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::script::ParseError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticLevel {
    Error,
    Warning,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Diagnostic {
    pub level: DiagnosticLevel,
    pub line: Option<usize>,
    pub message: String,
}

impl Diagnostic {
    pub fn error(line: Option<usize>, message: impl Into<String>) -> Self {
        Self {
            level: DiagnosticLevel::Error,
            line,
            message: message.into(),
        }
    }

    pub fn warning(line: Option<usize>, message: impl Into<String>) -> Self {
        Self {
            level: DiagnosticLevel::Warning,
            line,
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.level, DiagnosticLevel::Error)
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self.level {
            DiagnosticLevel::Error => "[Error]",
            DiagnosticLevel::Warning => "[Warning]",
        };
        match self.line {
            Some(line) => write!(f, "{label} at line number {line}: {}", self.message),
            None => write!(f, "{label} {}", self.message),
        }
    }
}

pub(crate) fn render_diagnostics(diagnostics: &[Diagnostic]) -> String {
    diagnostics
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Collects the diagnostics raised while walking a single script document.
pub(crate) struct DocumentDiagnostics {
    path: PathBuf,
    diagnostics: Vec<Diagnostic>,
}

impl DocumentDiagnostics {
    pub(crate) fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            diagnostics: Vec::new(),
        }
    }

    pub(crate) fn error(&mut self, line: usize, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic::error(Some(line), message));
    }

    pub(crate) fn warning(&mut self, line: usize, message: impl Into<String>) {
        let diag = Diagnostic::warning(Some(line), message);
        tracing::warn!(path = %self.path.display(), "{diag}");
        self.diagnostics.push(diag);
    }

    pub(crate) fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(Diagnostic::is_error)
    }

    /// Errors become one aggregated [`ParseError`]; warnings alone pass.
    pub(crate) fn finish(self) -> Result<Vec<Diagnostic>, ParseError> {
        if self.has_errors() {
            let diagnostics = self
                .diagnostics
                .into_iter()
                .filter(Diagnostic::is_error)
                .collect();
            return Err(ParseError::Invalid {
                path: self.path,
                diagnostics,
            });
        }
        Ok(self.diagnostics)
    }
}

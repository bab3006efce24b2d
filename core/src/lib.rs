pub mod artifact;
pub mod config;
pub mod document;
pub mod logger;
pub mod process;
pub mod registry;
pub mod runtime;
pub mod script;
pub mod step;
pub mod template;
pub mod validation;

pub use artifact::{ReportRecord, RunSummary, SUMMARY_FILE};
pub use config::{ConfigError, EngineConfig};
pub use document::{parse_document, DocumentError, Element};
pub use logger::{ExitHook, ReportLogger, FAIL_LOG, MAIN_LOG};
pub use process::{CommandExecutor, CommandTarget};
pub use registry::{StepConstructor, StepKind, StepRegistry};
pub use runtime::{ActionableTarget, ExecutionEngine, Failure, Report, StepStatus};
pub use script::{discover_scripts, script_id, ParseError, ScriptExpander};
pub use step::{
    AcceleratorStep, ActionError, ActionExecutor, ActionStep, CheckStep, DelayStep, Step, StepAction,
    StepDescriptor, StepFailure, StepPolicy,
};
pub use template::{materialize, RecordTemplate, TemplateEngine};
pub use validation::{Diagnostic, DiagnosticLevel};

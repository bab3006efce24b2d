//! Line-oriented `key=value` configuration.
//!
//! Both the engine configuration and the step registry mapping use this
//! format: one entry per line, `=` or `:` as separator, `#` and `!` comments.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const SCRIPT_EXTENSION: &str = "testScriptFileExtension";
pub const START_DELAY: &str = "startDelay";
pub const SHUTDOWN_DELAY: &str = "shutDownDelay";
pub const STEP_REGISTRY: &str = "stepRegistry";
pub const START_COMMAND: &str = "startCommand";
pub const EXIT_COMMAND: &str = "exitCommand";
pub const ACTION_COMMAND: &str = "actionCommand";
pub const PROBE_COMMAND: &str = "probeCommand";

const DEFAULT_EXTENSION: &str = ".xml";
const DEFAULT_REGISTRY_FILE: &str = "steps.properties";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("line {line}: expected key=value, found '{text}'")]
    Syntax { line: usize, text: String },
    #[error("{key} must be a non-negative integer, found '{value}'")]
    InvalidNumber { key: String, value: String },
    #[error("{key}: invalid command line: {message}")]
    InvalidCommand { key: String, message: String },
    #[error("line {line}: unknown step kind '{kind}' for tag '{tag}'")]
    UnknownKind {
        line: usize,
        tag: String,
        kind: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    pub key: String,
    pub value: String,
    pub line: usize,
}

pub fn parse_properties(source: &str) -> Result<Vec<Property>, ConfigError> {
    let mut properties = Vec::new();
    for (idx, raw_line) in source.lines().enumerate() {
        let trimmed = raw_line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with('!') {
            continue;
        }
        let split_at = trimmed
            .find(['=', ':'])
            .ok_or_else(|| ConfigError::Syntax {
                line: idx + 1,
                text: trimmed.to_string(),
            })?;
        let key = trimmed[..split_at].trim();
        if key.is_empty() {
            return Err(ConfigError::Syntax {
                line: idx + 1,
                text: trimmed.to_string(),
            });
        }
        properties.push(Property {
            key: key.to_string(),
            value: trimmed[split_at + 1..].trim().to_string(),
            line: idx + 1,
        });
    }
    Ok(properties)
}

pub fn read_properties(path: &Path) -> Result<Vec<Property>, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_properties(&content)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub script_extension: String,
    pub start_delay: Duration,
    pub shutdown_delay: Duration,
    pub registry_file: PathBuf,
    pub start_command: Option<Vec<String>>,
    pub exit_command: Option<Vec<String>>,
    pub action_command: Option<Vec<String>>,
    pub probe_command: Option<Vec<String>>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            script_extension: DEFAULT_EXTENSION.to_string(),
            start_delay: Duration::ZERO,
            shutdown_delay: Duration::ZERO,
            registry_file: PathBuf::from(DEFAULT_REGISTRY_FILE),
            start_command: None,
            exit_command: None,
            action_command: None,
            probe_command: None,
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let properties = read_properties(path)?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new(""));
        Self::from_properties(&properties, base_dir)
    }

    /// Relative paths in `properties` are resolved against `base_dir`.
    pub fn from_properties(properties: &[Property], base_dir: &Path) -> Result<Self, ConfigError> {
        let mut config = EngineConfig {
            registry_file: base_dir.join(DEFAULT_REGISTRY_FILE),
            ..EngineConfig::default()
        };

        for property in properties {
            let value = property.value.as_str();
            match property.key.as_str() {
                SCRIPT_EXTENSION => {
                    if !value.is_empty() {
                        config.script_extension = value.to_string();
                    }
                }
                START_DELAY => config.start_delay = parse_millis(START_DELAY, value)?,
                SHUTDOWN_DELAY => config.shutdown_delay = parse_millis(SHUTDOWN_DELAY, value)?,
                STEP_REGISTRY => config.registry_file = base_dir.join(value),
                START_COMMAND => config.start_command = parse_command(START_COMMAND, value)?,
                EXIT_COMMAND => config.exit_command = parse_command(EXIT_COMMAND, value)?,
                ACTION_COMMAND => config.action_command = parse_command(ACTION_COMMAND, value)?,
                PROBE_COMMAND => config.probe_command = parse_command(PROBE_COMMAND, value)?,
                other => {
                    tracing::warn!(key = other, line = property.line, "ignoring unknown config key");
                }
            }
        }

        Ok(config)
    }

    pub fn is_script(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|name| name.to_str())
            .map(|name| name.ends_with(self.script_extension.as_str()))
            .unwrap_or(false)
    }
}

fn parse_millis(key: &str, value: &str) -> Result<Duration, ConfigError> {
    if value.is_empty() {
        return Ok(Duration::ZERO);
    }
    value
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| ConfigError::InvalidNumber {
            key: key.to_string(),
            value: value.to_string(),
        })
}

fn parse_command(key: &str, value: &str) -> Result<Option<Vec<String>>, ConfigError> {
    let words = shell_words::split(value).map_err(|err| ConfigError::InvalidCommand {
        key: key.to_string(),
        message: err.to_string(),
    })?;
    Ok(if words.is_empty() { None } else { Some(words) })
}

use std::collections::BTreeMap;
use std::process::{Child, Command, Output};

use crate::config::EngineConfig;
use crate::runtime::ActionableTarget;
use crate::step::{ActionError, ActionExecutor};

/// Exit status an action or probe command uses to say the component does not
/// exist.
pub const EXIT_COMPONENT_NOT_FOUND: i32 = 3;
/// Exit status for an unsupported keyword (actions) or property (probes).
pub const EXIT_UNSUPPORTED: i32 = 4;
/// Exit status for arguments the action command rejected.
pub const EXIT_BAD_ARGUMENTS: i32 = 5;

fn command(words: &[String]) -> Option<Command> {
    let (program, args) = words.split_first()?;
    let mut cmd = Command::new(program);
    cmd.args(args);
    Some(cmd)
}

/// Starts the application under test with `startCommand` and stops it with
/// `exitCommand`, or by killing the spawned process when none is configured.
#[derive(Debug, Default)]
pub struct CommandTarget {
    start: Option<Vec<String>>,
    exit: Option<Vec<String>>,
    child: Option<Child>,
}

impl CommandTarget {
    pub fn new(start: Option<Vec<String>>, exit: Option<Vec<String>>) -> Self {
        Self {
            start,
            exit,
            child: None,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.start_command.clone(), config.exit_command.clone())
    }

    pub fn is_running(&self) -> bool {
        self.child.is_some()
    }
}

impl ActionableTarget for CommandTarget {
    fn start_application(&mut self) {
        let Some(mut cmd) = self.start.as_deref().and_then(command) else {
            tracing::debug!("no start command configured");
            return;
        };
        match cmd.spawn() {
            Ok(child) => {
                tracing::info!(pid = child.id(), "started application");
                self.child = Some(child);
            }
            Err(err) => tracing::warn!("failed to start application: {err}"),
        }
    }

    fn exit_application(&mut self) {
        if let Some(mut cmd) = self.exit.as_deref().and_then(command) {
            match cmd.status() {
                Ok(status) if status.success() => {}
                Ok(status) => tracing::warn!(%status, "exit command failed"),
                Err(err) => tracing::warn!("failed to run exit command: {err}"),
            }
        }

        let Some(mut child) = self.child.take() else {
            return;
        };
        if self.exit.is_none() {
            if let Err(err) = child.kill() {
                tracing::warn!(pid = child.id(), "failed to stop application: {err}");
            }
        }
        match child.wait() {
            Ok(status) => tracing::info!(%status, "application exited"),
            Err(err) => tracing::warn!("failed to reap application: {err}"),
        }
    }
}

impl Drop for CommandTarget {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// Drives the application through external commands:
/// `actionCommand <component> <keyword> <key=value>...` and
/// `probeCommand <component> <property>`, whose trimmed stdout is the
/// property's actual value.
#[derive(Debug, Clone, Default)]
pub struct CommandExecutor {
    action: Option<Vec<String>>,
    probe: Option<Vec<String>>,
}

impl CommandExecutor {
    pub fn new(action: Option<Vec<String>>, probe: Option<Vec<String>>) -> Self {
        Self { action, probe }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.action_command.clone(), config.probe_command.clone())
    }
}

fn invoke(base: Option<&[String]>, key: &str, extra: Vec<String>) -> Result<(String, Output), ActionError> {
    let base = base.ok_or_else(|| ActionError::Logical(format!("no {key} configured")))?;
    let mut words = base.to_vec();
    words.extend(extra);
    let invocation = shell_words::join(&words);
    let mut cmd = command(&words).ok_or_else(|| ActionError::Logical(format!("{key} is empty")))?;
    tracing::debug!(command = %invocation, "invoking");
    let output = cmd.output()?;
    Ok((invocation, output))
}

fn command_failure(invocation: String, output: &Output) -> ActionError {
    ActionError::Command {
        command: invocation,
        status: output.status.to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    }
}

impl ActionExecutor for CommandExecutor {
    fn perform_action(
        &mut self,
        component: &str,
        keyword: &str,
        args: &BTreeMap<String, String>,
    ) -> Result<(), ActionError> {
        let mut extra = vec![component.to_string(), keyword.to_string()];
        extra.extend(args.iter().map(|(key, value)| format!("{key}={value}")));
        let (invocation, output) = invoke(self.action.as_deref(), "actionCommand", extra)?;

        match output.status.code() {
            Some(0) => Ok(()),
            Some(EXIT_COMPONENT_NOT_FOUND) => Err(ActionError::ComponentNotFound(component.to_string())),
            Some(EXIT_UNSUPPORTED) => Err(ActionError::BadKeyword {
                component: component.to_string(),
                keyword: keyword.to_string(),
            }),
            Some(EXIT_BAD_ARGUMENTS) => Err(ActionError::BadArguments(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            )),
            _ => Err(command_failure(invocation, &output)),
        }
    }

    fn check_property(
        &mut self,
        component: &str,
        property: &str,
        expected: &str,
    ) -> Result<Option<String>, ActionError> {
        let extra = vec![component.to_string(), property.to_string()];
        let (invocation, output) = invoke(self.probe.as_deref(), "probeCommand", extra)?;

        match output.status.code() {
            Some(0) => {}
            Some(EXIT_COMPONENT_NOT_FOUND) => {
                return Err(ActionError::ComponentNotFound(component.to_string()))
            }
            Some(EXIT_UNSUPPORTED) => {
                return Err(ActionError::BadProperty {
                    component: component.to_string(),
                    property: property.to_string(),
                })
            }
            _ => return Err(command_failure(invocation, &output)),
        }

        let actual = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(if actual == expected { None } else { Some(actual) })
    }
}

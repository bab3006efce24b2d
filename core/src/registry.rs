use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::config::{parse_properties, read_properties, ConfigError, Property};
use crate::script::ParseError;
use crate::step::{
    AcceleratorStep, ActionStep, CheckStep, DelayStep, Step, StepAction, StepDescriptor,
    StepPolicy,
};

/// Builds the kind-specific part of a step from its descriptor.
pub type StepConstructor = fn(&StepDescriptor) -> Result<StepAction, ParseError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Action,
    Check,
    Delay,
    Accelerator,
}

impl StepKind {
    pub const ALL: [StepKind; 4] = [
        StepKind::Action,
        StepKind::Check,
        StepKind::Delay,
        StepKind::Accelerator,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StepKind::Action => "action",
            StepKind::Check => "check",
            StepKind::Delay => "delay",
            StepKind::Accelerator => "accelerator",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            StepKind::Action => "perform a keyword action on a named component",
            StepKind::Check => "compare a component property with an expected value",
            StepKind::Delay => "pause for delayTime milliseconds",
            StepKind::Accelerator => "press the keyboard shortcut given by controls and key",
        }
    }

    pub fn constructor(self) -> StepConstructor {
        match self {
            StepKind::Action => {
                |d: &StepDescriptor| ActionStep::from_descriptor(d).map(StepAction::Action)
            }
            StepKind::Check => {
                |d: &StepDescriptor| CheckStep::from_descriptor(d).map(StepAction::Check)
            }
            StepKind::Delay => {
                |d: &StepDescriptor| DelayStep::from_descriptor(d).map(StepAction::Delay)
            }
            StepKind::Accelerator => |d: &StepDescriptor| {
                AcceleratorStep::from_descriptor(d).map(StepAction::Accelerator)
            },
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StepKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| s.to_string())
    }
}

/// Maps script tags to step kinds. Built once at startup and shared by
/// reference with the expander.
#[derive(Debug, Clone, Default)]
pub struct StepRegistry {
    kinds: BTreeMap<String, StepKind>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tag: impl Into<String>, kind: StepKind) {
        self.kinds.insert(tag.into(), kind);
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let registry = Self::from_properties(&read_properties(path)?)?;
        tracing::debug!(path = %path.display(), tags = registry.len(), "loaded step registry");
        Ok(registry)
    }

    pub fn from_mapping(source: &str) -> Result<Self, ConfigError> {
        Self::from_properties(&parse_properties(source)?)
    }

    fn from_properties(properties: &[Property]) -> Result<Self, ConfigError> {
        let mut registry = Self::new();
        for property in properties {
            let kind = property
                .value
                .parse::<StepKind>()
                .map_err(|kind| ConfigError::UnknownKind {
                    line: property.line,
                    tag: property.key.clone(),
                    kind,
                })?;
            registry.register(property.key.clone(), kind);
        }
        Ok(registry)
    }

    pub fn kind_of(&self, tag: &str) -> Option<StepKind> {
        self.kinds.get(tag).copied()
    }

    pub fn tags(&self) -> impl Iterator<Item = (&str, StepKind)> {
        self.kinds.iter().map(|(tag, kind)| (tag.as_str(), *kind))
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    pub fn create(&self, descriptor: &StepDescriptor) -> Result<Step, ParseError> {
        let kind = self
            .kind_of(&descriptor.tag)
            .ok_or_else(|| ParseError::UnknownTag(descriptor.tag.clone()))?;
        let policy = StepPolicy::from_descriptor(descriptor)?;
        let action = (kind.constructor())(descriptor)?;
        Ok(Step {
            script_id: descriptor.script_id.clone(),
            step_number: descriptor.step_number,
            tag: descriptor.tag.clone(),
            policy,
            action,
        })
    }
}

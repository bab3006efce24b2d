use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::thread;
use std::time::Duration;

use crate::document::Element;
use crate::script::ParseError;

pub const ABORT_IF_FAILED: &str = "abortIfFailed";
pub const RETRY_TIMES: &str = "retryTimes";
pub const RETRY_DELAY: &str = "retryDelay";

const COMPONENT_NAME: &str = "componentName";
const KEYWORD: &str = "keyword";
const ARG_TAG: &str = "arg";
const ARG_TYPE: &str = "type";
const ARG_VALUE: &str = "value";
const PROPERTY: &str = "property";
const EXPECTED_VALUE: &str = "expectedValue";
const DELAY_TIME: &str = "delayTime";
const KEY: &str = "key";
const CONTROLS: &str = "controls";

/// Component and keyword an accelerator is performed as.
pub const KEYBOARD_COMPONENT: &str = "keyboard";
pub const ACCELERATOR_KEYWORD: &str = "accelerator";

/// Everything a step constructor gets to see about one script element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepDescriptor {
    pub tag: String,
    pub script_id: String,
    pub step_number: usize,
    pub line: usize,
    pub attributes: BTreeMap<String, String>,
    pub children: Vec<Element>,
}

impl StepDescriptor {
    pub fn from_element(element: &Element, script_id: impl Into<String>, step_number: usize) -> Self {
        Self {
            tag: element.name.clone(),
            script_id: script_id.into(),
            step_number,
            line: element.line,
            attributes: element.attributes.clone(),
            children: element.children.clone(),
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .get(name)
            .map(String::as_str)
            .filter(|value| !value.trim().is_empty())
    }

    fn required(&self, name: &str) -> Result<&str, ParseError> {
        self.attribute(name)
            .ok_or_else(|| ParseError::MissingAttribute {
                tag: self.tag.clone(),
                attribute: name.to_string(),
            })
    }

    fn non_negative(&self, name: &str) -> Result<Option<u64>, ParseError> {
        match self.attribute(name) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .map(Some)
                .map_err(|_| ParseError::InvalidNumber {
                    attribute: name.to_string(),
                    value: raw.to_string(),
                }),
        }
    }
}

/// The universal retry/abort attributes every step kind carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepPolicy {
    pub abort_if_failed: bool,
    pub retry_times: u32,
    pub retry_delay_ms: u64,
}

impl StepPolicy {
    pub fn from_descriptor(descriptor: &StepDescriptor) -> Result<Self, ParseError> {
        let abort_if_failed = descriptor
            .attribute(ABORT_IF_FAILED)
            .map(|value| value.trim().eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let retry_times = match descriptor.non_negative(RETRY_TIMES)? {
            None => 0,
            Some(times) => u32::try_from(times).map_err(|_| ParseError::InvalidNumber {
                attribute: RETRY_TIMES.to_string(),
                value: times.to_string(),
            })?,
        };
        let retry_delay_ms = descriptor.non_negative(RETRY_DELAY)?.unwrap_or(0);

        Ok(Self {
            abort_if_failed,
            retry_times,
            retry_delay_ms,
        })
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// One executable instruction, instantiated from a single script element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Step {
    pub script_id: String,
    pub step_number: usize,
    pub tag: String,
    pub policy: StepPolicy,
    pub action: StepAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepAction {
    Action(ActionStep),
    Check(CheckStep),
    Delay(DelayStep),
    Accelerator(AcceleratorStep),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionStep {
    pub component: String,
    pub keyword: String,
    pub args: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckStep {
    pub component: String,
    pub property: String,
    pub expected: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DelayStep {
    pub delay_ms: u64,
}

/// A keyboard shortcut: `controls` names the modifier chord, `key` the
/// optional key pressed with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AcceleratorStep {
    pub key: String,
    pub controls: String,
}

impl ActionStep {
    pub fn from_descriptor(descriptor: &StepDescriptor) -> Result<Self, ParseError> {
        let component = descriptor.required(COMPONENT_NAME)?.to_string();
        let keyword = descriptor.attribute(KEYWORD).unwrap_or_default().to_string();

        let mut args = BTreeMap::new();
        for child in &descriptor.children {
            for arg in child.descendants_named(ARG_TAG) {
                let key = arg.non_empty_attribute(ARG_TYPE).ok_or_else(|| {
                    ParseError::MissingAttribute {
                        tag: ARG_TAG.to_string(),
                        attribute: ARG_TYPE.to_string(),
                    }
                })?;
                let value = arg.attribute(ARG_VALUE).unwrap_or_default();
                args.insert(key.to_string(), value.to_string());
            }
        }

        Ok(Self {
            component,
            keyword,
            args,
        })
    }
}

impl CheckStep {
    pub fn from_descriptor(descriptor: &StepDescriptor) -> Result<Self, ParseError> {
        Ok(Self {
            component: descriptor.required(COMPONENT_NAME)?.to_string(),
            property: descriptor.required(PROPERTY)?.to_string(),
            expected: descriptor
                .attributes
                .get(EXPECTED_VALUE)
                .cloned()
                .unwrap_or_default(),
        })
    }
}

impl DelayStep {
    pub fn from_descriptor(descriptor: &StepDescriptor) -> Result<Self, ParseError> {
        descriptor.required(DELAY_TIME)?;
        let delay_ms = descriptor.non_negative(DELAY_TIME)?.unwrap_or(0);
        Ok(Self { delay_ms })
    }
}

impl AcceleratorStep {
    pub fn from_descriptor(descriptor: &StepDescriptor) -> Result<Self, ParseError> {
        Ok(Self {
            key: descriptor.attribute(KEY).unwrap_or_default().to_string(),
            controls: descriptor.required(CONTROLS)?.to_string(),
        })
    }

    fn args(&self) -> BTreeMap<String, String> {
        let mut args = BTreeMap::new();
        args.insert(CONTROLS.to_string(), self.controls.clone());
        if !self.key.is_empty() {
            args.insert(KEY.to_string(), self.key.clone());
        }
        args
    }
}

/// Interacts with and inspects the application under test on behalf of steps.
pub trait ActionExecutor {
    fn perform_action(
        &mut self,
        component: &str,
        keyword: &str,
        args: &BTreeMap<String, String>,
    ) -> Result<(), ActionError>;

    /// `Ok(None)` when the property holds the expected value, otherwise the
    /// actual value.
    fn check_property(
        &mut self,
        component: &str,
        property: &str,
        expected: &str,
    ) -> Result<Option<String>, ActionError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("Cannot find {0}")]
    ComponentNotFound(String),
    #[error("{keyword} is not a recognized keyword for component {component}")]
    BadKeyword { component: String, keyword: String },
    #[error("bad arguments: {0}")]
    BadArguments(String),
    #[error("{property} is not a recognized property for component {component}")]
    BadProperty { component: String, property: String },
    #[error("{0}")]
    Logical(String),
    #[error("command `{command}` exited with {status}: {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StepFailure {
    #[error("{0}")]
    Action(String),
    #[error("Component {component} failed check on property {property}; expected {expected} was {actual}")]
    Mismatch {
        component: String,
        property: String,
        expected: String,
        actual: String,
    },
}

impl From<ActionError> for StepFailure {
    fn from(err: ActionError) -> Self {
        StepFailure::Action(err.to_string())
    }
}

impl Step {
    pub fn execute(&self, actions: &mut dyn ActionExecutor) -> Result<(), StepFailure> {
        match &self.action {
            StepAction::Action(step) => {
                actions.perform_action(&step.component, &step.keyword, &step.args)?;
                Ok(())
            }
            StepAction::Check(step) => {
                match actions.check_property(&step.component, &step.property, &step.expected)? {
                    None => Ok(()),
                    Some(actual) => Err(StepFailure::Mismatch {
                        component: step.component.clone(),
                        property: step.property.clone(),
                        expected: step.expected.clone(),
                        actual,
                    }),
                }
            }
            StepAction::Delay(step) => {
                thread::sleep(Duration::from_millis(step.delay_ms));
                Ok(())
            }
            StepAction::Accelerator(step) => {
                actions.perform_action(KEYBOARD_COMPONENT, ACCELERATOR_KEYWORD, &step.args())?;
                Ok(())
            }
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} <{}>", self.script_id, self.step_number, self.tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::parse_document;

    fn descriptor(source: &str) -> StepDescriptor {
        let element = parse_document(source).expect("element parses");
        StepDescriptor::from_element(&element, "suite.xml", 1)
    }

    #[test]
    fn policy_defaults_when_attributes_absent() {
        let policy = StepPolicy::from_descriptor(&descriptor(r#"<click componentName="ok"/>"#))
            .expect("policy");
        assert_eq!(policy, StepPolicy::default());
    }

    #[test]
    fn policy_reads_all_attributes() {
        let policy = StepPolicy::from_descriptor(&descriptor(
            r#"<click abortIfFailed="TRUE" retryTimes="3" retryDelay="250"/>"#,
        ))
        .expect("policy");
        assert!(policy.abort_if_failed);
        assert_eq!(policy.retry_times, 3);
        assert_eq!(policy.retry_delay(), Duration::from_millis(250));
    }

    #[test]
    fn empty_numeric_attribute_counts_as_absent() {
        let policy =
            StepPolicy::from_descriptor(&descriptor(r#"<click retryTimes="" retryDelay=" "/>"#))
                .expect("policy");
        assert_eq!(policy.retry_times, 0);
        assert_eq!(policy.retry_delay_ms, 0);
    }

    #[test]
    fn negative_or_garbage_numbers_are_parse_errors() {
        let err = StepPolicy::from_descriptor(&descriptor(r#"<click retryTimes="-1"/>"#))
            .expect_err("negative rejected");
        assert_eq!(
            err,
            ParseError::InvalidNumber {
                attribute: RETRY_TIMES.to_string(),
                value: "-1".to_string()
            }
        );

        let err = StepPolicy::from_descriptor(&descriptor(r#"<click retryDelay="soon"/>"#))
            .expect_err("garbage rejected");
        assert!(err.to_string().contains("retryDelay"));
    }

    #[test]
    fn action_step_collects_args() {
        let step = ActionStep::from_descriptor(&descriptor(
            r#"<type componentName="name" keyword="type">
                 <arg type="text" value="hello"/>
                 <arg type="clear" value="true"/>
               </type>"#,
        ))
        .expect("action step");
        assert_eq!(step.component, "name");
        assert_eq!(step.keyword, "type");
        assert_eq!(step.args.get("text").map(String::as_str), Some("hello"));
        assert_eq!(step.args.len(), 2);
    }

    #[test]
    fn delay_requires_delay_time() {
        let err = DelayStep::from_descriptor(&descriptor(r#"<wait/>"#)).expect_err("required");
        assert!(matches!(err, ParseError::MissingAttribute { .. }));
        let step = DelayStep::from_descriptor(&descriptor(r#"<wait delayTime="5"/>"#))
            .expect("delay step");
        assert_eq!(step.delay_ms, 5);
    }

    struct Fixed(Option<String>);

    impl ActionExecutor for Fixed {
        fn perform_action(
            &mut self,
            component: &str,
            _keyword: &str,
            _args: &BTreeMap<String, String>,
        ) -> Result<(), ActionError> {
            Err(ActionError::ComponentNotFound(component.to_string()))
        }

        fn check_property(
            &mut self,
            _component: &str,
            _property: &str,
            _expected: &str,
        ) -> Result<Option<String>, ActionError> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn check_mismatch_names_expected_and_actual() {
        let step = Step {
            script_id: "suite.xml".to_string(),
            step_number: 2,
            tag: "check".to_string(),
            policy: StepPolicy::default(),
            action: StepAction::Check(CheckStep {
                component: "title".to_string(),
                property: "text".to_string(),
                expected: "Hello".to_string(),
            }),
        };
        let err = step
            .execute(&mut Fixed(Some("Bye".to_string())))
            .expect_err("mismatch");
        assert_eq!(
            err.to_string(),
            "Component title failed check on property text; expected Hello was Bye"
        );
        assert!(step.execute(&mut Fixed(None)).is_ok());
    }

    #[test]
    fn action_errors_become_step_failures() {
        let step = Step {
            script_id: "suite.xml".to_string(),
            step_number: 1,
            tag: "click".to_string(),
            policy: StepPolicy::default(),
            action: StepAction::Action(ActionStep {
                component: "ok".to_string(),
                keyword: "click".to_string(),
                args: BTreeMap::new(),
            }),
        };
        let err = step.execute(&mut Fixed(None)).expect_err("not found");
        assert_eq!(err, StepFailure::Action("Cannot find ok".to_string()));
    }

    #[test]
    fn accelerator_requires_controls_and_runs_as_keyboard_action() {
        let err = AcceleratorStep::from_descriptor(&descriptor(r#"<shortcut key="S"/>"#))
            .expect_err("controls required");
        assert_eq!(
            err,
            ParseError::MissingAttribute {
                tag: "shortcut".to_string(),
                attribute: CONTROLS.to_string()
            }
        );

        let accelerator =
            AcceleratorStep::from_descriptor(&descriptor(r#"<shortcut controls="ctrl shift"/>"#))
                .expect("key is optional");
        assert_eq!(accelerator.key, "");

        let step = Step {
            script_id: "suite.xml".to_string(),
            step_number: 1,
            tag: "shortcut".to_string(),
            policy: StepPolicy::default(),
            action: StepAction::Accelerator(accelerator),
        };
        let err = step.execute(&mut Fixed(None)).expect_err("routed to perform_action");
        assert_eq!(err, StepFailure::Action(format!("Cannot find {KEYBOARD_COMPONENT}")));
    }
}

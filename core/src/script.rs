use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use walkdir::WalkDir;

use crate::config::EngineConfig;
use crate::document::{parse_document, DocumentError, Element};
use crate::registry::StepRegistry;
use crate::step::{Step, StepDescriptor};
use crate::template::{materialize, RecordTemplate, TemplateEngine};
use crate::validation::{render_diagnostics, Diagnostic, DocumentDiagnostics};

pub const TEST_STEPS: &str = "testSteps";
pub const CALL_SCRIPT: &str = "callScript";
pub const CALL_SCRIPT_WITH_DATA: &str = "callScriptWithData";

const SCRIPT_ATTR: &str = "script";
const DATA_ATTR: &str = "data";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("failed to read {}: {message}", .path.display())]
    Read { path: PathBuf, message: String },
    #[error("{}: {source}", .path.display())]
    Document {
        path: PathBuf,
        source: DocumentError,
    },
    #[error("{}: no testSteps section", .path.display())]
    MissingSteps { path: PathBuf },
    #[error("errors parsing {}:\n{}", .path.display(), render_diagnostics(.diagnostics))]
    Invalid {
        path: PathBuf,
        diagnostics: Vec<Diagnostic>,
    },
    #[error("include cycle: {chain}")]
    IncludeCycle { chain: String },
    #[error("no handler for tag '{0}'")]
    UnknownTag(String),
    #[error("{attribute} must be a non-negative integer, found '{value}'")]
    InvalidNumber { attribute: String, value: String },
    #[error("<{tag}> requires a non-empty {attribute} attribute")]
    MissingAttribute { tag: String, attribute: String },
    #[error("template {}: {message}", .template.display())]
    Template { template: PathBuf, message: String },
}

pub(crate) fn load_document(path: &Path) -> Result<Element, ParseError> {
    let source = fs::read_to_string(path).map_err(|err| ParseError::Read {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;
    parse_document(&source).map_err(|source| ParseError::Document {
        path: path.to_path_buf(),
        source,
    })
}

pub fn script_id(path: &Path) -> String {
    path.display().to_string()
}

/// Where a document being expanded came from.
struct Source<'a> {
    path: &'a Path,
    id: String,
    /// Includes resolve against this directory. For generated scripts it is
    /// the template's directory, not the temporary file's.
    base_dir: PathBuf,
    /// Identity on the inclusion stack.
    key: PathBuf,
}

impl<'a> Source<'a> {
    fn file(path: &'a Path) -> Self {
        Self {
            path,
            id: script_id(path),
            base_dir: parent_dir(path),
            key: identity(path),
        }
    }
}

fn parent_dir(path: &Path) -> PathBuf {
    path.parent().map(Path::to_path_buf).unwrap_or_default()
}

fn identity(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Flattens a script and everything it includes into one ordered step list.
pub struct ScriptExpander {
    registry: Arc<StepRegistry>,
    templates: Box<dyn TemplateEngine>,
}

impl ScriptExpander {
    pub fn new(registry: Arc<StepRegistry>) -> Self {
        Self {
            registry,
            templates: Box::new(RecordTemplate),
        }
    }

    pub fn with_template_engine(mut self, templates: Box<dyn TemplateEngine>) -> Self {
        self.templates = templates;
        self
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    /// Expands `path` depth-first. Any error, at any inclusion depth, fails
    /// the whole expansion. A failed include is reported at the including
    /// element's line, together with the document's other errors.
    pub fn expand(&self, path: &Path) -> Result<Vec<Step>, ParseError> {
        let mut stack = Vec::new();
        self.expand_source(Source::file(path), &mut stack)
    }

    fn expand_source(
        &self,
        source: Source<'_>,
        stack: &mut Vec<PathBuf>,
    ) -> Result<Vec<Step>, ParseError> {
        if stack.contains(&source.key) {
            let chain = stack
                .iter()
                .chain(std::iter::once(&source.key))
                .map(|path| path.display().to_string())
                .collect::<Vec<_>>()
                .join(" -> ");
            return Err(ParseError::IncludeCycle { chain });
        }

        let root = load_document(source.path)?;
        stack.push(source.key.clone());
        let result = self.expand_root(&root, &source, stack);
        stack.pop();
        result
    }

    fn expand_root(
        &self,
        root: &Element,
        source: &Source<'_>,
        stack: &mut Vec<PathBuf>,
    ) -> Result<Vec<Step>, ParseError> {
        let sections = root.descendants_named(TEST_STEPS);
        let Some((section, extra)) = sections.split_first() else {
            return Err(ParseError::MissingSteps {
                path: source.path.to_path_buf(),
            });
        };

        let mut diagnostics = DocumentDiagnostics::new(source.path);
        for ignored in extra {
            diagnostics.warning(ignored.line, format!("ignoring extra {TEST_STEPS} section"));
        }

        let mut steps = Vec::new();
        let mut step_number = 0;
        for child in &section.children {
            match child.name.as_str() {
                CALL_SCRIPT => {
                    let Some(target) = child.non_empty_attribute(SCRIPT_ATTR) else {
                        diagnostics.error(
                            child.line,
                            format!("<{CALL_SCRIPT}> requires a {SCRIPT_ATTR} attribute"),
                        );
                        continue;
                    };
                    let included = source.base_dir.join(target);
                    tracing::debug!(from = %source.id, script = %included.display(), "including script");
                    match self.expand_source(Source::file(&included), stack) {
                        Ok(included) => steps.extend(included),
                        Err(err) => diagnostics.error(child.line, err.to_string()),
                    }
                }
                CALL_SCRIPT_WITH_DATA => {
                    let template = child.non_empty_attribute(SCRIPT_ATTR);
                    let data = child.non_empty_attribute(DATA_ATTR);
                    let (Some(template), Some(data)) = (template, data) else {
                        diagnostics.error(
                            child.line,
                            format!(
                                "<{CALL_SCRIPT_WITH_DATA}> requires {SCRIPT_ATTR} and {DATA_ATTR} attributes"
                            ),
                        );
                        continue;
                    };
                    let template = source.base_dir.join(template);
                    let data = source.base_dir.join(data);
                    match self.expand_generated(&template, &data, stack) {
                        Ok(generated) => steps.extend(generated),
                        Err(err) => diagnostics.error(child.line, err.to_string()),
                    }
                }
                _ => {
                    step_number += 1;
                    let descriptor = StepDescriptor::from_element(child, source.id.as_str(), step_number);
                    match self.registry.create(&descriptor) {
                        Ok(step) => steps.push(step),
                        Err(err) => diagnostics.error(child.line, err.to_string()),
                    }
                }
            }
        }

        diagnostics.finish()?;
        Ok(steps)
    }

    fn expand_generated(
        &self,
        template: &Path,
        data: &Path,
        stack: &mut Vec<PathBuf>,
    ) -> Result<Vec<Step>, ParseError> {
        let generated = materialize(self.templates.as_ref(), template, data)?;
        tracing::debug!(
            template = %template.display(),
            data = %data.display(),
            generated = %generated.path().display(),
            "generated script from data"
        );
        let source = Source {
            path: generated.path(),
            id: format!("{}[{}]", script_id(template), script_id(data)),
            base_dir: parent_dir(template),
            key: identity(template),
        };
        self.expand_source(source, stack)
    }
}

/// Every file under `dir` whose name ends with the configured script
/// extension, in sorted walk order. Symlinked directories are not entered.
pub fn discover_scripts(dir: &Path, config: &EngineConfig) -> io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry?;
        let path = entry.path();
        if path.is_file() && config.is_script(path) {
            found.push(path.to_path_buf());
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::StepAction;

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create fixture dir");
        }
        fs::write(&path, content).expect("write fixture");
        path
    }

    fn expander() -> ScriptExpander {
        let registry = StepRegistry::from_mapping(
            "click=action\ntype=action\nverify=check\nwait=delay\n",
        )
        .expect("mapping");
        ScriptExpander::new(Arc::new(registry))
    }

    fn components(steps: &[Step]) -> Vec<String> {
        steps
            .iter()
            .map(|step| match &step.action {
                StepAction::Action(action) => action.component.clone(),
                StepAction::Check(check) => check.component.clone(),
                StepAction::Delay(delay) => format!("wait{}", delay.delay_ms),
                StepAction::Accelerator(accelerator) => accelerator.controls.clone(),
            })
            .collect()
    }

    #[test]
    fn nested_includes_flatten_depth_first() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(
            dir.path(),
            "a.xml",
            r#"<script><testSteps>
                 <click componentName="a1"/>
                 <callScript script="lib/b.xml"/>
                 <click componentName="a2"/>
               </testSteps></script>"#,
        );
        write(
            dir.path(),
            "lib/b.xml",
            r#"<script><testSteps>
                 <click componentName="b1"/>
                 <callScript script="c.xml"/>
                 <click componentName="b2"/>
               </testSteps></script>"#,
        );
        write(
            dir.path(),
            "lib/c.xml",
            r#"<script><testSteps>
                 <click componentName="c1"/>
                 <click componentName="c2"/>
               </testSteps></script>"#,
        );

        let steps = expander().expand(&dir.path().join("a.xml")).expect("expands");
        assert_eq!(components(&steps), vec!["a1", "b1", "c1", "c2", "b2", "a2"]);

        let numbers: Vec<usize> = steps.iter().map(|step| step.step_number).collect();
        assert_eq!(numbers, vec![1, 1, 1, 2, 2, 2]);
        assert!(steps[2].script_id.ends_with("c.xml"));
        assert!(steps[5].script_id.ends_with("a.xml"));
    }

    #[test]
    fn missing_include_fails_whole_script() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write(
            dir.path(),
            "a.xml",
            r#"<script><testSteps>
                 <click componentName="a1"/>
                 <callScript script="absent.xml"/>
               </testSteps></script>"#,
        );
        let err = expander().expand(&path).expect_err("missing include");
        match &err {
            ParseError::Invalid { diagnostics, .. } => {
                assert_eq!(diagnostics.len(), 1);
                assert_eq!(diagnostics[0].line, Some(3));
                assert!(diagnostics[0].message.contains("failed to read"), "{err}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn include_failure_is_reported_with_sibling_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write(
            dir.path(),
            "a.xml",
            "<script>\n<testSteps>\n<clik componentName=\"a\"/>\n<callScript script=\"absent.xml\"/>\n<click componentName=\"b\"/>\n</testSteps>\n</script>",
        );
        let err = expander().expand(&path).expect_err("two errors");
        let message = err.to_string();
        assert!(
            message.contains("[Error] at line number 3: no handler for tag 'clik'"),
            "{message}"
        );
        assert!(message.contains("[Error] at line number 4: failed to read"), "{message}");
    }

    #[test]
    fn document_errors_are_aggregated_per_line() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write(
            dir.path(),
            "a.xml",
            "<script>\n<testSteps>\n<clik componentName=\"a\"/>\n<click componentName=\"b\" retryTimes=\"x\"/>\n<click componentName=\"c\"/>\n</testSteps>\n</script>",
        );
        let err = expander().expand(&path).expect_err("invalid document");
        match &err {
            ParseError::Invalid { diagnostics, .. } => {
                let lines: Vec<Option<usize>> = diagnostics.iter().map(|d| d.line).collect();
                assert_eq!(lines, vec![Some(3), Some(4)]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let message = err.to_string();
        assert!(message.contains("[Error] at line number 3: no handler for tag 'clik'"));
        assert!(message.contains("[Error] at line number 4: retryTimes must be"));
    }

    #[test]
    fn malformed_xml_names_the_line() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write(
            dir.path(),
            "a.xml",
            "<script>\n<testSteps>\n<click componentName=\"a\">\n</testSteps>\n</script>",
        );
        let err = expander().expand(&path).expect_err("malformed");
        assert!(matches!(err, ParseError::Document { .. }), "{err}");
    }

    #[test]
    fn missing_step_container_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write(dir.path(), "a.xml", "<script><steps/></script>");
        let err = expander().expand(&path).expect_err("no testSteps");
        assert!(matches!(err, ParseError::MissingSteps { .. }));
    }

    #[test]
    fn extra_step_sections_are_ignored() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write(
            dir.path(),
            "a.xml",
            r#"<script>
                 <testSteps><click componentName="first"/></testSteps>
                 <testSteps><click componentName="second"/></testSteps>
               </script>"#,
        );
        let steps = expander().expand(&path).expect("expands");
        assert_eq!(components(&steps), vec!["first"]);
    }

    #[test]
    fn include_cycles_are_detected() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(
            dir.path(),
            "a.xml",
            r#"<script><testSteps><callScript script="b.xml"/></testSteps></script>"#,
        );
        write(
            dir.path(),
            "b.xml",
            r#"<script><testSteps><callScript script="a.xml"/></testSteps></script>"#,
        );
        let err = expander().expand(&dir.path().join("a.xml")).expect_err("cycle");
        assert!(matches!(err, ParseError::Invalid { .. }), "{err}");
        assert!(err.to_string().contains("include cycle: "), "{err}");
    }

    #[test]
    fn shared_utility_may_be_included_twice() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(
            dir.path(),
            "login.xml",
            r#"<script><testSteps><click componentName="login"/></testSteps></script>"#,
        );
        let path = write(
            dir.path(),
            "a.xml",
            r#"<script><testSteps>
                 <callScript script="login.xml"/>
                 <callScript script="login.xml"/>
               </testSteps></script>"#,
        );
        let steps = expander().expand(&path).expect("expands");
        assert_eq!(components(&steps), vec!["login", "login"]);
    }

    #[test]
    fn data_driven_include_matches_pregenerated_script() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(
            dir.path(),
            "template.xml",
            r#"<script><testSteps>
                 <type componentName="user" keyword="type"><arg type="text" value="${name}"/></type>
                 <verify componentName="greeting" property="text" expectedValue="Hi ${name}" retryTimes="${retries}"/>
               </testSteps></script>"#,
        );
        write(
            dir.path(),
            "users.xml",
            r#"<users><user name="ann" retries="1"/><user name="bob" retries="0"/></users>"#,
        );
        let generated = write(
            dir.path(),
            "generated.xml",
            r#"<script><testSteps>
                 <callScriptWithData script="template.xml" data="users.xml"/>
               </testSteps></script>"#,
        );
        let manual = write(
            dir.path(),
            "manual.xml",
            r#"<script><testSteps>
                 <type componentName="user" keyword="type"><arg type="text" value="ann"/></type>
                 <verify componentName="greeting" property="text" expectedValue="Hi ann" retryTimes="1"/>
                 <type componentName="user" keyword="type"><arg type="text" value="bob"/></type>
                 <verify componentName="greeting" property="text" expectedValue="Hi bob" retryTimes="0"/>
               </testSteps></script>"#,
        );

        let expander = expander();
        let from_data = expander.expand(&generated).expect("generated expands");
        let by_hand = expander.expand(&manual).expect("manual expands");

        let shape = |steps: &[Step]| -> Vec<_> {
            steps
                .iter()
                .map(|step| (step.step_number, step.tag.clone(), step.policy, step.action.clone()))
                .collect()
        };
        assert_eq!(shape(&from_data), shape(&by_hand));
        assert!(from_data[0].script_id.ends_with("users.xml]"), "{}", from_data[0].script_id);
        assert!(from_data[0].script_id.contains("template.xml["));
    }

    #[test]
    fn discovers_scripts_recursively_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(dir.path(), "b.xml", "<script/>");
        write(dir.path(), "a.xml", "<script/>");
        write(dir.path(), "nested/c.xml", "<script/>");
        write(dir.path(), "notes.txt", "not a script");

        let found = discover_scripts(dir.path(), &EngineConfig::default()).expect("walks");
        let names: Vec<PathBuf> = found
            .iter()
            .map(|path| path.strip_prefix(dir.path()).expect("under dir").to_path_buf())
            .collect();
        assert_eq!(
            names,
            vec![
                PathBuf::from("a.xml"),
                PathBuf::from("b.xml"),
                PathBuf::from("nested/c.xml")
            ]
        );
    }

    #[cfg(unix)]
    #[test]
    fn discovery_does_not_follow_symlinked_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(dir.path(), "a.xml", "<script/>");
        fs::create_dir_all(dir.path().join("sub")).expect("sub dir");
        std::os::unix::fs::symlink(dir.path(), dir.path().join("sub/loop")).expect("symlink");

        let found = discover_scripts(dir.path(), &EngineConfig::default()).expect("walks");
        assert_eq!(found, vec![dir.path().join("a.xml")]);
    }
}

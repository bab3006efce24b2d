//! Data-driven script generation.
//!
//! A template is an ordinary script document whose step attributes may hold
//! `${name}` placeholders. The data file is an XML document whose root
//! children are records; every record re-emits the template's steps with its
//! bindings substituted.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;

use crate::document::Element;
use crate::script::{load_document, ParseError, TEST_STEPS};

pub trait TemplateEngine {
    /// Combines `template` with `data` into the source of a script document.
    fn render(&self, template: &Path, data: &Path) -> Result<String, ParseError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RecordTemplate;

impl TemplateEngine for RecordTemplate {
    fn render(&self, template: &Path, data: &Path) -> Result<String, ParseError> {
        let template_doc = load_document(template)?;
        let data_doc = load_document(data)?;

        let template_error = |message: String| ParseError::Template {
            template: template.to_path_buf(),
            message,
        };

        let sections = template_doc.descendants_named(TEST_STEPS);
        let section = sections
            .first()
            .ok_or_else(|| template_error(format!("no {TEST_STEPS} section")))?;

        let mut generated = Element::new(TEST_STEPS, section.line);
        for record in &data_doc.children {
            let bindings = record_bindings(record);
            for step in &section.children {
                generated
                    .children
                    .push(substitute(step, &bindings).map_err(&template_error)?);
            }
        }

        if template_doc.name == TEST_STEPS {
            return Ok(generated.to_xml());
        }
        let mut root = Element::new(template_doc.name.clone(), template_doc.line);
        root.children.push(generated);
        Ok(root.to_xml())
    }
}

/// Renders `template` against `data` into a temporary script file that lives
/// as long as the returned handle.
pub fn materialize(
    engine: &dyn TemplateEngine,
    template: &Path,
    data: &Path,
) -> Result<NamedTempFile, ParseError> {
    let rendered = engine.render(template, data)?;
    let io_error = |err: std::io::Error| ParseError::Template {
        template: template.to_path_buf(),
        message: format!("failed to write generated script: {err}"),
    };

    let mut file = tempfile::Builder::new()
        .prefix("stepwise-generated-")
        .suffix(".xml")
        .tempfile()
        .map_err(io_error)?;
    file.write_all(rendered.as_bytes()).map_err(io_error)?;
    file.flush().map_err(io_error)?;
    Ok(file)
}

/// Attributes of the record, plus leaf child elements as `name -> text`.
fn record_bindings(record: &Element) -> BTreeMap<String, String> {
    let mut bindings = record.attributes.clone();
    for child in &record.children {
        if child.children.is_empty() {
            bindings
                .entry(child.name.clone())
                .or_insert_with(|| child.text.clone());
        }
    }
    bindings
}

fn substitute(element: &Element, bindings: &BTreeMap<String, String>) -> Result<Element, String> {
    let mut out = Element::new(element.name.clone(), element.line);
    for (key, value) in &element.attributes {
        out.attributes
            .insert(key.clone(), fill(value, bindings, element.line)?);
    }
    out.text = fill(&element.text, bindings, element.line)?;
    for child in &element.children {
        out.children.push(substitute(child, bindings)?);
    }
    Ok(out)
}

fn fill(input: &str, bindings: &BTreeMap<String, String>, line: usize) -> Result<String, String> {
    let mut result = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| format!("unterminated variable placeholder at line {line}"))?;
        let name = after[..end].trim();
        let value = bindings
            .get(name)
            .ok_or_else(|| format!("unbound placeholder ${{{name}}} at line {line}"))?;
        result.push_str(value);
        rest = &after[end + 1..];
    }
    result.push_str(rest);
    Ok(result)
}

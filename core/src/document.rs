use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// A parsed XML element with its attributes, element children and the
/// 1-based line its start tag appears on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element {
    pub name: String,
    pub attributes: BTreeMap<String, String>,
    pub children: Vec<Element>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DocumentError {
    #[error("syntax error at line {line}: {message}")]
    Syntax { line: usize, message: String },
    #[error("document has no root element")]
    Empty,
    #[error("element <{name}> opened at line {line} is never closed")]
    Unclosed { name: String, line: usize },
}

impl DocumentError {
    pub fn line(&self) -> Option<usize> {
        match self {
            DocumentError::Syntax { line, .. } | DocumentError::Unclosed { line, .. } => {
                Some(*line)
            }
            DocumentError::Empty => None,
        }
    }
}

impl Element {
    pub fn new(name: impl Into<String>, line: usize) -> Self {
        Self {
            name: name.into(),
            attributes: BTreeMap::new(),
            children: Vec::new(),
            text: String::new(),
            line,
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// Non-empty attribute value, treating `attr=""` as absent.
    pub fn non_empty_attribute(&self, name: &str) -> Option<&str> {
        self.attribute(name).filter(|value| !value.trim().is_empty())
    }

    /// Every element named `name` in this subtree, in document order.
    pub fn descendants_named<'a>(&'a self, name: &str) -> Vec<&'a Element> {
        let mut found = Vec::new();
        collect_named(self, name, &mut found);
        found
    }

    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        write_element(self, 0, &mut out);
        out
    }
}

fn collect_named<'a>(element: &'a Element, name: &str, found: &mut Vec<&'a Element>) {
    if element.name == name {
        found.push(element);
    }
    for child in &element.children {
        collect_named(child, name, found);
    }
}

fn write_element(element: &Element, depth: usize, out: &mut String) {
    let indent = "  ".repeat(depth);
    let _ = write!(out, "{indent}<{}", element.name);
    for (key, value) in &element.attributes {
        let _ = write!(out, " {key}=\"{}\"", escape(value.as_str()));
    }
    if element.children.is_empty() && element.text.is_empty() {
        out.push_str("/>\n");
        return;
    }
    out.push('>');
    if element.children.is_empty() {
        out.push_str(&escape(element.text.as_str()));
        let _ = writeln!(out, "</{}>", element.name);
        return;
    }
    out.push('\n');
    if !element.text.is_empty() {
        let _ = writeln!(out, "{indent}  {}", escape(element.text.as_str()));
    }
    for child in &element.children {
        write_element(child, depth + 1, out);
    }
    let _ = writeln!(out, "{indent}</{}>", element.name);
}

pub fn parse_document(source: &str) -> Result<Element, DocumentError> {
    let mut reader = Reader::from_str(source);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        let before = reader.buffer_position() as usize;
        let event = reader.read_event().map_err(|err| DocumentError::Syntax {
            line: line_at(source, reader.error_position() as usize),
            message: err.to_string(),
        })?;

        match event {
            Event::Start(start) => {
                let line = tag_line(source, before);
                let element = build_element(&start, line)?;
                stack.push(element);
            }
            Event::Empty(start) => {
                let line = tag_line(source, before);
                let element = build_element(&start, line)?;
                attach(element, &mut stack, &mut root, source, before)?;
            }
            Event::End(_) => {
                if let Some(element) = stack.pop() {
                    attach(element, &mut stack, &mut root, source, before)?;
                }
            }
            Event::Text(text) => {
                if let Some(current) = stack.last_mut() {
                    let value = text.unescape().map_err(|err| DocumentError::Syntax {
                        line: line_at(source, before),
                        message: err.to_string(),
                    })?;
                    current.text.push_str(value.trim());
                }
            }
            Event::CData(data) => {
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&String::from_utf8_lossy(&data));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if let Some(open) = stack.pop() {
        return Err(DocumentError::Unclosed {
            name: open.name,
            line: open.line,
        });
    }

    root.ok_or(DocumentError::Empty)
}

fn build_element(start: &BytesStart<'_>, line: usize) -> Result<Element, DocumentError> {
    let name = String::from_utf8_lossy(start.name().as_ref()).to_string();
    let mut element = Element::new(name, line);
    for attr in start.attributes() {
        let attr = attr.map_err(|err| DocumentError::Syntax {
            line,
            message: err.to_string(),
        })?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
        let value = attr
            .unescape_value()
            .map_err(|err| DocumentError::Syntax {
                line,
                message: err.to_string(),
            })?
            .to_string();
        element.attributes.insert(key, value);
    }
    Ok(element)
}

fn attach(
    element: Element,
    stack: &mut [Element],
    root: &mut Option<Element>,
    source: &str,
    offset: usize,
) -> Result<(), DocumentError> {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(element);
        return Ok(());
    }
    if root.is_some() {
        return Err(DocumentError::Syntax {
            line: line_at(source, offset),
            message: format!("unexpected second root element <{}>", element.name),
        });
    }
    *root = Some(element);
    Ok(())
}

/// Line of the first `<` at or after `offset`.
fn tag_line(source: &str, offset: usize) -> usize {
    let bytes = source.as_bytes();
    let start = offset.min(bytes.len());
    let tag = bytes[start..]
        .iter()
        .position(|b| *b == b'<')
        .map(|pos| start + pos)
        .unwrap_or(start);
    line_at(source, tag)
}

fn line_at(source: &str, offset: usize) -> usize {
    let bytes = source.as_bytes();
    let end = offset.min(bytes.len());
    bytes[..end].iter().filter(|b| **b == b'\n').count() + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_tree_with_lines_and_attributes() {
        let source = r#"<?xml version="1.0"?>
<script>
  <!-- comment -->
  <testSteps>
    <click componentName="ok" abortIfFailed="true"/>
    <type componentName="name">
      <arg type="text" value="a &amp; b"/>
    </type>
  </testSteps>
</script>
"#;
        let root = parse_document(source).expect("document parses");
        assert_eq!(root.name, "script");
        assert_eq!(root.line, 2);

        let steps = root.descendants_named("testSteps");
        assert_eq!(steps.len(), 1);
        let section = steps[0];
        assert_eq!(section.line, 4);
        assert_eq!(section.children.len(), 2);

        let click = &section.children[0];
        assert_eq!(click.line, 5);
        assert_eq!(click.attribute("componentName"), Some("ok"));
        assert_eq!(click.attribute("abortIfFailed"), Some("true"));

        let arg = &section.children[1].children[0];
        assert_eq!(arg.line, 7);
        assert_eq!(arg.attribute("value"), Some("a & b"));
    }

    #[test]
    fn reports_syntax_error_line() {
        let source = "<script>\n  <testSteps>\n    <click>\n  </testSteps>\n</script>\n";
        let err = parse_document(source).expect_err("mismatched tags rejected");
        match err {
            DocumentError::Syntax { line, .. } => assert!(line >= 3, "line was {line}"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn empty_document_is_rejected() {
        assert_eq!(parse_document("   \n"), Err(DocumentError::Empty));
    }

    #[test]
    fn serialized_tree_parses_back_to_same_elements() {
        let source = r#"<script><testSteps><check componentName="a&lt;b" expectedValue="x"/></testSteps></script>"#;
        let root = parse_document(source).expect("document parses");
        let reparsed = parse_document(&root.to_xml()).expect("serialized parses");
        assert_eq!(
            reparsed.descendants_named("check")[0].attributes,
            root.descendants_named("check")[0].attributes
        );
    }
}

//! `{{ .key }}` attribute placeholders in graph and collection definitions.
//!
//! Substitution is purely textual: produced text is not re-scanned and there
//! is no arithmetic or branching. Unknown keys expand to the empty string.

use std::collections::BTreeSet;

use serde_json::Value;
use thiserror::Error;

use crate::error::ErrorKind;
use crate::record::Attributes;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unterminated placeholder at offset {0}")]
    Unterminated(usize),
    #[error("empty placeholder identifier at offset {0}")]
    EmptyIdentifier(usize),
    #[error("invalid placeholder {0:?}")]
    InvalidIdentifier(String),
    #[error("missing template attribute {0:?}")]
    MissingAttribute(String),
}

impl TemplateError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Template
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Text(String),
    Key(String),
}

/// A parsed template string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    parts: Vec<Part>,
}

impl Template {
    pub fn parse(input: &str) -> Result<Self, TemplateError> {
        let mut parts = Vec::new();
        let mut rest = input;
        let mut offset = 0;

        while let Some(open) = rest.find("{{") {
            if open > 0 {
                parts.push(Part::Text(rest[..open].to_string()));
            }
            let body_start = open + 2;
            let close = rest[body_start..]
                .find("}}")
                .ok_or(TemplateError::Unterminated(offset + open))?;

            let body = rest[body_start..body_start + close].trim();
            parts.push(Part::Key(parse_identifier(body, offset + open)?));

            let consumed = body_start + close + 2;
            offset += consumed;
            rest = &rest[consumed..];
        }
        if !rest.is_empty() {
            parts.push(Part::Text(rest.to_string()));
        }

        Ok(Self { parts })
    }

    /// Distinct placeholder keys, sorted.
    pub fn keys(&self) -> BTreeSet<&str> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Key(k) => Some(k.as_str()),
                Part::Text(_) => None,
            })
            .collect()
    }

    pub fn render(&self, attributes: &Attributes) -> String {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                Part::Text(t) => out.push_str(t),
                Part::Key(k) => {
                    if let Some(v) = attributes.get(k) {
                        push_value(&mut out, v);
                    }
                }
            }
        }
        out
    }
}

/// Parses and renders `input` in one go.
pub fn expand(input: &str, attributes: &Attributes) -> Result<String, TemplateError> {
    if !input.contains("{{") {
        return Ok(input.to_string());
    }
    Ok(Template::parse(input)?.render(attributes))
}

fn parse_identifier(body: &str, at: usize) -> Result<String, TemplateError> {
    let Some(ident) = body.strip_prefix('.') else {
        return if body.is_empty() {
            Err(TemplateError::EmptyIdentifier(at))
        } else {
            Err(TemplateError::InvalidIdentifier(body.to_string()))
        };
    };

    let mut chars = ident.chars();
    match chars.next() {
        None => Err(TemplateError::EmptyIdentifier(at)),
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            if chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
                Ok(ident.to_string())
            } else {
                Err(TemplateError::InvalidIdentifier(body.to_string()))
            }
        }
        Some(_) => Err(TemplateError::InvalidIdentifier(body.to_string())),
    }
}

fn push_value(out: &mut String, value: &Value) {
    match value {
        Value::Null => {}
        Value::String(s) => out.push_str(s),
        other => out.push_str(&other.to_string()),
    }
}

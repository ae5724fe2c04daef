//! URI templates for parametrized resources
//!
//! A template such as `/projects/{p}/issues/{i}` compiles into an anchored
//! matcher where every `{name}` captures exactly one path segment. Literal text
//! must match exactly and a segment-count mismatch is a non-match.

use std::collections::HashMap;

use regex::Regex;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("unbalanced brace at byte {0}")]
    UnbalancedBrace(usize),
    #[error("empty parameter name at byte {0}")]
    EmptyParameter(usize),
    #[error("invalid parameter name {0:?}")]
    InvalidParameter(String),
    #[error("parameter {0:?} appears more than once")]
    DuplicateParameter(String),
    #[error("template does not compile: {0}")]
    Regex(String),
}

#[derive(Debug, Clone)]
pub struct UriTemplate {
    pattern: String,
    params: Vec<String>,
    matcher: Regex,
}

impl UriTemplate {
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }

    pub fn matches(&self, uri: &str) -> Option<HashMap<String, String>> {
        match_uri(self, uri)
    }
}

enum Piece<'a> {
    Literal(&'a str),
    Param(&'a str),
}

fn split_pattern(pattern: &str) -> Result<Vec<Piece<'_>>, TemplateError> {
    let mut pieces = Vec::new();
    let mut literal_start = 0;
    let mut open: Option<usize> = None;

    for (index, ch) in pattern.char_indices() {
        match (ch, open) {
            ('{', None) => {
                if index > literal_start {
                    pieces.push(Piece::Literal(&pattern[literal_start..index]));
                }
                open = Some(index);
            }
            ('{', Some(_)) => return Err(TemplateError::UnbalancedBrace(index)),
            ('}', Some(start)) => {
                let name = &pattern[start + 1..index];
                if name.is_empty() {
                    return Err(TemplateError::EmptyParameter(start));
                }
                pieces.push(Piece::Param(name));
                open = None;
                literal_start = index + 1;
            }
            ('}', None) => return Err(TemplateError::UnbalancedBrace(index)),
            _ => {}
        }
    }

    if let Some(start) = open {
        return Err(TemplateError::UnbalancedBrace(start));
    }
    if literal_start < pattern.len() {
        pieces.push(Piece::Literal(&pattern[literal_start..]));
    }
    Ok(pieces)
}

fn is_valid_param_name(name: &str) -> bool {
    name.chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-')
}

pub fn compile_uri_template(pattern: &str) -> Result<UriTemplate, TemplateError> {
    let mut params: Vec<String> = Vec::new();
    let mut source = String::from("^");

    for piece in split_pattern(pattern)? {
        match piece {
            Piece::Literal(text) => source.push_str(&regex::escape(text)),
            Piece::Param(name) => {
                if !is_valid_param_name(name) {
                    return Err(TemplateError::InvalidParameter(name.to_string()));
                }
                if params.iter().any(|existing| existing == name) {
                    return Err(TemplateError::DuplicateParameter(name.to_string()));
                }
                params.push(name.to_string());
                // lazy so adjacent params in one segment split at the first literal
                source.push_str("([^/]+?)");
            }
        }
    }
    source.push('$');

    let matcher = Regex::new(&source).map_err(|err| TemplateError::Regex(err.to_string()))?;
    Ok(UriTemplate {
        pattern: pattern.to_string(),
        params,
        matcher,
    })
}

pub fn match_uri(template: &UriTemplate, uri: &str) -> Option<HashMap<String, String>> {
    let captures = template.matcher.captures(uri)?;
    template
        .params
        .iter()
        .enumerate()
        .map(|(index, name)| {
            captures
                .get(index + 1)
                .map(|value| (name.clone(), value.as_str().to_string()))
        })
        .collect()
}

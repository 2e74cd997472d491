//! Extraction of structured results from free-form model output.
//!
//! Small models wrap JSON in prose, fences, or get the punctuation slightly
//! wrong. [`parse`] tries progressively more forgiving readings and validates
//! the first one that decodes.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::stages::{OutputKind, OutputSpec};

/// A parsed stage result.
#[derive(Debug, Clone, PartialEq)]
pub enum Parsed {
    Structured(Value),
    Text(String),
}

impl Parsed {
    pub fn into_value(self) -> Value {
        match self {
            Parsed::Structured(v) => v,
            Parsed::Text(s) => Value::String(s),
        }
    }
}

/// Output that could not be turned into a result. Keeps the raw text for the trace.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("parse error: {reason}")]
pub struct ParseError {
    pub reason: String,
    pub raw: String,
}

impl ParseError {
    fn new(reason: impl Into<String>, raw: &str) -> Self {
        Self {
            reason: reason.into(),
            raw: raw.to_string(),
        }
    }
}

/// Upper bound on top-level blocks examined in one response.
const MAX_BLOCKS: usize = 8;

pub fn parse(raw: &str, spec: &OutputSpec) -> Result<Parsed, ParseError> {
    match spec.kind {
        OutputKind::FreeText => {
            if raw.trim().is_empty() {
                Err(ParseError::new("empty response", raw))
            } else {
                Ok(Parsed::Text(raw.to_string()))
            }
        }
        OutputKind::Structured => parse_structured(raw, spec).map(Parsed::Structured),
    }
}

fn parse_structured(raw: &str, spec: &OutputSpec) -> Result<Value, ParseError> {
    let cleaned = strip_fences(raw);
    if cleaned.is_empty() {
        return Err(ParseError::new("empty response", raw));
    }

    let mut rejection: Option<String> = None;
    let mut accept = |value: Value| -> Option<Value> {
        match validate(value, spec) {
            Ok(v) => Some(v),
            Err(reason) => {
                rejection = Some(reason);
                None
            }
        }
    };

    if let Ok(value) = serde_json::from_str::<Value>(&cleaned) {
        if let Some(v) = accept(value) {
            return Ok(v);
        }
    }

    let blocks = top_level_blocks(&cleaned);
    for block in &blocks {
        if let Ok(value) = serde_json::from_str::<Value>(block) {
            if let Some(v) = accept(value) {
                return Ok(v);
            }
        }
    }

    let bases: Vec<&str> = match (blocks.first(), first_opener(&cleaned)) {
        (Some(block), _) => vec![*block],
        (None, Some(start)) => {
            let tail = &cleaned[start..];
            // An unclosed payload followed by prose: also try without the prose.
            match tail.rfind(['}', ']']) {
                Some(end) if end + 1 < tail.len() => vec![tail, &tail[..=end]],
                _ => vec![tail],
            }
        }
        (None, None) => Vec::new(),
    };
    for base in bases {
        let mut text = base.to_string();
        for repair in REPAIRS {
            text = repair(&text);
            if let Ok(value) = serde_json::from_str::<Value>(&text) {
                if let Some(v) = accept(value) {
                    return Ok(v);
                }
            }
        }
    }

    let reason = rejection.unwrap_or_else(|| "no decodable JSON found".to_string());
    Err(ParseError::new(reason, raw))
}

/// Unwrap and check required keys.
fn validate(value: Value, spec: &OutputSpec) -> Result<Value, String> {
    let value = match (spec.unwrap_key, value) {
        (Some(key), Value::Object(mut obj)) if obj.get(key).is_some_and(Value::is_object) => {
            obj.remove(key).unwrap_or(Value::Null)
        }
        (_, value) => value,
    };

    if spec.required_keys.is_empty() {
        return Ok(value);
    }
    let Some(obj) = value.as_object() else {
        return Err(format!("expected an object, got {}", kind_name(&value)));
    };
    if let Some(missing) = spec.required_keys.iter().find(|k| !obj.contains_key(**k)) {
        return Err(format!("missing '{missing}'"));
    }
    Ok(value)
}

fn kind_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn strip_fences(raw: &str) -> String {
    raw.replace("```json", "")
        .replace("```JSON", "")
        .replace("```", "")
        .trim()
        .to_string()
}

fn first_opener(text: &str) -> Option<usize> {
    text.find(['{', '['])
}

/// Byte index one past the closer matching the opener at `start`.
/// Delimiters inside strings are ignored and escapes respected.
fn match_block(text: &str, start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_str = false;
    let mut esc = false;
    for (i, c) in text[start..].char_indices() {
        if in_str {
            if esc {
                esc = false;
            } else if c == '\\' {
                esc = true;
            } else if c == '"' {
                in_str = false;
            }
            continue;
        }
        match c {
            '"' => in_str = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(start + i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// Balanced blocks at depth zero, in order of appearance.
fn top_level_blocks(text: &str) -> Vec<&str> {
    let mut blocks = Vec::new();
    let mut pos = 0;
    while blocks.len() < MAX_BLOCKS {
        let Some(offset) = first_opener(&text[pos..]) else {
            break;
        };
        let start = pos + offset;
        match match_block(text, start) {
            Some(end) => {
                blocks.push(&text[start..end]);
                pos = end;
            }
            None => break,
        }
    }
    blocks
}

// =============================================================================
// REPAIRS
// =============================================================================

static OBJECT_THEN_STRING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\}\s*""#).expect("Invalid object separator regex"));
static ARRAY_THEN_STRING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\]\s*""#).expect("Invalid array separator regex"));
static STRING_LINE_STRING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""\s*\n\s*""#).expect("Invalid line separator regex"));
// A scalar directly followed by the next key on the same line.
static SCALAR_THEN_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"([0-9el"])[ \t]+("[^"\n]*"\s*:)"#).expect("Invalid key separator regex")
});
static TRAILING_SEPARATOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#",\s*([}\]])"#).expect("Invalid trailing separator regex"));

type Repair = fn(&str) -> String;

/// Applied cumulatively, decoding after each.
const REPAIRS: &[Repair] = &[insert_separators, drop_trailing_separators, pad_closers];

fn insert_separators(text: &str) -> String {
    let text = OBJECT_THEN_STRING.replace_all(text, "}, \"");
    let text = ARRAY_THEN_STRING.replace_all(&text, "], \"");
    let text = STRING_LINE_STRING.replace_all(&text, "\",\n\"");
    SCALAR_THEN_KEY.replace_all(&text, "$1, $2").into_owned()
}

fn drop_trailing_separators(text: &str) -> String {
    TRAILING_SEPARATOR.replace_all(text, "$1").into_owned()
}

/// Close an unterminated string and every unclosed bracket, innermost first.
fn pad_closers(text: &str) -> String {
    let mut stack = Vec::new();
    let mut in_str = false;
    let mut esc = false;
    for c in text.chars() {
        if in_str {
            if esc {
                esc = false;
            } else if c == '\\' {
                esc = true;
            } else if c == '"' {
                in_str = false;
            }
            continue;
        }
        match c {
            '"' => in_str = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                stack.pop();
            }
            _ => {}
        }
    }

    let mut out = text.trim_end().to_string();
    if in_str {
        out.push('"');
    }
    if out.ends_with(',') {
        out.pop();
    }
    while let Some(closer) = stack.pop() {
        out.push(closer);
    }
    out
}

//! Per-client records and output format compilation.

use serde_json::Value;
use tokio::net::unix::OwnedWriteHalf;

use crate::events::EventClass;
use crate::metadata::{self, Metadata};

/// Substituted for template placeholders with no matching metadata key.
pub const MISSING_VALUE: &str = "(nothing)";

/// A compiled client output format.
#[derive(Debug, Clone, PartialEq)]
pub enum FormatSpec {
    /// Dump the full metadata dictionary as JSON.
    All,
    /// A template string with `{key}` placeholders.
    Template(String),
    /// An output object whose `|key|` tokens are replaced by metadata
    /// values.
    JsonMap(serde_json::Map<String, Value>),
}

impl FormatSpec {
    /// Compile the handshake's `format_type` and `format` fields.
    ///
    /// For the `json` type the format may be an object, or a string
    /// containing one (clients that pack their whole handshake as flat
    /// strings send the latter).
    pub fn compile(format_type: &str, format: &Value) -> Result<Self, String> {
        if let Value::String(s) = format
            && s == "all"
        {
            return Ok(FormatSpec::All);
        }
        match format_type {
            "str" => match format {
                Value::String(template) => Ok(FormatSpec::Template(template.clone())),
                _ => Err("'format' must be a string for format_type 'str'".to_string()),
            },
            "json" => match format {
                Value::Object(map) => Ok(FormatSpec::JsonMap(map.clone())),
                Value::String(text) => match serde_json::from_str::<Value>(text) {
                    Ok(Value::Object(map)) => Ok(FormatSpec::JsonMap(map)),
                    _ => Err("'format' must be a JSON object for format_type 'json'".to_string()),
                },
                _ => Err("'format' must be a JSON object for format_type 'json'".to_string()),
            },
            other => Err(format!("invalid format_type: {other}")),
        }
    }

    /// Render metadata for this client. Keys are rewritten from `:` to
    /// `|` before substitution.
    pub fn fill(&self, raw: &Metadata) -> String {
        let piped = metadata::pipe_keys(raw);
        match self {
            FormatSpec::All => {
                serde_json::to_string(&piped).unwrap_or_else(|_| "{}".to_string())
            }
            FormatSpec::Template(template) => fill_template(template, &piped),
            FormatSpec::JsonMap(map) => {
                let mut out = serde_json::Map::new();
                for (out_key, value) in map {
                    let filled = match value {
                        Value::String(token) => match token_key(token) {
                            Some(key) => match piped.get(key) {
                                Some(meta_value) => serde_json::to_value(meta_value)
                                    .unwrap_or(Value::Null),
                                None => value.clone(),
                            },
                            None => value.clone(),
                        },
                        other => other.clone(),
                    };
                    out.insert(out_key.clone(), filled);
                }
                serde_json::to_string(&Value::Object(out)).unwrap_or_else(|_| "{}".to_string())
            }
        }
    }
}

/// The metadata key inside a `|key|` token, if the string is one.
fn token_key(token: &str) -> Option<&str> {
    if token.len() > 2 && token.starts_with('|') && token.ends_with('|') {
        Some(&token[1..token.len() - 1])
    } else {
        None
    }
}

/// Substitute `{key}` placeholders; `{{` and `}}` escape literal braces.
fn fill_template(template: &str, metadata: &Metadata) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut key = String::new();
                let mut closed = false;
                for k in chars.by_ref() {
                    if k == '}' {
                        closed = true;
                        break;
                    }
                    key.push(k);
                }
                if closed {
                    match metadata.get(&key) {
                        Some(value) => out.push_str(&value.to_string()),
                        None => out.push_str(MISSING_VALUE),
                    }
                } else {
                    // Unterminated placeholder; emit it verbatim.
                    out.push('{');
                    out.push_str(&key);
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// A connected socket peer, keyed by its chosen name in the server
/// registry.
pub struct ClientConn {
    pub interval: EventClass,
    pub format: FormatSpec,
    pub writer: OwnedWriteHalf,
}

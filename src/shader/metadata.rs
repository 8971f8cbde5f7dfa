//! Inline uniform hints written as trailing comments, and value coercion.
//!
//! Authors annotate declarations with terse hints such as
//! `uniform float amount; // default: 0.5, min: 0, max: 1`. The comment is
//! treated as the inside of an object literal whose bare words are implicitly
//! quoted. Anything that fails to parse simply contributes no hints.

use serde_yaml::{Mapping, Value};

/// Hints parsed from a declaration comment. Each field is independently optional.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UniformHints {
    pub default: Option<Value>,
    pub min: Option<Value>,
    pub max: Option<Value>,
}

impl UniformHints {
    /// Parses the text of a trailing comment. Never fails.
    pub fn parse(comment: &str) -> Self {
        let Some(map) = parse_object_literal(comment) else {
            return Self::default();
        };
        Self {
            default: map.get("default").cloned(),
            min: map.get("min").cloned(),
            max: map.get("max").cloned(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.default.is_none() && self.min.is_none() && self.max.is_none()
    }
}

/// Parses a brace-free `key: value, ...` fragment into a mapping.
///
/// Returns `None` for empty text or anything that is not a mapping once bare
/// words are quoted.
pub fn parse_object_literal(text: &str) -> Option<Mapping> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    let quoted = quote_bare_words(text);
    serde_yaml::from_str::<Mapping>(&format!("{{{quoted}}}")).ok()
}

/// Wraps every bare identifier in double quotes, leaving `true`, `false`,
/// numbers and already-quoted strings alone.
pub fn quote_bare_words(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len() + 8);
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '"' || c == '\'' {
            let start = i;
            i += 1;
            while i < chars.len() && chars[i] != c {
                if c == '"' && chars[i] == '\\' {
                    i += 1;
                }
                i += 1;
            }
            i = (i + 1).min(chars.len());
            out.extend(&chars[start..i]);
        } else if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) {
            let start = i;
            while i < chars.len() {
                let n = chars[i];
                let exponent_sign = (n == '+' || n == '-') && matches!(chars[i - 1], 'e' | 'E');
                if n.is_ascii_alphanumeric() || n == '.' || n == '_' || exponent_sign {
                    i += 1;
                } else {
                    break;
                }
            }
            out.extend(&chars[start..i]);
        } else if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            if word == "true" || word == "false" {
                out.push_str(&word);
            } else {
                out.push('"');
                out.push_str(&word);
                out.push('"');
            }
        } else {
            out.push(c);
            i += 1;
        }
    }
    out
}

/// Numeric coercion: numbers pass through, booleans become 0/1, numeric
/// strings are parsed. Everything else, including absence, is 0.
pub fn coerce_number(value: Option<&Value>) -> f64 {
    let number = match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::Bool(b)) => f64::from(u8::from(*b)),
        Some(Value::String(s)) => s.trim().parse::<f64>().unwrap_or(0.0),
        Some(Value::Tagged(tagged)) => coerce_number(Some(&tagged.value)),
        _ => 0.0,
    };
    if number.is_finite() {
        number
    } else {
        0.0
    }
}

/// Integer coercion: numeric coercion floored to the nearest whole number.
pub fn coerce_int(value: Option<&Value>) -> i32 {
    coerce_number(value).floor() as i32
}

/// Float coercion.
pub fn coerce_float(value: Option<&Value>) -> f32 {
    coerce_number(value) as f32
}

/// Where a `sampler2D` uniform gets its image from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextureSource {
    pub url: String,
}

impl TextureSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

/// Texture coercion: `{url: ...}` records keep their url, bare scalars become
/// the url, anything else yields an empty url.
pub fn coerce_texture(value: Option<&Value>) -> TextureSource {
    match value {
        Some(Value::Mapping(map)) => TextureSource::new(map.get("url").and_then(scalar_string).unwrap_or_default()),
        Some(Value::Tagged(tagged)) => coerce_texture(Some(&tagged.value)),
        Some(other) => TextureSource::new(scalar_string(other).unwrap_or_default()),
        None => TextureSource::default(),
    }
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

//! Text normalization for decoded payload values.
//!
//! The platform percent-encodes user-visible strings the way JavaScript's
//! `encodeURIComponent` does, but not consistently across message kinds.
//! A value is decoded only when re-encoding reproduces the original
//! exactly, so strings that merely look encoded survive untouched.

use std::borrow::Cow;

use serde_json::Value;

/// Decode `text` if it round-trips through component encoding, otherwise
/// return it unchanged.
pub fn unquote(text: &str) -> Cow<'_, str> {
    match urlencoding::decode(text) {
        Ok(decoded) if decoded != text => {
            if encode_component(&decoded) == text {
                Cow::Owned(decoded.into_owned())
            } else {
                Cow::Borrowed(text)
            }
        }
        _ => Cow::Borrowed(text),
    }
}

/// Percent-encode with the unreserved set of `encodeURIComponent`.
fn encode_component(text: &str) -> String {
    // urlencoding escapes !*'() which encodeURIComponent leaves bare.
    urlencoding::encode(text)
        .replace("%21", "!")
        .replace("%2A", "*")
        .replace("%27", "'")
        .replace("%28", "(")
        .replace("%29", ")")
}

/// Normalize one payload value: strings are conditionally unquoted,
/// containers are walked recursively, other scalars pass through.
pub fn normalize_value(value: &Value) -> Value {
    match value {
        Value::String(text) => Value::String(unquote(text).into_owned()),
        Value::Array(items) => Value::Array(items.iter().map(normalize_value).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| (key.clone(), normalize_value(item)))
                .collect(),
        ),
        other => other.clone(),
    }
}

//! Tolerant decoding of JSON that a model embedded in free text.
//!
//! Two independent phases:
//! 1. [`extract_json_span`] locates the candidate object (first `{` to last `}`),
//!    dropping any prose or code fences around it.
//! 2. [`sanitize_control_chars`] rewrites raw control characters so the span
//!    survives `serde_json`. Inside string literals `\n`, `\r` and `\t` become
//!    their two-character escapes; every other control character (0x00-0x1F,
//!    0x7F) is deleted. Between tokens, newline/CR/tab are legal whitespace and
//!    are kept as-is.

use std::borrow::Cow;

use serde::de::DeserializeOwned;

use crate::error::SanitizeError;

fn is_control(ch: char) -> bool {
    ch <= '\u{1F}' || ch == '\u{7F}'
}

/// Return the slice from the first `{` to the last `}` inclusive.
pub fn extract_json_span(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&text[start..=end])
}

/// Escape or strip raw control characters. Clean input is returned borrowed.
pub fn sanitize_control_chars(raw: &str) -> Cow<'_, str> {
    if !raw.chars().any(is_control) {
        return Cow::Borrowed(raw);
    }

    let mut out = String::with_capacity(raw.len() + 16);
    let mut in_string = false;
    let mut escaped = false;

    for ch in raw.chars() {
        if !in_string {
            match ch {
                '"' => {
                    in_string = true;
                    out.push(ch);
                }
                '\n' | '\r' | '\t' => out.push(ch),
                c if is_control(c) => {}
                c => out.push(c),
            }
            continue;
        }

        if escaped {
            // A backslash directly followed by a raw control character.
            escaped = false;
            match ch {
                '\n' => out.push('n'),
                '\r' => out.push('r'),
                '\t' => out.push('t'),
                c if is_control(c) => out.push('\\'),
                c => out.push(c),
            }
            continue;
        }

        match ch {
            '\\' => {
                escaped = true;
                out.push(ch);
            }
            '"' => {
                in_string = false;
                out.push(ch);
            }
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if is_control(c) => {}
            c => out.push(c),
        }
    }

    Cow::Owned(out)
}

/// Locate, sanitize and parse the object embedded in a model response.
pub fn parse_model_json<T: DeserializeOwned>(response: &str) -> Result<T, SanitizeError> {
    let span = extract_json_span(response).ok_or(SanitizeError::NoJsonObject)?;
    let cleaned = sanitize_control_chars(span);
    Ok(serde_json::from_str(&cleaned)?)
}

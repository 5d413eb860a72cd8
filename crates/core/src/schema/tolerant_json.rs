//! Tolerant JSON parsing of a *complete* generated string (spec §4.3 step 4:
//! "handles unescaped tabs, control chars, stripped code fences, trailing
//! garbage"). Distinct from [`crate::streaming::JsonStreamParser`], which
//! parses an incomplete, incrementally-arriving string instead.

use serde_json::Value;

use crate::error::{GatewayError, Result};

/// Best-effort parse of a model's raw text output as JSON, tolerating the
/// malformations vendors commonly produce around a structured-output
/// request.
pub fn parse_tolerant(raw: &str) -> Result<Value> {
    let stripped = strip_code_fence(raw.trim());
    let escaped = escape_bare_control_chars_in_strings(stripped);
    let candidate = first_balanced_json_value(&escaped).unwrap_or(escaped.as_str());

    serde_json::from_str(candidate).map_err(|err| GatewayError::InvalidGeneration(format!("could not parse model output as JSON: {err}")))
}

/// Strip a leading/trailing ```` ```json ```` or ```` ``` ```` fence, a
/// habit several vendors have even when explicitly asked for raw JSON.
fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else { return text };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.strip_prefix('\n').unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Escape raw control characters (literal newlines, tabs, etc.) found
/// inside JSON string literals, leaving insignificant whitespace between
/// tokens untouched.
fn escape_bare_control_chars_in_strings(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_string = false;
    let mut escaped = false;

    for ch in input.chars() {
        if !in_string {
            if ch == '"' {
                in_string = true;
            }
            out.push(ch);
            continue;
        }

        if escaped {
            out.push(ch);
            escaped = false;
            continue;
        }

        match ch {
            '\\' => {
                out.push(ch);
                escaped = true;
            }
            '"' => {
                out.push(ch);
                in_string = false;
            }
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }

    out
}

/// Find the first top-level `{...}` or `[...]` value in `input`, discarding
/// any trailing garbage the model appended after it (e.g. a trailing
/// sign-off sentence).
fn first_balanced_json_value(input: &str) -> Option<&str> {
    let start = input.find(|c: char| !c.is_whitespace())?;
    let opening = input[start..].chars().next()?;
    let closing = match opening {
        '{' => '}',
        '[' => ']',
        _ => return None,
    };

    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in input.char_indices() {
        if i < start {
            continue;
        }

        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            c if c == opening => depth += 1,
            c if c == closing => {
                depth -= 1;
                if depth == 0 {
                    return Some(&input[start..=i]);
                }
            }
            _ => {}
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_well_formed_json_unchanged() {
        assert_eq!(parse_tolerant(r#"{"x": 1}"#).unwrap(), json!({"x": 1}));
    }

    #[test]
    fn strips_markdown_code_fence() {
        assert_eq!(parse_tolerant("```json\n{\"x\": 1}\n```").unwrap(), json!({"x": 1}));
    }

    #[test]
    fn escapes_bare_newline_inside_a_string() {
        let raw = "{\"note\": \"line one\nline two\"}";
        assert_eq!(parse_tolerant(raw).unwrap(), json!({"note": "line one\nline two"}));
    }

    #[test]
    fn discards_trailing_garbage_after_the_json_value() {
        let raw = r#"{"x": 1} Hope that helps!"#;
        assert_eq!(parse_tolerant(raw).unwrap(), json!({"x": 1}));
    }

    #[test]
    fn unparseable_text_raises_invalid_generation() {
        assert!(matches!(parse_tolerant("not json at all"), Err(GatewayError::InvalidGeneration(_))));
    }
}

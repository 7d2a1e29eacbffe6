//! Lenient structured-response parsing.
//!
//! Models often wrap valid JSON in Markdown fences or surround it with prose.
//! [`parse_object`] tries, in order:
//!
//! 1. strict parse of the trimmed text,
//! 2. parse after stripping a leading ```` ``` ````/```` ```json ```` fence and
//!    the closing fence,
//! 3. parse of the largest balanced `{...}` span that is valid JSON,
//!
//! and otherwise rejects. An accepted value must be a JSON object holding
//! every required key.

use serde_json::{Map, Value};

use crate::error::GatewayError;

/// Parse `raw` into a JSON object carrying all of `required`.
pub fn parse_object(raw: &str, required: &[&str]) -> Result<Map<String, Value>, GatewayError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(reject("empty response", raw));
    }

    let candidate = strict(trimmed)
        .or_else(|| strict(strip_fences(trimmed)))
        .or_else(|| largest_embedded_object(trimmed));

    let Some(object) = candidate else {
        return Err(reject("no JSON object found", raw));
    };

    let missing: Vec<&str> = required
        .iter()
        .copied()
        .filter(|k| !object.contains_key(*k))
        .collect();
    if !missing.is_empty() {
        return Err(reject(
            &format!("missing required key(s): {}", missing.join(", ")),
            raw,
        ));
    }
    Ok(object)
}

fn reject(reason: &str, raw: &str) -> GatewayError {
    GatewayError::Parse {
        reason: reason.to_string(),
        raw: raw.to_string(),
    }
}

fn strict(text: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// Remove an opening fence line and a closing fence, if present.
pub fn strip_fences(text: &str) -> &str {
    let mut body = text.trim();
    if body.starts_with("```") {
        body = match body.find('\n') {
            Some(nl) => &body[nl + 1..],
            // Single-line fence such as ```{"a":1}```
            None => body.trim_start_matches('`').trim_start_matches("json"),
        };
    }
    let body = body.trim_end();
    let body = match body.rfind("```") {
        Some(pos) if body[pos..].trim_matches('`').trim().is_empty() => &body[..pos],
        _ => body,
    };
    body.trim()
}

/// Find every balanced `{...}` span, longest first, and return the first that
/// parses as an object. String literals and escapes are respected so braces
/// inside strings do not unbalance the scan.
fn largest_embedded_object(text: &str) -> Option<Map<String, Value>> {
    let mut spans = balanced_spans(text);
    spans.sort_by(|a, b| (b.1 - b.0).cmp(&(a.1 - a.0)));
    spans.into_iter().find_map(|(start, end)| strict(&text[start..end]))
}

fn balanced_spans(text: &str) -> Vec<(usize, usize)> {
    let bytes = text.as_bytes();
    let mut spans = Vec::new();
    for (start, &b) in bytes.iter().enumerate() {
        if b != b'{' {
            continue;
        }
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        for (offset, &c) in bytes[start..].iter().enumerate() {
            if in_string {
                match c {
                    _ if escaped => escaped = false,
                    b'\\' => escaped = true,
                    b'"' => in_string = false,
                    _ => {}
                }
                continue;
            }
            match c {
                b'"' => in_string = true,
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        spans.push((start, start + offset + 1));
                        break;
                    }
                }
                _ => {}
            }
        }
    }
    spans
}

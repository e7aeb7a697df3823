//! Partial payload recovery.
//!
//! Info characteristics can return JSON cut off at the transport's value
//! limit. Two fields are known to overflow (`entries` in the settings
//! payload, `intentions` in the intentions payload); only those may be
//! dropped. After that the text is rebalanced, then trimmed back to
//! successive closing braces until it parses.

use serde_json::Value;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OversizedField {
    Entries,
    Intentions,
}

impl OversizedField {
    pub fn key(self) -> &'static str {
        match self {
            Self::Entries => "entries",
            Self::Intentions => "intentions",
        }
    }
}

/// How a payload was made parseable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    Strict,
    DroppedField,
    Rebalanced,
    Truncated,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Recovered {
    pub value: Value,
    pub recovery: Recovery,
}

/// Text before the first NUL, trimmed.
pub fn clean_payload(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).trim().to_string()
}

pub fn recover_json(
    text: &str,
    drop: Option<OversizedField>,
    context: &str,
) -> Result<Recovered, serde_json::Error> {
    let trimmed = text.replace('\0', "");
    let trimmed = trimmed.trim();
    let err = match serde_json::from_str(trimmed) {
        Ok(value) => {
            return Ok(Recovered {
                value,
                recovery: Recovery::Strict,
            })
        }
        Err(e) => e,
    };
    warn!("{} JSON parse failed: {}", context, err);
    let mut last_err = err;
    let mut working = trimmed.to_string();

    if let Some(field) = drop {
        if let Some((stripped, truncated)) = strip_property(&working, field.key()) {
            debug!(truncated, "{}: dropping {} payload", context, field.key());
            working = stripped;
            match serde_json::from_str(&working) {
                Ok(value) => {
                    return Ok(Recovered {
                        value,
                        recovery: Recovery::DroppedField,
                    })
                }
                Err(e) => last_err = e,
            }
        }
    }

    let repaired = rebalance(&working);
    if repaired != working {
        match serde_json::from_str(&repaired) {
            Ok(value) => {
                warn!("{} JSON recovered by rebalancing", context);
                return Ok(Recovered {
                    value,
                    recovery: Recovery::Rebalanced,
                });
            }
            Err(e) => last_err = e,
        }
    }
    let working = repaired;

    let mut search_end = working.len();
    while let Some(brace) = working[..search_end].rfind('}') {
        match serde_json::from_str(&working[..=brace]) {
            Ok(value) => {
                warn!("{} JSON recovered by truncating the tail", context);
                return Ok(Recovered {
                    value,
                    recovery: Recovery::Truncated,
                });
            }
            Err(e) => last_err = e,
        }
        search_end = brace;
    }
    Err(last_err)
}

/// End of the JSON value starting at `start`, and whether it is complete.
fn scan_value(text: &[u8], start: usize) -> (usize, bool) {
    let len = text.len();
    let Some(&first) = text.get(start) else {
        return (len, false);
    };
    let mut i = start + 1;
    match first {
        b'"' => {
            let mut escape = false;
            while i < len {
                match text[i] {
                    _ if escape => escape = false,
                    b'\\' => escape = true,
                    b'"' => return (i + 1, true),
                    _ => {}
                }
                i += 1;
            }
            (i, false)
        }
        b'{' | b'[' => {
            let mut stack = vec![first];
            let mut in_string = false;
            let mut escape = false;
            while i < len && !stack.is_empty() {
                let ch = text[i];
                i += 1;
                if in_string {
                    match ch {
                        _ if escape => escape = false,
                        b'\\' => escape = true,
                        b'"' => in_string = false,
                        _ => {}
                    }
                    continue;
                }
                match ch {
                    b'"' => in_string = true,
                    b'{' | b'[' => stack.push(ch),
                    b'}' | b']' => {
                        let matches = matches!(
                            (stack.last().copied(), ch),
                            (Some(b'{'), b'}') | (Some(b'['), b']')
                        );
                        if !matches {
                            return (i, true);
                        }
                        stack.pop();
                    }
                    _ => {}
                }
            }
            (i, stack.is_empty())
        }
        _ => {
            i = start;
            while i < len && !matches!(text[i], b',' | b'}' | b']') && !text[i].is_ascii_whitespace()
            {
                i += 1;
            }
            (i, true)
        }
    }
}

/// Removes `"name": value` with its separating comma. The flag is true when
/// the value ran to the end of the text and everything after the key was cut.
fn strip_property(text: &str, name: &str) -> Option<(String, bool)> {
    let bytes = text.as_bytes();
    let needle = format!("\"{name}\"");
    let idx = text.find(&needle)?;

    let mut start = idx;
    while start > 0 && bytes[start - 1].is_ascii_whitespace() {
        start -= 1;
    }
    let preceding_comma = (start > 0 && bytes[start - 1] == b',').then(|| start - 1);
    let cut_start = preceding_comma.unwrap_or(start);

    let Some(colon) = text[idx + needle.len()..].find(':').map(|c| c + idx + needle.len()) else {
        return Some((text[..cut_start].to_string(), true));
    };
    let mut value_start = colon + 1;
    while value_start < bytes.len() && bytes[value_start].is_ascii_whitespace() {
        value_start += 1;
    }

    let (value_end, complete) = scan_value(bytes, value_start);
    if !complete {
        return Some((text[..cut_start].to_string(), true));
    }

    let mut end = value_end;
    while end < bytes.len() && bytes[end].is_ascii_whitespace() {
        end += 1;
    }
    let mut slice_start = start;
    if end < bytes.len() && bytes[end] == b',' {
        end += 1;
        while end < bytes.len() && bytes[end].is_ascii_whitespace() {
            end += 1;
        }
    } else if let Some(comma) = preceding_comma {
        slice_start = comma;
        while slice_start > 0 && bytes[slice_start - 1].is_ascii_whitespace() {
            slice_start -= 1;
        }
    }
    Some((format!("{}{}", &text[..slice_start], &text[end..]), false))
}

/// Closes an open string and every unclosed bracket.
fn rebalance(text: &str) -> String {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escape = false;
    for ch in text.bytes() {
        if in_string {
            match ch {
                _ if escape => escape = false,
                b'\\' => escape = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            b'"' => in_string = true,
            b'{' | b'[' => stack.push(ch),
            b'}' if stack.last() == Some(&b'{') => {
                stack.pop();
            }
            b']' if stack.last() == Some(&b'[') => {
                stack.pop();
            }
            _ => {}
        }
    }

    let mut out = text.to_string();
    if in_string {
        out.push('"');
    }
    while let Some(opener) = stack.pop() {
        out.push(if opener == b'{' { '}' } else { ']' });
    }
    out
}

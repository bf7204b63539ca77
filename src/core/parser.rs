//! Structured-output parsing for generative backends.
//!
//! Backends are asked for JSON but routinely wrap it in prose or markdown
//! fences, use the wrong quote characters, drop quotes around values, or
//! leave trailing commas. Parsing proceeds in stages: extract the payload
//! and parse it strictly, then leniently (json5), then after a bounded set
//! of textual repairs, and finally fall back to rescuing individually
//! well-formed record fragments. This module never errors; the worst case
//! is an empty record set, which callers treat as a retryable condition.

use regex::Regex;
use serde_json::Value;
use tracing::debug;

/// Envelope keys under which backends sometimes nest the record array.
const ENVELOPE_KEYS: &[&str] = &["shots", "episodes", "scripts", "records", "items", "chapters"];

/// Remove markdown code fences (```json ... ```) around the payload.
pub fn strip_code_fences(text: &str) -> String {
    let re = Regex::new(r"(?i)```(?:json)?").unwrap();
    re.replace_all(text, "").into_owned()
}

/// Candidate payload slices: the outermost `[..]` and the outermost
/// `{..}`, earliest opener first. Both are offered because the first
/// bracket can belong to surrounding prose ("Here is [roughly] the
/// result: {...}"); the caller tries each in turn.
pub fn extract_payloads(text: &str) -> Vec<&str> {
    let mut candidates: Vec<(usize, &str)> = Vec::new();
    for (open, close) in [('[', ']'), ('{', '}')] {
        if let Some(slice) = slice_between(text, open, close) {
            candidates.push((text.find(open).unwrap_or(0), slice));
        }
    }
    candidates.sort_by_key(|(start, _)| *start);
    candidates.into_iter().map(|(_, slice)| slice).collect()
}

fn slice_between(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    (end > start).then(|| &text[start..=end])
}

/// Replace typographic quote characters with their ASCII equivalents.
pub fn normalize_quotes(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '\u{201c}' | '\u{201d}' | '\u{201e}' => '"',
            '\u{2018}' | '\u{2019}' => '\'',
            other => other,
        })
        .collect()
}

/// Drop control characters that break JSON string parsing, keeping
/// newline, carriage return, and tab.
pub fn strip_control_chars(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\r' | '\t'))
        .collect()
}

/// Quote bare scalar values: `"key": value,` becomes `"key": "value",`.
/// Numbers, booleans, and null are left alone.
pub fn quote_bare_values(text: &str) -> String {
    let re = Regex::new(r#""(\w+)"\s*:\s*([^"\s\[\{][^,\}\]]*)"#).unwrap();
    let literal = Regex::new(r"^(?i)(true|false|null|-?\d+(\.\d+)?)$").unwrap();
    re.replace_all(text, |caps: &regex::Captures| {
        let value = caps[2].trim();
        if literal.is_match(value) {
            caps[0].to_string()
        } else {
            format!("\"{}\": \"{}\"", &caps[1], value)
        }
    })
    .into_owned()
}

/// Remove trailing commas before a closing bracket or brace.
pub fn strip_trailing_commas(text: &str) -> String {
    let re = Regex::new(r",\s*([\]\}])").unwrap();
    re.replace_all(text, "$1").into_owned()
}

/// Strict parse first, then json5 (tolerates unquoted keys, single quotes,
/// trailing commas).
fn lenient_parse(text: &str) -> Option<Value> {
    serde_json::from_str(text)
        .ok()
        .or_else(|| json5::from_str(text).ok())
}

/// Parse an arbitrary backend response into a single JSON value, applying
/// the repair passes when no candidate payload parses as-is.
pub fn parse_value(text: &str) -> Option<Value> {
    let cleaned = strip_code_fences(text);
    let mut candidates = extract_payloads(&cleaned);
    if candidates.is_empty() {
        candidates.push(cleaned.trim());
    }
    for payload in &candidates {
        if let Some(v) = lenient_parse(payload) {
            return Some(v);
        }
    }
    for payload in &candidates {
        let repaired = strip_trailing_commas(&quote_bare_values(&strip_control_chars(
            &normalize_quotes(payload),
        )));
        if let Some(v) = lenient_parse(&repaired) {
            return Some(v);
        }
    }
    None
}

/// Parse a backend response into a list of records, each required to carry
/// at least one non-empty field from `required`. Falls back to rescue
/// extraction when the payload cannot be parsed at all.
pub fn parse_records(text: &str, required: &[&str]) -> Vec<Value> {
    match parse_value(text) {
        Some(value) => {
            let records = unwrap_records(value);
            let total = records.len();
            let valid: Vec<Value> = records
                .into_iter()
                .filter(|r| has_required(r, required))
                .collect();
            if valid.len() < total {
                debug!("filtered {} records missing required fields", total - valid.len());
            }
            valid
        }
        None => rescue_records(text, required),
    }
}

/// Unwrap the record array from an envelope object, or treat a lone object
/// as a single record.
fn unwrap_records(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        Value::Object(map) => {
            for key in ENVELOPE_KEYS {
                if let Some(Value::Array(items)) = map.get(*key) {
                    return items.clone();
                }
            }
            vec![Value::Object(map)]
        }
        _ => Vec::new(),
    }
}

fn has_required(record: &Value, required: &[&str]) -> bool {
    let Some(map) = record.as_object() else {
        return false;
    };
    if required.is_empty() {
        return true;
    }
    required.iter().any(|key| match map.get(*key) {
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(Value::Null) | None => false,
        Some(_) => true,
    })
}

/// Last-resort extraction: scan for flat `{...}` fragments mentioning a
/// required field and keep the ones that parse cleanly on their own.
/// Fragments that still fail to parse are dropped, never fabricated.
pub fn rescue_records(text: &str, required: &[&str]) -> Vec<Value> {
    let re = Regex::new(r"\{[^{}]*\}").unwrap();
    let mut out = Vec::new();
    for m in re.find_iter(text) {
        let fragment = m.as_str();
        if !required.is_empty() && !required.iter().any(|k| fragment.contains(k)) {
            continue;
        }
        if let Some(v) = lenient_parse(fragment) {
            if has_required(&v, required) {
                out.push(v);
            }
        }
    }
    if !out.is_empty() {
        debug!("rescue extraction salvaged {} records", out.len());
    }
    out
}

/// Script-specific rescue: pull `episode`/`title`/`summary` triples out of
/// unparsable text, keeping only episodes within the requested range.
pub fn rescue_scripts(text: &str, start_ep: u32, end_ep: u32) -> Vec<Value> {
    let re = Regex::new(
        r#""?episode"?\s*:\s*(\d+)[^\}]*?"?title"?\s*:\s*"([^"]+)"[^\}]*?"?summary"?\s*:\s*"([^"]+)""#,
    )
    .unwrap();
    let mut out = Vec::new();
    for caps in re.captures_iter(text) {
        let Ok(ep) = caps[1].parse::<u32>() else {
            continue;
        };
        if ep < start_ep || ep > end_ep {
            continue;
        }
        out.push(serde_json::json!({
            "episode": ep,
            "title": caps[2].to_string(),
            "summary": caps[3].to_string(),
            "scenes": [],
        }));
    }
    out
}

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::FingerprintValue;

static ANSI_ESCAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\[[0-9;]*m").expect("ANSI escape pattern compiles"));
static SUMMARY_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(https?://\S+) \[([^\]]+)\](?: (.*))?$").expect("summary line pattern compiles")
});

pub fn strip_ansi(raw: &str) -> String {
    ANSI_ESCAPE.replace_all(raw, "").into_owned()
}

/// Parse WhatWeb's default console output.
///
/// Only the first non-empty line is looked at. A line that does not have the
/// `<url> [<status>] <plugins>` shape is kept verbatim under `raw`.
pub fn parse_whatweb_output(raw: &str) -> BTreeMap<String, FingerprintValue> {
    let clean = strip_ansi(raw);
    let mut result = BTreeMap::new();

    let Some(line) = clean.lines().map(str::trim).find(|l| !l.is_empty()) else {
        result.insert(
            "summary".to_string(),
            FingerprintValue::Text("No output".to_string()),
        );
        return result;
    };

    let Some(caps) = SUMMARY_LINE.captures(line) else {
        result.insert("raw".to_string(), FingerprintValue::Text(line.to_string()));
        return result;
    };

    result.insert("url".to_string(), FingerprintValue::Text(caps[1].to_string()));
    result.insert("status".to_string(), FingerprintValue::Text(caps[2].to_string()));

    let rest = caps.get(3).map_or("", |m| m.as_str());
    for segment in split_top_level(rest) {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        let (key, value) = match segment.split_once('[') {
            Some((name, value)) if value.contains(']') => (
                name.trim().to_lowercase(),
                FingerprintValue::Text(value.trim_end_matches(']').trim().to_string()),
            ),
            _ => (segment.to_lowercase(), FingerprintValue::Flag(true)),
        };
        if key.is_empty() || key == "url" || key == "status" {
            continue;
        }
        result.insert(key, value);
    }

    result
}

// Commas inside `[...]` belong to the value.
fn split_top_level(rest: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in rest.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&rest[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&rest[start..]);
    parts
}

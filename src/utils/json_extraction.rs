//! JSON extraction utilities for parsing judge and agent output.
//!
//! Judge processes emit free-form text: the JSON verdict may be bare, fenced
//! in a markdown code block, wrapped in XML-like tags, or surrounded by
//! prose. Extraction tries, in order:
//!
//! 1. Fenced code blocks (```` ```json ```` first, then any fence) whose body
//!    contains a balanced JSON object.
//! 2. Brace-depth scanning for the first balanced `{...}` that parses as a
//!    JSON object. XML-like wrappers and leading prose are skipped this way.
//!
//! # Example
//!
//! ```
//! use tierbench::utils::json_extraction::extract_json_object;
//!
//! let raw = "<verdict>{\"score\": 0.8, \"passed\": true}</verdict>";
//! let value = extract_json_object(raw).unwrap();
//! assert_eq!(value["passed"], true);
//! ```

use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;

/// Error type for JSON extraction failures
#[derive(Debug, Clone, Error, PartialEq)]
pub enum JsonExtractionError {
    #[error("JSON appears truncated: {unclosed_braces} unclosed braces. Partial: {partial_preview}...")]
    Truncated {
        partial_preview: String,
        unclosed_braces: usize,
    },
    #[error("No JSON object found in output. Content starts with: '{content_preview}'")]
    NotFound { content_preview: String },
}

/// Fence patterns tried in order: `json`-tagged fences, then any fence.
const FENCE_PATTERNS: [&str; 2] = [
    r"```json\s*\n?([\s\S]*?)\n?```",
    r"```(?:\w+)?\s*\n?([\s\S]*?)\n?```",
];

/// Finds the matching closing brace for the object starting at `s[0]`.
///
/// Handles nested braces, string literals and escape sequences.
pub fn find_matching_brace(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, c) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }

        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }

    None
}

/// Counts braces left open at the end of `s`, ignoring string contents.
pub fn unclosed_braces(s: &str) -> usize {
    let mut depth: isize = 0;
    let mut in_string = false;
    let mut escape_next = false;

    for c in s.chars() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => depth -= 1,
            _ => {}
        }
    }

    depth.max(0) as usize
}

/// Scans for the first balanced `{...}` that parses as a JSON object.
pub fn first_balanced_object(content: &str) -> Option<Map<String, Value>> {
    for (start, c) in content.char_indices() {
        if c != '{' {
            continue;
        }
        let candidate = &content[start..];
        if let Some(end) = find_matching_brace(candidate) {
            if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&candidate[..=end]) {
                return Some(map);
            }
        }
    }
    None
}

/// Extracts the first JSON object found inside a fenced code block.
pub fn object_from_code_fence(content: &str) -> Option<Map<String, Value>> {
    for pattern in FENCE_PATTERNS {
        let re = Regex::new(pattern).ok()?;
        for caps in re.captures_iter(content) {
            if let Some(body) = caps.get(1) {
                if let Some(map) = first_balanced_object(body.as_str()) {
                    return Some(map);
                }
            }
        }
    }
    None
}

/// Extracts a JSON object from free-form process output.
pub fn try_extract_json_object(content: &str) -> Result<Map<String, Value>, JsonExtractionError> {
    let trimmed = content.trim();

    if let Some(map) = object_from_code_fence(trimmed) {
        return Ok(map);
    }

    if let Some(map) = first_balanced_object(trimmed) {
        return Ok(map);
    }

    if let Some(start) = trimmed.find('{') {
        let open = unclosed_braces(&trimmed[start..]);
        if open > 0 {
            let partial = &trimmed[start..];
            return Err(JsonExtractionError::Truncated {
                partial_preview: preview(partial, 100),
                unclosed_braces: open,
            });
        }
    }

    Err(JsonExtractionError::NotFound {
        content_preview: preview(trimmed, 50),
    })
}

/// Convenience wrapper returning the object as a [`Value`].
pub fn extract_json_object(content: &str) -> Option<Value> {
    try_extract_json_object(content).ok().map(Value::Object)
}

/// Finds the last JSON object line in a JSON-lines stream.
///
/// Agents that stream events print one object per line; the final result
/// object is the last line that parses.
pub fn last_json_line(content: &str) -> Option<Map<String, Value>> {
    content.lines().rev().find_map(|line| {
        let line = line.trim();
        if !line.starts_with('{') {
            return None;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(map)) => Some(map),
            _ => None,
        }
    })
}

fn preview(s: &str, max: usize) -> String {
    let mut end = s.len().min(max);
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const VERDICT: &str = r#"{"score":0.8,"passed":true}"#;

    fn expected() -> Map<String, Value> {
        match serde_json::from_str::<Value>(VERDICT).unwrap() {
            Value::Object(m) => m,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_raw_object() {
        assert_eq!(try_extract_json_object(VERDICT).unwrap(), expected());
    }

    #[test]
    fn test_json_fence() {
        let input = format!("Here is my verdict:\n```json\n{VERDICT}\n```\nThanks.");
        assert_eq!(try_extract_json_object(&input).unwrap(), expected());
    }

    #[test]
    fn test_xml_tags_with_leading_prose() {
        let input = format!("After reviewing the diff I conclude:\n<result>\n{VERDICT}\n</result>");
        assert_eq!(try_extract_json_object(&input).unwrap(), expected());
    }

    #[test]
    fn test_generic_fence() {
        let input = format!("```\n{VERDICT}\n```");
        assert_eq!(try_extract_json_object(&input).unwrap(), expected());
    }

    #[test]
    fn test_fence_preferred_over_earlier_prose_object() {
        let input = r#"An example shape is {"score": 0.1}.
```json
{"score": 0.9, "passed": true}
```"#;
        let map = try_extract_json_object(input).unwrap();
        assert_eq!(map["score"], 0.9);
    }

    #[test]
    fn test_first_balanced_object_skips_invalid_candidates() {
        let input = r#"{not json} then {"score": 0.5}"#;
        let map = try_extract_json_object(input).unwrap();
        assert_eq!(map["score"], 0.5);
    }

    #[test]
    fn test_braces_inside_strings() {
        let input = r#"{"reasoning": "uses { and } freely", "score": 1.0}"#;
        let map = try_extract_json_object(input).unwrap();
        assert_eq!(map["score"], 1.0);
    }

    #[test]
    fn test_find_matching_brace_nested() {
        assert_eq!(find_matching_brace(r#"{"a": {"b": "c"}}"#), Some(16));
        assert_eq!(find_matching_brace("{"), None);
    }

    #[test]
    fn test_truncated_output() {
        let err = try_extract_json_object(r#"verdict: {"score": 0.7, "reasoning": "cut"#).unwrap_err();
        assert!(matches!(err, JsonExtractionError::Truncated { unclosed_braces: 1, .. }));
    }

    #[test]
    fn test_no_json() {
        let err = try_extract_json_object("I could not evaluate this run.").unwrap_err();
        match err {
            JsonExtractionError::NotFound { content_preview } => {
                assert!(content_preview.starts_with("I could not"))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_last_json_line() {
        let stream = "{\"type\":\"start\"}\nnoise\n{\"type\":\"result\",\"total_cost_usd\":0.12}\n";
        let map = last_json_line(stream).unwrap();
        assert_eq!(map["type"], "result");
    }
}

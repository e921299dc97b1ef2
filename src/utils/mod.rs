//! Shared utility functions for tierbench.
//!
//! JSON extraction from free-form process output and small text helpers used
//! by the agent runner, the pipeline runner and the judge engine.

pub mod json_extraction;

pub use json_extraction::{
    extract_json_object, find_matching_brace, first_balanced_object, last_json_line,
    try_extract_json_object, JsonExtractionError,
};

/// Truncates a string at a char boundary, marking the cut.
pub fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) && end > 0 {
            end -= 1;
        }
        format!("{}... [truncated]", &s[..end])
    }
}

/// Keeps the tail of a string, which is where build and test failures print.
pub fn tail(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) && start < s.len() {
        start += 1;
    }
    format!("[truncated] ...{}", &s[start..])
}

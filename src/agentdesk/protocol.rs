//! Wire-level expectations for structured LLM output.
//!
//! Models are asked for markers and JSON payloads but routinely wrap them in
//! prose, markdown fences, or sloppy JSON. Everything in this module is
//! lenient on input and deterministic on failure: extraction returns `Option`
//! or falls back, never an error the user would see.

use serde_json::Value;

use crate::agentdesk::config::DiscussionDepth;

/// Literal prefix the manager uses to request clarification before planning.
pub const CLARIFICATION_MARKER: &str = "[CLARIFICATION_NEEDED]";

/// Prefix the head uses to signal the clarification dialogue is done.
pub const CLEAR_MARKER: &str = "CLEAR:";

/// Line marker carrying the head's detected discussion depth.
pub const DEPTH_MARKER: &str = "DISCUSSION_DEPTH:";

/// If `response` opens with the clarification marker, return the question.
pub fn clarification_question(response: &str) -> Option<&str> {
    let trimmed = response.trim_start();
    trimmed
        .strip_prefix(CLARIFICATION_MARKER)
        .map(|rest| rest.trim())
}

/// If `response` opens with `CLEAR:` (case-insensitive), return the remainder.
pub fn clear_payload(response: &str) -> Option<&str> {
    let trimmed = response.trim_start();
    if trimmed.len() >= CLEAR_MARKER.len()
        && trimmed[..CLEAR_MARKER.len()].eq_ignore_ascii_case(CLEAR_MARKER)
    {
        Some(trimmed[CLEAR_MARKER.len()..].trim())
    } else {
        None
    }
}

/// Scan a reply for a `DISCUSSION_DEPTH: ...` marker, anywhere, any case.
pub fn discussion_depth(response: &str) -> Option<DiscussionDepth> {
    for line in response.lines() {
        let line = line.trim();
        if line.len() >= DEPTH_MARKER.len()
            && line[..DEPTH_MARKER.len()].eq_ignore_ascii_case(DEPTH_MARKER)
        {
            if let Some(depth) = DiscussionDepth::parse(&line[DEPTH_MARKER.len()..]) {
                return Some(depth);
            }
        }
    }
    None
}

/// Strip a surrounding markdown code fence, tolerating a language tag.
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        // Drop the info string ("json", "jsonc", ...) on the opening line.
        let body = match rest.find('\n') {
            Some(idx) => &rest[idx + 1..],
            None => rest,
        };
        if let Some(body) = body.strip_suffix("```") {
            return body.trim();
        }
    }
    trimmed
}

/// Extract the first balanced `{...}` substring from free-form text.
///
/// Brace counting ignores braces inside JSON string literals so that content
/// like `{"reason": "use {braces} sparingly"}` extracts cleanly.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Extract the outermost `[...]` substring, unwrapping code fences first.
pub fn extract_json_array(text: &str) -> Option<&str> {
    let body = strip_code_fences(text);
    let start = body.find('[')?;
    let end = body.rfind(']')?;
    if end > start {
        Some(&body[start..=end])
    } else {
        None
    }
}

/// One task the manager scheduled for an assistant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    pub title: String,
    pub prompt: String,
    /// Lower values run first.
    pub priority: i64,
}

/// Parse a manager task list from free-form LLM output.
///
/// Accepts a JSON array of `{title, prompt, priority}` objects, possibly
/// fenced; keys match case-insensitively, trailing commas are dropped, and
/// `//` line comments are skipped. Entries missing `title` or `prompt` are
/// discarded. Returns `None` when nothing usable could be decoded, at which
/// point the caller substitutes its deterministic fallback.
pub fn parse_task_specs(text: &str) -> Option<Vec<TaskSpec>> {
    let raw = extract_json_array(text)?;
    let cleaned = sanitize_lenient_json(raw);
    let value: Value = serde_json::from_str(&cleaned).ok()?;
    let items = value.as_array()?;

    let mut specs = Vec::new();
    for item in items {
        let obj = match item.as_object() {
            Some(obj) => obj,
            None => continue,
        };
        let title = get_ci(obj, "title").and_then(Value::as_str);
        let prompt = get_ci(obj, "prompt").and_then(Value::as_str);
        let (title, prompt) = match (title, prompt) {
            (Some(t), Some(p)) if !t.trim().is_empty() && !p.trim().is_empty() => (t, p),
            _ => continue,
        };
        let priority = get_ci(obj, "priority").and_then(Value::as_i64).unwrap_or(0);
        specs.push(TaskSpec {
            title: title.trim().to_string(),
            prompt: prompt.trim().to_string(),
            priority,
        });
    }

    specs.sort_by_key(|s| s.priority);
    Some(specs)
}

/// Case-insensitive field lookup on a JSON object.
pub fn get_ci<'a>(obj: &'a serde_json::Map<String, Value>, key: &str) -> Option<&'a Value> {
    obj.iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v)
}

/// Remove `//` comments and trailing commas so strict serde can parse the rest.
fn sanitize_lenient_json(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '/' if chars.peek() == Some(&'/') => {
                // Skip to end of line.
                for next in chars.by_ref() {
                    if next == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            ',' => {
                // Drop the comma when the next non-whitespace closes a scope.
                let mut lookahead = chars.clone();
                let mut closes = false;
                while let Some(&next) = lookahead.peek() {
                    if next.is_whitespace() {
                        lookahead.next();
                    } else {
                        closes = next == ']' || next == '}';
                        break;
                    }
                }
                if !closes {
                    out.push(c);
                }
            }
            _ => out.push(c),
        }
    }
    out
}

/// Truncate to `max_chars` characters, appending an ellipsis when shortened.
pub fn truncate_with_ellipsis(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clarification_marker_requires_prefix() {
        assert_eq!(
            clarification_question("[CLARIFICATION_NEEDED] which language?"),
            Some("which language?")
        );
        assert_eq!(clarification_question("plan: [CLARIFICATION_NEEDED] x"), None);
    }

    #[test]
    fn clear_marker_is_case_insensitive() {
        assert_eq!(clear_payload("clear: topic is ready"), Some("topic is ready"));
        assert_eq!(clear_payload("CLEAR:done"), Some("done"));
        assert_eq!(clear_payload("unclear: nope"), None);
    }

    #[test]
    fn depth_marker_found_anywhere() {
        let reply = "Thanks!\ndiscussion_depth: Deep\nLet us begin.";
        assert_eq!(discussion_depth(reply), Some(DiscussionDepth::Deep));
        assert_eq!(discussion_depth("no marker here"), None);
    }

    #[test]
    fn object_extraction_balances_braces() {
        let text = "noise {\"a\": {\"b\": 1}, \"s\": \"{not json}\"} trailing";
        assert_eq!(
            extract_json_object(text),
            Some("{\"a\": {\"b\": 1}, \"s\": \"{not json}\"}")
        );
        assert_eq!(extract_json_object("no object"), None);
    }

    #[test]
    fn task_specs_parse_fenced_and_sloppy_json() {
        let text = r#"Here you go:
```json
[
  // first one
  {"Title": "A", "PROMPT": "a", "priority": 1,},
  {"title": "B", "prompt": "b", "priority": 0},
  {"title": "broken"},
]
```"#;
        let specs = parse_task_specs(text).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].title, "B");
        assert_eq!(specs[0].priority, 0);
        assert_eq!(specs[1].title, "A");
    }

    #[test]
    fn task_specs_reject_garbage() {
        assert_eq!(parse_task_specs("not json at all"), None);
        assert_eq!(parse_task_specs("{}"), None);
    }

    #[test]
    fn truncation_is_char_safe() {
        assert_eq!(truncate_with_ellipsis("short", 10), "short");
        let long = "x".repeat(600);
        let cut = truncate_with_ellipsis(&long, 500);
        assert_eq!(cut.chars().count(), 500);
        assert!(cut.ends_with('…'));
    }
}

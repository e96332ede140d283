//! Repair: local, deterministic cleanup of malformed generator JSON.
//!
//! Even well-prompted models occasionally return JSON that is *almost*
//! valid:
//!
//! - wrapped in ` ```json ... ``` ` fences despite the prompt
//! - preceded or followed by a sentence of commentary
//! - trailing commas before `}` or `]`
//! - bare (unquoted) object keys
//! - cut off mid-object when the token budget runs out
//!
//! [`repair_json`] fixes these without any network call. It does not retry
//! the generator and it never invents content: a response that ends inside a
//! string literal is unrecoverable, because closing the string would fabricate
//! a value.
//!
//! ## Rule Order
//!
//! Fences are stripped before the object is located, so a fenced response
//! with prose around it still resolves to its first `{`. The structural pass
//! then runs once over the characters, tracking string and nesting state, so
//! that commas and key-like words inside string literals are never touched.

use once_cell::sync::Lazy;
use regex::Regex;

/// Attempt to turn a malformed response into parseable JSON.
///
/// Returns `None` when the response cannot be repaired without guessing.
/// The result is not guaranteed to parse; callers re-run the parser on it.
pub fn repair_json(raw: &str) -> Option<String> {
    let s = strip_code_fences(raw);
    let s = normalise_quotes(&s);
    let start = s.find('{')?;
    repair_structure(&s[start..])
}

// ── Rule 1: Strip Markdown fences ────────────────────────────────────────────

static RE_FENCED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(?:json|JSON)?[ \t]*\r?\n?(.*?)(?:```|$)").unwrap());

fn strip_code_fences(input: &str) -> String {
    match RE_FENCED.captures(input) {
        Some(caps) if caps[1].contains('{') => caps[1].to_string(),
        _ => input.to_string(),
    }
}

// ── Rule 2: Normalise typographic quotes ─────────────────────────────────────

fn normalise_quotes(input: &str) -> String {
    input.replace(['\u{201C}', '\u{201D}'], "\"")
}

// ── Rule 3: Structural pass ──────────────────────────────────────────────────
//
// Single scan with a bracket stack:
// - a closer drops any trailing comma before it
// - a closer that does not match the innermost opener is replaced by the
//   right one
// - a bare identifier in key position followed by `:` is quoted
// - raw newlines inside strings are escaped
// - scanning stops when the outermost object closes (trailing prose dropped)
// - at end of input: fail if inside a string, else fill a dangling `key:`
//   with null, drop a trailing comma, and close every open bracket

fn repair_structure(input: &str) -> Option<String> {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len() + 16);
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if in_string {
            match c {
                _ if escaped => {
                    escaped = false;
                    out.push(c);
                }
                '\\' => {
                    escaped = true;
                    out.push(c);
                }
                '"' => {
                    in_string = false;
                    out.push(c);
                }
                '\n' => out.push_str("\\n"),
                '\r' => {}
                '\t' => out.push_str("\\t"),
                _ => out.push(c),
            }
            i += 1;
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '{' => {
                stack.push('}');
                out.push(c);
            }
            '[' => {
                stack.push(']');
                out.push(c);
            }
            '}' | ']' => {
                drop_trailing_comma(&mut out);
                let closer = stack.pop()?;
                out.push(closer);
                if stack.is_empty() {
                    return Some(out);
                }
            }
            _ if is_ident_start(c) && in_key_position(&stack, &out) => {
                let begin = i;
                while i < chars.len() && is_ident_char(chars[i]) {
                    i += 1;
                }
                let ident: String = chars[begin..i].iter().collect();
                let mut j = i;
                while j < chars.len() && chars[j].is_whitespace() {
                    j += 1;
                }
                if j < chars.len() && chars[j] == ':' {
                    out.push('"');
                    out.push_str(&ident);
                    out.push('"');
                } else {
                    out.push_str(&ident);
                }
                continue;
            }
            _ => out.push(c),
        }
        i += 1;
    }

    if in_string {
        return None;
    }

    let trimmed_len = out.trim_end().len();
    out.truncate(trimmed_len);
    if out.ends_with(':') {
        out.push_str(" null");
    }
    drop_trailing_comma(&mut out);
    while let Some(closer) = stack.pop() {
        out.push(closer);
    }
    Some(out)
}

fn drop_trailing_comma(out: &mut String) {
    let trimmed_len = out.trim_end().len();
    if out[..trimmed_len].ends_with(',') {
        out.truncate(trimmed_len - 1);
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Inside an object, directly after `{` or `,`.
fn in_key_position(stack: &[char], out: &str) -> bool {
    stack.last() == Some(&'}') && matches!(out.trim_end().chars().last(), Some('{') | Some(','))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn repaired_value(raw: &str) -> Value {
        let fixed = repair_json(raw).expect("repairable");
        serde_json::from_str(&fixed).unwrap_or_else(|e| panic!("{e}: {fixed}"))
    }

    #[test]
    fn trailing_commas() {
        let v = repaired_value(r#"{"name": "Jane Doe", "degrees": [{"degree_type": "PhD",}]}"#);
        assert_eq!(v["degrees"][0]["degree_type"], "PhD");

        let v = repaired_value("{\"honors\": [1, 2, ],\n}");
        assert_eq!(v["honors"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn unquoted_keys() {
        let v = repaired_value(r#"{name: "Jane", degrees: [{degree_type: "MA"}]}"#);
        assert_eq!(v["name"], "Jane");
        assert_eq!(v["degrees"][0]["degree_type"], "MA");
    }

    #[test]
    fn literals_in_value_position_are_untouched() {
        let v = repaired_value(r#"{"a": null, "b": true, c: false}"#);
        assert!(v["a"].is_null());
        assert_eq!(v["b"], true);
        assert_eq!(v["c"], false);
    }

    #[test]
    fn truncated_braces_are_closed() {
        let v = repaired_value(r#"{"name": "Jane", "degrees": [{"degree_type": "PhD""#);
        assert_eq!(v["degrees"][0]["degree_type"], "PhD");

        let v = repaired_value(r#"{"name": "Jane", "birthdate":"#);
        assert!(v["birthdate"].is_null());
    }

    #[test]
    fn fences_and_prose_are_dropped() {
        let raw = "Here is the record:\n```json\n{\"name\": \"Jane\"}\n```\nLet me know!";
        assert_eq!(repaired_value(raw)["name"], "Jane");

        let raw = "Sure! {\"name\": \"Jane\"} Hope this helps {x}";
        assert_eq!(repaired_value(raw)["name"], "Jane");
    }

    #[test]
    fn commas_and_braces_inside_strings_are_preserved() {
        let v = repaired_value(r#"{"honor_name": "Prize, {first} class",}"#);
        assert_eq!(v["honor_name"], "Prize, {first} class");
    }

    #[test]
    fn raw_newlines_in_strings_are_escaped() {
        let v = repaired_value("{\"name\": \"Jane\nDoe\"}");
        assert_eq!(v["name"], "Jane\nDoe");
    }

    #[test]
    fn mismatched_closer_is_corrected() {
        let v = repaired_value(r#"{"degrees": [{"degree_type": "PhD"}}"#);
        assert_eq!(v["degrees"][0]["degree_type"], "PhD");
    }

    #[test]
    fn unterminated_string_is_unrecoverable() {
        assert!(repair_json(r#"{"name": "Jane Doe, born in"#).is_none());
    }

    #[test]
    fn no_object_is_unrecoverable() {
        assert!(repair_json("I could not find any biography here.").is_none());
        assert!(repair_json("").is_none());
    }
}

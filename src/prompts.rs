//! Prompts for LLM-based biography extraction.
//!
//! Every prompt lives here so that changing extraction behaviour means editing
//! one place, and so tests can inspect prompts without a live model.
//!
//! Changing [`DEFAULT_SYSTEM_PROMPT`] changes what the parse stage produces:
//! bump [`crate::pipeline::parse::CODE_VERSION`] in the same commit so cached
//! records are regenerated.

/// Default system prompt for turning one biography into a JSON record.
///
/// Used when `PipelineConfig::system_prompt` is `None`.
pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You are a careful research assistant. You receive the text of ONE biographical entry from a reference work about mathematicians. Extract the facts it states into a single JSON object.

Use exactly this shape:

{
  "name": "full name as written in the entry",
  "birthdate": "birth date as written, or null",
  "deathdate": "death date as written, or null",
  "degrees": [
    {"degree_institution_name": "...", "degree_type": "BA | MA | PhD | ...", "degree_year": "...", "degree_advisor": "... or null"}
  ],
  "employment": [
    {"employer": "...", "job_title": "...", "job_year_begin": "...", "job_year_end": "...", "reason_end": "... or null"}
  ],
  "visits": [
    {"visit_location": "...", "visit_reason": "...", "visit_year": "..."}
  ],
  "honors": [
    {"honor_name": "...", "honor_year": "..."}
  ],
  "parents": [
    {"name": "...", "birthdate": "...", "deathdate": "...", "profession": "..."}
  ]
}

Rules:
1. Only record facts stated in the text. Use null for anything not stated. Never guess.
2. Keep dates as they appear ("June 1932", "1901", "c. 1890").
3. Keep list items in the order the text mentions them.
4. Use empty lists when a category has no entries.
5. Output ONLY the JSON object: no Markdown fences, no commentary."#;

/// Upper bound on biography text sent per request, in characters.
///
/// Entries longer than this are truncated; the tail of very long entries is
/// usually bibliography, not biographical fact.
pub const MAX_INPUT_CHARS: usize = 50_000;

/// Build the user message carrying the unit's extracted text.
pub fn biography_message(text: &str) -> String {
    let text = truncate_chars(text.trim(), MAX_INPUT_CHARS);
    format!("Biographical entry:\n\n\"\"\"\n{}\n\"\"\"", text)
}

fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_names_every_column() {
        for field in [
            "degree_institution_name",
            "degree_advisor",
            "job_year_begin",
            "reason_end",
            "visit_location",
            "honor_year",
            "profession",
        ] {
            assert!(DEFAULT_SYSTEM_PROMPT.contains(field), "missing {field}");
        }
    }

    #[test]
    fn message_wraps_text() {
        let msg = biography_message("  Jane Doe was born in 1901.  ");
        assert!(msg.contains("\nJane Doe was born in 1901.\n"));
    }

    #[test]
    fn long_text_is_truncated_on_char_boundary() {
        let text = "é".repeat(MAX_INPUT_CHARS + 10);
        let msg = biography_message(&text);
        assert_eq!(msg.matches('é').count(), MAX_INPUT_CHARS);
    }
}

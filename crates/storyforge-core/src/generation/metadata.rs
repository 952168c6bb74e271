//! Derived candidate metadata: word count and a short summary.

use crate::context::budget::is_cjk;

pub const SUMMARY_MAX_CHARS: usize = 200;

/// Whitespace-separated words, with each CJK character counted as a word.
#[must_use]
pub fn word_count(text: &str) -> usize {
    let mut count = 0;
    for token in text.split_whitespace() {
        let mut in_word = false;
        for c in token.chars() {
            if is_cjk(c) {
                count += 1;
                in_word = false;
            } else if c.is_alphanumeric() && !in_word {
                count += 1;
                in_word = true;
            }
        }
    }
    count
}

/// Leading whole sentences up to [`SUMMARY_MAX_CHARS`]; a first sentence that
/// is already too long is cut and ends with an ellipsis.
#[must_use]
pub fn summarize(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut summary = String::new();
    let mut summary_chars = 0;
    for sentence in sentences(&flat) {
        let len = sentence.chars().count();
        let sep = usize::from(!summary.is_empty());
        if summary_chars + sep + len > SUMMARY_MAX_CHARS {
            break;
        }
        if sep == 1 {
            summary.push(' ');
        }
        summary.push_str(sentence);
        summary_chars += sep + len;
    }
    if summary.is_empty() && !flat.is_empty() {
        summary = flat.chars().take(SUMMARY_MAX_CHARS - 1).collect();
        summary.push('…');
    }
    summary
}

fn sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    for (idx, c) in text.char_indices() {
        if matches!(c, '.' | '!' | '?' | '。' | '！' | '？') {
            let end = idx + c.len_utf8();
            let sentence = text[start..end].trim();
            if !sentence.is_empty() {
                out.push(sentence);
            }
            start = end;
        }
    }
    let rest = text[start..].trim();
    if !rest.is_empty() {
        out.push(rest);
    }
    out
}

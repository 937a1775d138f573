//! Text helpers that are safe on multi-byte input

use std::borrow::Cow;

pub struct TextUtils;

impl TextUtils {
    /// Collapses whitespace runs into single spaces and trims.
    pub fn normalize_whitespace(text: &str) -> Cow<'_, str> {
        let clean = text.trim().len() == text.len()
            && !text.contains("  ")
            && !text.contains(|c: char| c.is_whitespace() && c != ' ');
        if clean {
            Cow::Borrowed(text)
        } else {
            Cow::Owned(text.split_whitespace().collect::<Vec<_>>().join(" "))
        }
    }

    /// First `max_chars` characters, never splitting a character.
    pub fn truncate_chars(text: &str, max_chars: usize) -> Cow<'_, str> {
        match text.char_indices().nth(max_chars) {
            Some((byte_idx, _)) => Cow::Borrowed(&text[..byte_idx]),
            None => Cow::Borrowed(text),
        }
    }

    /// Truncate text to `max_chars` characters with an ellipsis if needed.
    pub fn truncate_with_ellipsis(text: &str, max_chars: usize) -> Cow<'_, str> {
        if text.chars().count() <= max_chars {
            Cow::Borrowed(text)
        } else if max_chars <= 3 {
            Cow::Borrowed("...")
        } else {
            let mut result = Self::truncate_chars(text, max_chars - 3).into_owned();
            result.push_str("...");
            Cow::Owned(result)
        }
    }
}

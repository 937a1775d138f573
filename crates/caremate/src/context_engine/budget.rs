//! Deterministic token estimation used for every budget decision.
//!
//! ASCII runs count one token per four characters (rounded up) and every
//! non-ASCII character counts as one token, which keeps Chinese text from
//! being underestimated. Each turn adds a fixed overhead for role framing.

use crate::memory::Turn;

/// Framing cost of one turn (role marker and separators).
pub const TURN_OVERHEAD: usize = 4;

pub fn estimate_tokens(text: &str) -> usize {
    let mut tokens: usize = 0;
    let mut ascii_run: usize = 0;
    for c in text.chars() {
        if c.is_ascii() {
            ascii_run += 1;
        } else {
            tokens += ascii_run.div_ceil(4) + 1;
            ascii_run = 0;
        }
    }
    tokens + ascii_run.div_ceil(4)
}

pub fn estimate_turn(turn: &Turn) -> usize {
    estimate_tokens(&turn.content) + TURN_OVERHEAD
}

pub fn estimate_turns(turns: &[Turn]) -> usize {
    turns.iter().map(estimate_turn).sum()
}

/// Longest suffix of `text` whose estimate fits in `max_tokens`.
///
/// Dropping a leading character never raises the estimate, so the cut point
/// can be found by binary search over character boundaries.
pub fn truncate_from_start(text: &str, max_tokens: usize) -> &str {
    if estimate_tokens(text) <= max_tokens {
        return text;
    }
    let boundaries: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();

    // First boundary whose suffix fits; the last one (empty suffix) always does.
    let (mut lo, mut hi) = (0, boundaries.len() - 1);
    while lo < hi {
        let mid = (lo + hi) / 2;
        if estimate_tokens(&text[boundaries[mid]..]) <= max_tokens {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }
    &text[boundaries[lo]..]
}

/// Longest prefix of `text` whose estimate fits in `max_tokens`.
pub fn truncate_to_fit(text: &str, max_tokens: usize) -> &str {
    if estimate_tokens(text) <= max_tokens {
        return text;
    }
    let boundaries: Vec<usize> = std::iter::once(0)
        .chain(text.char_indices().skip(1).map(|(i, _)| i))
        .chain(std::iter::once(text.len()))
        .collect();

    // Last boundary whose prefix fits; the first one (empty prefix) always does.
    let (mut lo, mut hi) = (0, boundaries.len() - 1);
    while lo < hi {
        let mid = (lo + hi + 1) / 2;
        if estimate_tokens(&text[..boundaries[mid]]) <= max_tokens {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }
    &text[..boundaries[lo]]
}

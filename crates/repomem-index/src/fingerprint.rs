//! Content identity independent of timestamps.

/// Stable identity of a file's bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub content_hash: String,
    pub size: usize,
}

#[must_use]
pub fn fingerprint(bytes: &[u8]) -> Fingerprint {
    Fingerprint {
        content_hash: blake3::hash(bytes).to_hex().to_string(),
        size: bytes.len(),
    }
}

#[must_use]
pub fn hash_text(text: &str) -> String {
    blake3::hash(text.as_bytes()).to_hex().to_string()
}

/// Rough token count used for cost estimates and budgets.
#[must_use]
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / 4
}

/// Truncate to at most `max_chars` characters on a char boundary.
#[must_use]
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

//! Bounded text helpers for previews, messages, and logs.

/// Marker appended to previews and messages that were cut short.
pub const ELLIPSIS: &str = "…";

/// Marker appended to truncated build logs.
pub const LOG_TRUNCATED: &str = "\n[...truncated...]";

/// Keep at most `max_chars` characters of `text`, appending `marker` if
/// anything was dropped. Never splits a UTF-8 character.
pub fn truncate_chars(text: &str, max_chars: usize, marker: &str) -> String {
    match text.char_indices().nth(max_chars) {
        None => text.to_string(),
        Some((cut, _)) => {
            let mut out = String::with_capacity(cut + marker.len());
            out.push_str(&text[..cut]);
            out.push_str(marker);
            out
        }
    }
}

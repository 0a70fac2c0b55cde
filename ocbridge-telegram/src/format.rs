//! Outbound text chunking.
//!
//! Telegram rejects messages over 4096 characters, so replies are split on
//! paragraph, newline or space boundaries, with a multi-byte-safe hard split
//! as the last resort. Replies stay plain text.

/// Telegram's maximum message length in characters.
pub const TELEGRAM_MSG_LIMIT: usize = 4096;

/// Split a message into chunks that fit within Telegram's limit.
///
/// Splitting priority:
/// 1. Paragraph boundaries (`\n\n`)
/// 2. Newline boundaries (`\n`)
/// 3. Space boundaries
/// 4. Hard split at the limit (last resort)
pub fn chunk_message(text: &str) -> Vec<&str> {
    if text.len() <= TELEGRAM_MSG_LIMIT {
        return vec![text];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while remaining.len() > TELEGRAM_MSG_LIMIT {
        let limit = floor_char_boundary(remaining, TELEGRAM_MSG_LIMIT);
        let slice = &remaining[..limit];

        let split_at = slice
            .rfind("\n\n")
            .or_else(|| slice.rfind('\n'))
            .or_else(|| slice.rfind(' '))
            .map(|pos| pos + 1) // Keep the delimiter in the first chunk.
            .unwrap_or(limit);

        let (chunk, rest) = remaining.split_at(split_at);
        chunks.push(chunk);
        remaining = rest.trim_start_matches('\n');
    }

    if !remaining.is_empty() {
        chunks.push(remaining);
    }

    chunks
}

/// Largest byte index `<= idx` that lies on a char boundary of `s`.
pub(crate) fn floor_char_boundary(s: &str, idx: usize) -> usize {
    if idx >= s.len() {
        return s.len();
    }
    let mut i = idx;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_message_single_chunk() {
        let chunks = chunk_message("hola");
        assert_eq!(chunks, vec!["hola"]);
    }

    #[test]
    fn test_long_message_split_and_preserved() {
        let text = "a".repeat(5000);
        let chunks = chunk_message(&text);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.len() <= TELEGRAM_MSG_LIMIT);
        }
        assert_eq!(chunks.join(""), text);
    }

    #[test]
    fn test_split_prefers_paragraph_boundary() {
        let text = format!("{}\n\n{}", "a".repeat(3000), "b".repeat(3000));
        let chunks = chunk_message(&text);
        assert!(chunks.len() >= 2);
        assert!(chunks[0].trim_end().chars().all(|c| c == 'a'));
    }

    #[test]
    fn test_multibyte_never_splits_inside_char() {
        let text = "Привет мир ".repeat(400);
        for chunk in chunk_message(&text) {
            assert!(chunk.len() <= TELEGRAM_MSG_LIMIT);
            // Would panic on an invalid UTF-8 boundary.
            let _ = chunk.chars().count();
        }
    }

    #[test]
    fn test_floor_char_boundary() {
        let s = "aé"; // 'é' spans bytes 1..3
        assert_eq!(floor_char_boundary(s, 2), 1);
        assert_eq!(floor_char_boundary(s, 3), 3);
        assert_eq!(floor_char_boundary(s, 10), s.len());
    }
}

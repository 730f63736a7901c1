//! Outbound chunker (C10): split long text into size-bounded chunks with
//! markdown-aware boundaries.
//!
//! Split-point search prefers the latest newline within
//! `[0.4·max_len, max_len]`, then the latest space in that range, then a
//! hard cut at `max_len`. Splitting never lands inside a multi-byte UTF-8
//! sequence.

pub const DEFAULT_MAX_LEN: usize = 4096;

/// A single outbound chunk: the markdown-rendered text plus a plain-text
/// fallback for servers/clients that reject the markup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub markdown: String,
    pub fallback_text: String,
}

/// Split `text` into chunks no longer than `max_len` characters.
///
/// An empty (after trimming) input becomes a single chunk containing
/// `"(empty response)"`.
pub fn chunk_text(text: &str, max_len: usize) -> Vec<Chunk> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return vec![Chunk {
            markdown: "(empty response)".to_string(),
            fallback_text: "(empty response)".to_string(),
        }];
    }

    let mut chunks = Vec::new();
    let mut remaining = trimmed;

    while !remaining.is_empty() {
        if remaining.chars().count() <= max_len {
            push_chunk(&mut chunks, remaining);
            break;
        }

        let split_at = find_split_point(remaining, max_len);
        let (head, tail) = split_at_char_index(remaining, split_at);
        push_chunk(&mut chunks, head.trim_end());
        remaining = tail.trim_start();
    }

    chunks
}

fn push_chunk(chunks: &mut Vec<Chunk>, text: &str) {
    chunks.push(Chunk {
        markdown: text.to_string(),
        fallback_text: text.to_string(),
    });
}

/// Find the char-index split point within `text` given `max_len`.
fn find_split_point(text: &str, max_len: usize) -> usize {
    let chars: Vec<char> = text.chars().collect();
    let lower_bound = ((max_len as f64) * 0.4).floor() as usize;
    let upper_bound = max_len.min(chars.len());

    if let Some(idx) = rfind_in_range(&chars, lower_bound, upper_bound, '\n') {
        return idx + 1;
    }
    if let Some(idx) = rfind_in_range(&chars, lower_bound, upper_bound, ' ') {
        return idx + 1;
    }
    upper_bound
}

fn rfind_in_range(chars: &[char], lower: usize, upper: usize, needle: char) -> Option<usize> {
    let upper = upper.min(chars.len());
    let lower = lower.min(upper);
    (lower..upper).rev().find(|&i| chars[i] == needle)
}

/// Split `text` at char index `idx`, returning (head, tail) as `&str`
/// slices on proper char boundaries.
fn split_at_char_index(text: &str, idx: usize) -> (&str, &str) {
    match text.char_indices().nth(idx) {
        Some((byte_idx, _)) => text.split_at(byte_idx),
        None => (text, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_becomes_placeholder() {
        let chunks = chunk_text("   ", 4096);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].markdown, "(empty response)");
    }

    #[test]
    fn short_text_is_one_chunk() {
        let chunks = chunk_text("hello world", 4096);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].markdown, "hello world");
    }

    #[test]
    fn length_4096_is_one_chunk() {
        let text = "a".repeat(4096);
        let chunks = chunk_text(&text, 4096);
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn length_4097_splits_into_two() {
        let text = "a".repeat(4097);
        let chunks = chunk_text(&text, 4096);
        assert_eq!(chunks.len(), 2);
    }

    #[test]
    fn prefers_newline_split_in_range() {
        let mut text = "a".repeat(2000);
        text.push('\n');
        text.push_str(&"b".repeat(3000));
        let chunks = chunk_text(&text, 4096);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].markdown, "a".repeat(2000));
        assert_eq!(chunks[1].markdown, "b".repeat(3000));
    }

    #[test]
    fn concatenation_round_trips_modulo_boundary_whitespace() {
        let text = format!("{}\n{}", "x".repeat(3000), "y".repeat(3000));
        let chunks = chunk_text(&text, 4096);
        let joined: String = chunks
            .iter()
            .map(|c| c.markdown.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        assert_eq!(joined.replace('\n', ""), text.replace('\n', ""));
    }

    #[test]
    fn never_splits_inside_multibyte_char() {
        let text = format!("{}{}", "п".repeat(3000), "р".repeat(3000));
        let chunks = chunk_text(&text, 4096);
        for chunk in &chunks {
            assert!(chunk.markdown.chars().all(|c| c == 'п' || c == 'р'));
        }
        let total_chars: usize = chunks.iter().map(|c| c.markdown.chars().count()).sum();
        assert_eq!(total_chars, 6000);
    }

    #[test]
    fn hard_cuts_when_no_boundary_available() {
        let text = "a".repeat(5000);
        let chunks = chunk_text(&text, 4096);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].markdown.chars().count(), 4096);
    }
}

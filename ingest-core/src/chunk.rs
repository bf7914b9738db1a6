//! Token-aware recursive text splitting for embedding.

use std::collections::VecDeque;

/// Separators tried in order; content that still exceeds the chunk size after
/// the last one is hard-split on character boundaries.
const SEPARATORS: [&str; 3] = ["\n\n", "\n", " "];

/// Recursive splitter producing chunks measured in estimated tokens.
///
/// Splits on paragraph, then line, then word boundaries, and merges adjacent
/// pieces back into chunks of at most `chunk_size` tokens with a
/// `chunk_overlap`-token tail carried between consecutive chunks.
#[derive(Debug, Clone)]
pub struct ChunkSplitter {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl Default for ChunkSplitter {
    fn default() -> Self {
        Self::new(200, 40)
    }
}

impl ChunkSplitter {
    /// Create a splitter. The overlap is clamped below the chunk size.
    #[must_use]
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            chunk_size,
            chunk_overlap: chunk_overlap.min(chunk_size.saturating_sub(1)),
        }
    }

    /// Estimate token count for a text. Roughly one token per four bytes of
    /// English text; close enough for budgeting, cheap enough to run per
    /// piece without suspending the scheduler.
    #[must_use]
    pub fn token_len(text: &str) -> usize {
        text.len().div_ceil(4)
    }

    /// Split `text` into trimmed, non-empty chunks of at most `chunk_size`
    /// estimated tokens.
    #[must_use]
    pub fn split(&self, text: &str) -> Vec<String> {
        let pieces = self.split_recursive(text, &SEPARATORS);
        self.merge(pieces)
            .into_iter()
            .map(|chunk| chunk.trim().to_string())
            .filter(|chunk| !chunk.is_empty())
            .collect()
    }

    fn split_recursive(&self, text: &str, separators: &[&str]) -> Vec<String> {
        if Self::token_len(text) <= self.chunk_size {
            return vec![text.to_string()];
        }
        let Some((separator, rest)) = separators.split_first() else {
            return self.hard_split(text);
        };
        if !text.contains(separator) {
            return self.split_recursive(text, rest);
        }

        let mut pieces = Vec::new();
        for part in text.split(separator) {
            if part.is_empty() {
                continue;
            }
            if Self::token_len(part) <= self.chunk_size {
                pieces.push(part.to_string());
            } else {
                pieces.extend(self.split_recursive(part, rest));
            }
        }
        pieces
    }

    /// Last resort for pathological content with no separators at all.
    fn hard_split(&self, text: &str) -> Vec<String> {
        let max_bytes = self.chunk_size * 4;
        let mut pieces = Vec::new();
        let mut current = String::new();
        for ch in text.chars() {
            if current.len() + ch.len_utf8() > max_bytes && !current.is_empty() {
                pieces.push(std::mem::take(&mut current));
            }
            current.push(ch);
        }
        if !current.is_empty() {
            pieces.push(current);
        }
        pieces
    }

    fn merge(&self, pieces: Vec<String>) -> Vec<String> {
        let mut chunks = Vec::new();
        let mut window: VecDeque<String> = VecDeque::new();
        let mut window_tokens = 0usize;

        for piece in pieces {
            let piece_tokens = Self::token_len(&piece);
            if window_tokens + piece_tokens > self.chunk_size && !window.is_empty() {
                chunks.push(join_pieces(&window));
                // Keep at most chunk_overlap tokens as the tail of the next chunk.
                while window_tokens > self.chunk_overlap {
                    let Some(front) = window.pop_front() else {
                        break;
                    };
                    window_tokens -= Self::token_len(&front);
                }
            }
            window_tokens += piece_tokens;
            window.push_back(piece);
        }

        if !window.is_empty() {
            chunks.push(join_pieces(&window));
        }
        chunks
    }
}

fn join_pieces(window: &VecDeque<String>) -> String {
    let mut joined = String::new();
    for piece in window {
        if !joined.is_empty() {
            joined.push(' ');
        }
        joined.push_str(piece);
    }
    joined
}

//! Incremental text accumulation for streaming output
//!
//! Accumulates deltas, reconciles a provider's final full content against
//! what already streamed, extracts `<think>` regions across chunk
//! boundaries, and splits long output into send-sized blocks.

use once_cell::sync::Lazy;
use regex::Regex;

pub const DEFAULT_BLOCK_SIZE: usize = 2000;

const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";

/// Sentence boundary: terminal punctuation followed by whitespace or
/// end-of-string.
static SENTENCE_END: Lazy<Regex> = Lazy::new(|| Regex::new(r"[.!?。！？](\s|$)").unwrap());

#[derive(Clone, Debug, Default)]
pub struct DeltaBuffer {
    buffer: String,
    in_thinking_block: bool,
    thinking_buffer: String,
}

/// Result of thinking-tag extraction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThinkingExtract {
    pub thinking: String,
    pub content: String,
    pub is_complete: bool,
}

/// Result of block splitting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SplitBlocks {
    pub blocks: Vec<String>,
    pub remainder: String,
}

impl DeltaBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn content(&self) -> &str {
        &self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.in_thinking_block = false;
        self.thinking_buffer.clear();
    }

    /// Concatenate a delta; returns the accumulated buffer.
    pub fn append(&mut self, delta: &str) -> &str {
        self.buffer.push_str(delta);
        &self.buffer
    }

    /// Reconcile a provider-final full content against the accumulated
    /// deltas. When `full` extends the buffer, only the missing tail is
    /// returned; otherwise the buffer is replaced wholesale.
    pub fn append_dedup(&mut self, full: &str) -> String {
        if full.starts_with(self.buffer.as_str()) {
            let tail = full[self.buffer.len()..].to_string();
            self.buffer = full.to_string();
            tail
        } else {
            self.buffer = full.to_string();
            full.to_string()
        }
    }

    /// Parse `<think>...</think>` regions out of the buffer. The open
    /// state survives across chunks: an unterminated tag leaves
    /// `is_complete == false` and the partial region in `thinking`.
    pub fn extract_thinking(&mut self) -> ThinkingExtract {
        let mut content = String::new();
        let mut thinking = String::new();
        let mut rest = self.buffer.as_str();
        let mut in_block = false;

        loop {
            if in_block {
                match rest.find(THINK_CLOSE) {
                    Some(pos) => {
                        thinking.push_str(&rest[..pos]);
                        rest = &rest[pos + THINK_CLOSE.len()..];
                        in_block = false;
                    }
                    None => {
                        thinking.push_str(rest);
                        rest = "";
                    }
                }
            } else {
                match rest.find(THINK_OPEN) {
                    Some(pos) => {
                        content.push_str(&rest[..pos]);
                        rest = &rest[pos + THINK_OPEN.len()..];
                        in_block = true;
                    }
                    None => {
                        content.push_str(rest);
                        rest = "";
                    }
                }
            }
            if rest.is_empty() {
                break;
            }
        }

        self.in_thinking_block = in_block;
        self.thinking_buffer = thinking.clone();

        ThinkingExtract {
            thinking: thinking.trim().to_string(),
            content: content.trim().to_string(),
            is_complete: !in_block,
        }
    }

    pub fn in_thinking_block(&self) -> bool {
        self.in_thinking_block
    }

    /// Split the buffer into blocks of at most `size` chars, preferring to
    /// break at a paragraph, then a sentence end, then a word boundary.
    /// The final partial piece comes back as `remainder`.
    pub fn split_blocks(&self, size: usize) -> SplitBlocks {
        let size = size.max(1);
        let mut blocks = Vec::new();
        let mut rest = self.buffer.as_str();

        while rest.len() > size {
            let mut window_end = size;
            while !rest.is_char_boundary(window_end) {
                window_end -= 1;
            }
            let window = &rest[..window_end];

            let cut = find_paragraph_break(window)
                .or_else(|| find_sentence_break(window))
                .or_else(|| window.rfind(' ').map(|p| p + 1))
                .unwrap_or(window_end);

            blocks.push(rest[..cut].trim_end().to_string());
            rest = rest[cut..].trim_start();
        }

        SplitBlocks {
            blocks,
            remainder: rest.to_string(),
        }
    }
}

fn find_paragraph_break(window: &str) -> Option<usize> {
    window.rfind("\n\n").map(|p| p + 2)
}

fn find_sentence_break(window: &str) -> Option<usize> {
    SENTENCE_END
        .find_iter(window)
        .last()
        .map(|m| m.end())
}

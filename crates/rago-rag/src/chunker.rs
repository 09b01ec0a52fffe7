//! Document chunking
//!
//! Every strategy produces chunks that are exact, contiguous slices of the
//! document: concatenating chunk contents in index order (skipping the
//! overlap each chunk shares with its predecessor) gives back the original
//! text. Sizes are measured in characters.
//!
//! - `fixed`: back-to-back windows of `chunk_size` characters.
//! - `recursive`: split on the coarsest separator (paragraph, line,
//!   sentence, word) that keeps pieces within `chunk_size`, then pack pieces
//!   into windows that share up to `chunk_overlap` characters.
//! - `semantic`: split on sentence boundaries and pack whole sentences.
//!
//! Windows shorter than `min_chunk_size`, or blank, are dropped unless they
//! are the only window. `min_chunk_size = 0` keeps every window.

use rago_core::{chunk_id, Chunk, Document, RagoResult};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::VecDeque;

use crate::config::ChunkingConfig;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkingStrategy {
    Fixed,
    #[default]
    Recursive,
    Semantic,
}

/// Paragraph, line, sentence, word
const SEPARATORS: &[&str] = &["\n\n", "\n", ". ", " "];

/// Byte range into the document; always on char boundaries
type Span = (usize, usize);

#[derive(Debug, Clone)]
pub struct Chunker {
    config: ChunkingConfig,
}

impl Chunker {
    pub fn new(config: ChunkingConfig) -> RagoResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    /// Splits `doc` into chunks without vectors
    pub fn split(&self, doc: &Document) -> Vec<Chunk> {
        let text = doc.content.as_str();
        let size = self.config.chunk_size;

        let windows = match self.config.strategy {
            ChunkingStrategy::Fixed => hard_split(text, (0, text.len()), size),
            ChunkingStrategy::Recursive => {
                let mut pieces = Vec::new();
                split_recursive(text, (0, text.len()), size, 0, &mut pieces);
                pack(text, &pieces, size, self.config.chunk_overlap)
            }
            ChunkingStrategy::Semantic => {
                let mut pieces = Vec::new();
                for sentence in sentences(text) {
                    split_recursive(text, sentence, size, SEPARATORS.len() - 1, &mut pieces);
                }
                pack(text, &pieces, size, 0)
            }
        };

        let total = windows.len();
        let kept: Vec<Span> = windows
            .into_iter()
            .filter(|span| {
                let piece = &text[span.0..span.1];
                total == 1
                    || self.config.min_chunk_size == 0
                    || (!piece.trim().is_empty()
                        && piece.chars().count() >= self.config.min_chunk_size)
            })
            .collect();
        let kept = if kept.is_empty() {
            vec![(0, text.len())]
        } else {
            kept
        };

        kept.into_iter()
            .enumerate()
            .map(|(index, span)| make_chunk(doc, index, span))
            .collect()
    }
}

fn char_len(text: &str, span: Span) -> usize {
    text[span.0..span.1].chars().count()
}

/// Windows of at most `size` characters covering `span`
fn hard_split(text: &str, span: Span, size: usize) -> Vec<Span> {
    let mut out = Vec::new();
    let mut start = span.0;
    let mut count = 0;
    for (offset, _) in text[span.0..span.1].char_indices() {
        if count == size {
            out.push((start, span.0 + offset));
            start = span.0 + offset;
            count = 0;
        }
        count += 1;
    }
    if start < span.1 || out.is_empty() {
        out.push((start, span.1));
    }
    out
}

/// Pieces of `span` ending just after each occurrence of `separator`
fn split_keep(text: &str, span: Span, separator: &str) -> Vec<Span> {
    let mut out = Vec::new();
    let mut start = span.0;
    for (offset, matched) in text[span.0..span.1].match_indices(separator) {
        let end = span.0 + offset + matched.len();
        if end > start {
            out.push((start, end));
            start = end;
        }
    }
    if start < span.1 {
        out.push((start, span.1));
    }
    out
}

fn split_recursive(text: &str, span: Span, size: usize, level: usize, out: &mut Vec<Span>) {
    if char_len(text, span) <= size {
        if span.1 > span.0 {
            out.push(span);
        }
        return;
    }
    let Some(separator) = SEPARATORS.get(level) else {
        out.extend(hard_split(text, span, size));
        return;
    };
    let pieces = split_keep(text, span, separator);
    if pieces.len() <= 1 {
        split_recursive(text, span, size, level + 1, out);
        return;
    }
    for piece in pieces {
        split_recursive(text, piece, size, level + 1, out);
    }
}

/// Sentence spans: each ends after terminal punctuation plus trailing
/// whitespace, or after a newline
fn sentences(text: &str) -> Vec<Span> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();
    while let Some((offset, c)) = chars.next() {
        let boundary = match c {
            '\n' => true,
            '.' | '!' | '?' => chars.peek().map_or(true, |(_, next)| next.is_whitespace()),
            _ => false,
        };
        if !boundary {
            continue;
        }
        let mut end = offset + c.len_utf8();
        while let Some((next_offset, next)) = chars.peek().copied() {
            if next.is_whitespace() && next != '\n' {
                end = next_offset + next.len_utf8();
                chars.next();
            } else {
                break;
            }
        }
        out.push((start, end));
        start = end;
    }
    if start < text.len() {
        out.push((start, text.len()));
    }
    out
}

/// Greedily packs adjacent pieces into windows of at most `size` characters,
/// carrying up to `overlap` trailing characters into the next window
fn pack(text: &str, pieces: &[Span], size: usize, overlap: usize) -> Vec<Span> {
    let mut windows = Vec::new();
    let mut current: VecDeque<(Span, usize)> = VecDeque::new();
    let mut current_len = 0;

    for &piece in pieces {
        let len = char_len(text, piece);
        if current_len + len > size && !current.is_empty() {
            if let (Some(first), Some(last)) = (current.front(), current.back()) {
                windows.push((first.0 .0, last.0 .1));
            }
            while current_len > overlap || (current_len + len > size && !current.is_empty()) {
                match current.pop_front() {
                    Some((_, dropped)) => current_len -= dropped,
                    None => break,
                }
            }
        }
        current.push_back((piece, len));
        current_len += len;
    }
    if let (Some(first), Some(last)) = (current.front(), current.back()) {
        windows.push((first.0 .0, last.0 .1));
    }
    windows
}

fn make_chunk(doc: &Document, index: usize, span: Span) -> Chunk {
    let content = doc.content[span.0..span.1].to_string();
    let hash = format!("{:x}", Sha256::digest(content.as_bytes()));
    let start = doc.content[..span.0].chars().count();
    let end = start + content.chars().count();

    let mut metadata = doc.metadata.clone();
    metadata.insert("document_id".into(), json!(doc.id));
    metadata.insert("chunk_index".into(), json!(index));

    Chunk {
        id: chunk_id(&doc.id, index),
        document_id: doc.id.clone(),
        index,
        content,
        metadata,
        vector: Vec::new(),
        start,
        end,
        hash,
    }
}

/// Rebuilds the source text from chunks in index order, dropping the
/// overlap each chunk shares with its predecessor
pub fn reconstruct(chunks: &[Chunk]) -> String {
    let mut out = String::new();
    let mut covered: usize = 0;
    for chunk in chunks {
        let skip = covered.saturating_sub(chunk.start);
        out.extend(chunk.content.chars().skip(skip));
        covered = covered.max(chunk.end);
    }
    out
}

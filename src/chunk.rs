//! Segment-aware text chunker.
//!
//! Packs a document's [`TextSegment`]s into [`Chunk`]s that respect a
//! configurable `max_tokens` limit. Prose segments are joined with `\n\n`
//! and consecutive prose chunks share an overlap of up to `overlap_tokens`;
//! table rows always form a chunk of their own.
//!
//! Each chunk receives a deterministic UUID derived from its document ID
//! and index, plus a SHA-256 hash of its text for staleness detection.

use sha2::{Digest, Sha256};
use tracing::warn;
use uuid::Uuid;

use crate::config::ChunkingConfig;
use crate::models::{Chunk, SegmentKind, TextSegment};

/// Approximate chars-per-token ratio.
pub const CHARS_PER_TOKEN: usize = 4;

/// Token estimate for a piece of text.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

#[derive(Debug, Clone)]
struct Piece {
    text: String,
    seq: i64,
}

/// Split segments into chunks with contiguous indices starting at 0.
///
/// Segments are consumed in ascending `sequence_number` order. Text beyond
/// `max_document_chars` is dropped with a warning; everything before the
/// cutoff appears in at least one chunk.
pub fn split(document_id: &str, segments: &[TextSegment], config: &ChunkingConfig) -> Vec<Chunk> {
    let max_chars = (config.max_tokens * CHARS_PER_TOKEN).max(1);
    let overlap_chars = config.overlap_tokens * CHARS_PER_TOKEN;

    let mut ordered: Vec<&TextSegment> = segments.iter().collect();
    ordered.sort_by_key(|s| s.sequence_number);

    let mut packer = Packer::new(document_id, max_chars, overlap_chars);
    let mut budget = config.max_document_chars;

    for segment in ordered {
        if budget == 0 {
            warn!(
                document_id,
                max_document_chars = config.max_document_chars,
                "document truncated before chunking"
            );
            break;
        }
        let len = segment.content.chars().count();
        let content: String = if len > budget {
            segment.content.chars().take(budget).collect()
        } else {
            segment.content.clone()
        };
        budget = budget.saturating_sub(len);

        if segment.kind == SegmentKind::TableRow {
            packer.push_row(content.trim(), segment.sequence_number);
            continue;
        }
        for piece in hard_split(content.trim(), max_chars) {
            packer.push_prose(Piece {
                text: piece.to_string(),
                seq: segment.sequence_number,
            });
        }
    }
    packer.finish()
}

struct Packer<'a> {
    document_id: &'a str,
    max_chars: usize,
    overlap_chars: usize,
    current: Vec<Piece>,
    current_len: usize,
    /// Whether `current` holds anything beyond carried-over overlap.
    has_new: bool,
    chunks: Vec<Chunk>,
}

impl<'a> Packer<'a> {
    fn new(document_id: &'a str, max_chars: usize, overlap_chars: usize) -> Self {
        Self {
            document_id,
            max_chars,
            overlap_chars,
            current: Vec::new(),
            current_len: 0,
            has_new: false,
            chunks: Vec::new(),
        }
    }

    fn push_row(&mut self, text: &str, seq: i64) {
        if text.is_empty() {
            return;
        }
        self.flush();
        self.current.clear();
        self.current_len = 0;
        self.emit(&[Piece {
            text: text.to_string(),
            seq,
        }]);
    }

    fn push_prose(&mut self, piece: Piece) {
        let len = piece.text.chars().count();
        if len == 0 {
            return;
        }
        if !self.current.is_empty() && self.current_len + 2 + len > self.max_chars {
            if self.has_new {
                self.flush();
                self.current = self.overlap();
                self.current_len = joined_len(&self.current);
            }
            // Drop the overlap when it would leave no room for new content.
            if !self.current.is_empty() && self.current_len + 2 + len > self.max_chars {
                self.current.clear();
                self.current_len = 0;
            }
        }
        if !self.current.is_empty() {
            self.current_len += 2;
        }
        self.current_len += len;
        self.current.push(piece);
        self.has_new = true;
    }

    fn flush(&mut self) {
        if self.has_new {
            let pieces = std::mem::take(&mut self.current);
            self.emit(&pieces);
            self.current = pieces;
            self.has_new = false;
        }
    }

    /// Trailing whole pieces within the overlap budget, or a word-snapped
    /// tail of the last piece when it alone is too long.
    fn overlap(&self) -> Vec<Piece> {
        if self.overlap_chars == 0 {
            return Vec::new();
        }
        let mut out: Vec<Piece> = Vec::new();
        let mut total = 0usize;
        for piece in self.current.iter().rev() {
            let len = piece.text.chars().count();
            let added = if out.is_empty() { len } else { len + 2 };
            if total + added > self.overlap_chars {
                break;
            }
            total += added;
            out.push(piece.clone());
        }
        if out.is_empty() {
            if let Some(last) = self.current.last() {
                let tail = word_tail(&last.text, self.overlap_chars);
                if !tail.is_empty() {
                    out.push(Piece {
                        text: tail.to_string(),
                        seq: last.seq,
                    });
                }
            }
        }
        out.reverse();
        out
    }

    fn emit(&mut self, pieces: &[Piece]) {
        let text = pieces
            .iter()
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let first = pieces.iter().map(|p| p.seq).min().unwrap_or(0);
        let last = pieces.iter().map(|p| p.seq).max().unwrap_or(0);
        let index = self.chunks.len() as i64;
        self.chunks
            .push(make_chunk(self.document_id, index, text, first, last));
    }

    fn finish(mut self) -> Vec<Chunk> {
        self.flush();
        self.chunks
    }
}

fn joined_len(pieces: &[Piece]) -> usize {
    let chars: usize = pieces.iter().map(|p| p.text.chars().count()).sum();
    chars + 2 * pieces.len().saturating_sub(1)
}

/// Split text longer than `max_chars` at whitespace, falling back to a
/// hard cut inside a word that has no whitespace before the limit.
fn hard_split(text: &str, max_chars: usize) -> Vec<&str> {
    let mut out = Vec::new();
    let mut remaining = text;
    while !remaining.is_empty() {
        let limit = match remaining.char_indices().nth(max_chars) {
            Some((byte, _)) => byte,
            None => {
                out.push(remaining);
                break;
            }
        };
        let split_at = match remaining[..limit].rfind(char::is_whitespace) {
            Some(pos) if pos > 0 => pos,
            _ => limit,
        };
        let piece = remaining[..split_at].trim_end();
        if !piece.is_empty() {
            out.push(piece);
        }
        remaining = remaining[split_at..].trim_start();
    }
    out
}

/// Last `max_chars` characters of `text`, starting on a word boundary.
fn word_tail(text: &str, max_chars: usize) -> &str {
    let n = text.chars().count();
    if n <= max_chars {
        return text;
    }
    let start = text
        .char_indices()
        .nth(n - max_chars)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    let tail = &text[start..];
    let at_boundary = text[..start]
        .chars()
        .next_back()
        .map(char::is_whitespace)
        .unwrap_or(true);
    if at_boundary {
        tail.trim_start()
    } else {
        match tail.find(char::is_whitespace) {
            Some(i) => tail[i..].trim_start(),
            None => "",
        }
    }
}

fn make_chunk(document_id: &str, index: i64, text: String, first: i64, last: i64) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());
    let id = Uuid::new_v5(
        &Uuid::NAMESPACE_OID,
        format!("{}:{}", document_id, index).as_bytes(),
    );

    Chunk {
        id: id.to_string(),
        document_id: document_id.to_string(),
        chunk_index: index,
        token_estimate: estimate_tokens(&text),
        text,
        hash,
        first_sequence: first,
        last_sequence: last,
    }
}

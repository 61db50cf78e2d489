//! Sliding window chunker.
//!
//! Walks the text with a fixed-size window that advances by
//! `chunk_size - overlap_size` units. The last window is truncated to the
//! remaining text and iteration stops as soon as a window reaches the end.

use std::fmt;
use std::sync::Arc;

use rag_core::{Chunk, ChunkUnit, ChunkingConfig, Document, MetadataValue, RagError, Result};
use tokenizers::Tokenizer;
use tracing::debug;

/// Unit the window size and overlap are measured in.
#[derive(Clone, Default)]
pub enum WindowUnit {
    /// Unicode scalar values.
    #[default]
    Chars,
    /// Tokens produced by a HuggingFace tokenizer.
    Tokens(Arc<Tokenizer>),
}

impl fmt::Debug for WindowUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chars => f.write_str("Chars"),
            Self::Tokens(_) => f.write_str("Tokens"),
        }
    }
}

/// A window of text with its character span in the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextWindow {
    pub text: String,
    /// Start character offset (inclusive).
    pub start: usize,
    /// End character offset (exclusive).
    pub end: usize,
}

/// Split `text` into character windows.
pub fn chunk_text(text: &str, chunk_size: usize, overlap_size: usize) -> Result<Vec<TextWindow>> {
    validate(chunk_size, overlap_size)?;
    let index = CharIndex::new(text);
    let starts: Vec<usize> = (0..index.len()).collect();
    Ok(windows(text, &index, &starts, chunk_size, overlap_size))
}

/// Rebuild the source text from consecutive chunks of one document.
///
/// Overlapping prefixes are dropped using the character offsets, so the
/// result equals the original text whenever the chunks cover it.
pub fn reassemble(chunks: &[Chunk]) -> String {
    let mut ordered: Vec<&Chunk> = chunks.iter().collect();
    ordered.sort_by_key(|c| c.chunk_index);

    let mut out = String::new();
    let mut covered = 0usize;
    for chunk in ordered {
        if chunk.end_offset <= covered {
            continue;
        }
        let skip = covered.saturating_sub(chunk.start_offset);
        out.extend(chunk.text.chars().skip(skip));
        covered = chunk.end_offset;
    }
    out
}

/// Chunker producing overlapping windows over a document.
#[derive(Debug, Clone)]
pub struct SlidingWindowChunker {
    chunk_size: usize,
    overlap_size: usize,
    unit: WindowUnit,
}

impl SlidingWindowChunker {
    /// Create a character window chunker.
    pub fn new(chunk_size: usize, overlap_size: usize) -> Result<Self> {
        validate(chunk_size, overlap_size)?;
        Ok(Self {
            chunk_size,
            overlap_size,
            unit: WindowUnit::Chars,
        })
    }

    /// Create a token window chunker.
    pub fn with_tokenizer(
        chunk_size: usize,
        overlap_size: usize,
        tokenizer: Arc<Tokenizer>,
    ) -> Result<Self> {
        validate(chunk_size, overlap_size)?;
        Ok(Self {
            chunk_size,
            overlap_size,
            unit: WindowUnit::Tokens(tokenizer),
        })
    }

    /// Build a chunker from configuration, loading the tokenizer if needed.
    pub fn from_config(config: &ChunkingConfig) -> Result<Self> {
        match config.unit {
            ChunkUnit::Chars => Self::new(config.chunk_size, config.overlap_size),
            ChunkUnit::Tokens => {
                let path = config.tokenizer_path.as_ref().ok_or_else(|| {
                    RagError::invalid_config("token chunking requires a tokenizer path")
                })?;
                let tokenizer = Tokenizer::from_file(path).map_err(|e| RagError::Config {
                    message: format!("Failed to load tokenizer {}: {}", path.display(), e),
                })?;
                Self::with_tokenizer(config.chunk_size, config.overlap_size, Arc::new(tokenizer))
            }
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn overlap_size(&self) -> usize {
        self.overlap_size
    }

    pub fn unit(&self) -> &WindowUnit {
        &self.unit
    }

    /// Split raw text into windows.
    pub fn windows(&self, text: &str) -> Result<Vec<TextWindow>> {
        let index = CharIndex::new(text);
        let starts = match &self.unit {
            WindowUnit::Chars => (0..index.len()).collect(),
            WindowUnit::Tokens(tokenizer) => token_starts(tokenizer, text, index.len())?,
        };
        Ok(windows(text, &index, &starts, self.chunk_size, self.overlap_size))
    }

    /// Chunk a document. Each chunk carries the document metadata plus its position.
    pub fn chunk(&self, document: &Document) -> Result<Vec<Chunk>> {
        let windows = self.windows(&document.text)?;
        debug!(
            document_id = %document.id,
            chunks = windows.len(),
            unit = ?self.unit,
            "Chunked document"
        );

        Ok(windows
            .into_iter()
            .enumerate()
            .map(|(i, w)| {
                let mut metadata = document.metadata.clone();
                metadata.insert("document_id".into(), MetadataValue::from(document.id.as_str()));
                metadata.insert("chunk_index".into(), MetadataValue::from(i));
                metadata.insert("start_offset".into(), MetadataValue::from(w.start));
                metadata.insert("end_offset".into(), MetadataValue::from(w.end));
                Chunk {
                    document_id: document.id.clone(),
                    chunk_index: i as u32,
                    text: w.text,
                    start_offset: w.start,
                    end_offset: w.end,
                    metadata,
                }
            })
            .collect())
    }
}

fn validate(chunk_size: usize, overlap_size: usize) -> Result<()> {
    if chunk_size == 0 {
        return Err(RagError::invalid_config("chunk_size must be greater than 0"));
    }
    if overlap_size >= chunk_size {
        return Err(RagError::invalid_config(format!(
            "overlap_size ({}) must be smaller than chunk_size ({})",
            overlap_size, chunk_size
        )));
    }
    Ok(())
}

/// Byte position of every character, plus the text length.
struct CharIndex {
    bytes: Vec<usize>,
}

impl CharIndex {
    fn new(text: &str) -> Self {
        let mut bytes: Vec<usize> = text.char_indices().map(|(b, _)| b).collect();
        bytes.push(text.len());
        Self { bytes }
    }

    /// Number of characters.
    fn len(&self) -> usize {
        self.bytes.len() - 1
    }

    fn slice<'a>(&self, text: &'a str, start: usize, end: usize) -> &'a str {
        &text[self.bytes[start]..self.bytes[end]]
    }
}

/// Character offset where each token starts, widened so the first token
/// starts at 0 and each token runs up to the next one.
fn token_starts(tokenizer: &Tokenizer, text: &str, char_len: usize) -> Result<Vec<usize>> {
    let encoding = tokenizer
        .encode_char_offsets(text, false)
        .map_err(|e| RagError::internal(format!("Tokenization failed: {}", e)))?;

    let mut starts: Vec<usize> = encoding
        .get_offsets()
        .iter()
        .map(|(s, _)| *s)
        .filter(|s| *s < char_len)
        .collect();
    starts.sort_unstable();
    starts.dedup();

    match starts.first_mut() {
        Some(first) => *first = 0,
        // Whitespace-only text has no tokens but still needs covering.
        None if char_len > 0 => starts.push(0),
        None => {}
    }
    Ok(starts)
}

/// Windows over units starting at `starts` (character offsets, ascending).
fn windows(
    text: &str,
    index: &CharIndex,
    starts: &[usize],
    chunk_size: usize,
    overlap_size: usize,
) -> Vec<TextWindow> {
    let units = starts.len();
    let step = chunk_size - overlap_size;
    let mut out = Vec::new();
    let mut first = 0usize;

    while first < units {
        let last = (first + chunk_size).min(units);
        let start = starts[first];
        let end = if last == units { index.len() } else { starts[last] };
        out.push(TextWindow {
            text: index.slice(text, start, end).to_string(),
            start,
            end,
        });
        if last == units {
            break;
        }
        first += step;
    }
    out
}

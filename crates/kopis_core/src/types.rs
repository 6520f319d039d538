use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetKind {
    Header,
    Footer,
}

impl fmt::Display for OffsetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OffsetKind::Header => write!(f, "header"),
            OffsetKind::Footer => write!(f, "footer"),
        }
    }
}

/// One header or footer occurrence found during the dig phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetRecord {
    pub type_index: usize,
    pub offset: u64,
    pub kind: OffsetKind,
    /// Length of the matched bytes; varies per occurrence for regex patterns.
    pub len: u32,
}

impl OffsetRecord {
    #[inline]
    pub fn is_header(&self) -> bool {
        self.kind == OffsetKind::Header
    }

    #[inline]
    pub fn end(&self) -> u64 {
        self.offset + u64::from(self.len)
    }
}

/// Position and length of one match, as stored in the offset database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Occurrence {
    pub offset: u64,
    pub len: u32,
}

impl Occurrence {
    #[inline]
    pub fn new(offset: u64, len: usize) -> Self {
        Self {
            offset,
            len: u32::try_from(len).unwrap_or(u32::MAX),
        }
    }

    #[inline]
    pub fn end(&self) -> u64 {
        self.offset + u64::from(self.len)
    }
}

/// A slice of the image handed to a scanner.
///
/// `data` starts `prefix_len` bytes before the fresh part of the chunk: those
/// bytes are the tail of the previous chunk, carried over so that patterns
/// crossing the boundary are still visible.
///
/// A match belongs to the chunk in which it starts, except that the last
/// `tail_len` bytes are left to the next chunk, which sees them as its prefix
/// together with enough following bytes to match them in full.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub index: u64,
    pub base_offset: u64,
    pub prefix_len: usize,
    /// Trailing bytes handed over to the next chunk; zero for the last one.
    pub tail_len: usize,
    pub data: Vec<u8>,
}

impl Chunk {
    /// Number of bytes this chunk contributes beyond the carried-over prefix.
    #[inline]
    pub fn fresh_len(&self) -> usize {
        self.data.len().saturating_sub(self.prefix_len)
    }

    /// Whether a match starting at `start` (local to `data`) is reported by
    /// this chunk.
    #[inline]
    pub fn owns_start(&self, start: usize) -> bool {
        start < self.data.len().saturating_sub(self.tail_len)
    }

    #[inline]
    pub fn absolute(&self, local: usize) -> u64 {
        self.base_offset + local as u64
    }
}

//! Seams between the scanning core and its adapters.

use crate::error::Result;
use crate::scanners::ChunkHits;
use crate::types::Chunk;

/// A source of raw image bytes: an image file, a block device or anything
/// else that can be read at an offset.
pub trait BlockSource {
    /// Reads into `buffer` starting at `offset`.
    ///
    /// # Arguments
    ///
    /// * `offset` - Absolute byte offset to start reading from
    /// * `buffer` - Destination; filled from the front
    ///
    /// # Returns
    ///
    /// The number of bytes read. Fewer than `buffer.len()` only at the end
    /// of the source, zero past it.
    ///
    /// # Errors
    ///
    /// [`CoreError::Io`](crate::CoreError::Io) when the underlying read fails.
    fn read_chunk(&mut self, offset: u64, buffer: &mut [u8]) -> Result<usize>;

    /// Total size in bytes, `None` when it could not be determined.
    fn size(&self) -> Option<u64>;
}

impl<S: BlockSource + ?Sized> BlockSource for Box<S> {
    fn read_chunk(&mut self, offset: u64, buffer: &mut [u8]) -> Result<usize> {
        (**self).read_chunk(offset, buffer)
    }

    fn size(&self) -> Option<u64> {
        (**self).size()
    }
}

/// A dig-phase backend.
///
/// Implementations report every occurrence a chunk owns, overlapping ones
/// included, so that alignment and overlap rules are applied in one place
/// regardless of the backend.
pub trait ChunkScanner: Send + Sync {
    /// Finds every header and footer occurrence `chunk` owns.
    ///
    /// # Arguments
    ///
    /// * `chunk` - Image bytes with their carried prefix and unowned tail
    ///
    /// # Returns
    ///
    /// Occurrences per type at absolute offsets, ascending within each list.
    /// Scanning cannot fail; a backend that drops matches it has no room
    /// for counts them itself.
    fn scan(&self, chunk: &Chunk) -> ChunkHits;

    /// Short backend label for logs and thread names.
    fn name(&self) -> &'static str;
}

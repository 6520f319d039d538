//! Sequential chunking of an image with boundary overlap.

use kopis_core::{BlockSource, Chunk, Result};

/// Reads an image front to back in `chunk_size` steps.
///
/// Every chunk after the first starts with the last `overlap` bytes of its
/// predecessor, so a pattern up to `overlap + 1` bytes long is always fully
/// visible in at least one chunk. Matches starting in those bytes belong to
/// the later chunk (see [`Chunk::owns_start`]). When the image size is not
/// known up front and the image ends exactly on a chunk boundary, one last
/// chunk holding only the carried bytes is emitted so they are still scanned.
pub struct ImageReader<S> {
    source: S,
    chunk_size: usize,
    overlap: usize,
    skip: u64,
    position: u64,
    next_index: u64,
    tail: Vec<u8>,
    finished: bool,
}

impl<S: BlockSource> ImageReader<S> {
    pub fn new(source: S, chunk_size: usize, overlap: usize, skip: u64) -> Self {
        Self {
            source,
            chunk_size: chunk_size.max(1),
            overlap,
            skip,
            position: skip,
            next_index: 0,
            tail: Vec::with_capacity(overlap),
            finished: false,
        }
    }

    pub fn size(&self) -> Option<u64> {
        self.source.size()
    }

    /// Bytes between the skip offset and the end of the image, when known.
    pub fn scan_len(&self) -> Option<u64> {
        self.size().map(|s| s.saturating_sub(self.skip))
    }

    /// Absolute offset of the next fresh byte.
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn chunks_read(&self) -> u64 {
        self.next_index
    }

    /// Reads the next chunk into `buffer`, which may be a recycled
    /// allocation.
    ///
    /// # Arguments
    ///
    /// * `buffer` - Storage for the chunk data; its contents are discarded.
    ///
    /// # Returns
    ///
    /// The next chunk, or `None` once the image is exhausted.
    ///
    /// # Errors
    ///
    /// Propagates any read error from the underlying [`BlockSource`].
    pub fn next_chunk(&mut self, mut buffer: Vec<u8>) -> Result<Option<Chunk>> {
        if self.finished {
            return Ok(None);
        }

        let prefix_len = self.tail.len();
        buffer.clear();
        buffer.extend_from_slice(&self.tail);
        buffer.resize(prefix_len + self.chunk_size, 0);

        let read = self
            .source
            .read_chunk(self.position, &mut buffer[prefix_len..])?;
        if read == 0 {
            self.finished = true;
            if prefix_len == 0 {
                return Ok(None);
            }
            // The previous chunk left its tail unowned.
            buffer.truncate(prefix_len);
            return Ok(Some(self.emit(buffer, prefix_len, 0)));
        }

        let end = self.position + read as u64;
        let at_end = read < self.chunk_size || self.size().is_some_and(|s| end >= s);
        self.finished = at_end;
        buffer.truncate(prefix_len + read);

        let keep = self.overlap.min(buffer.len());
        self.tail.clear();
        self.tail.extend_from_slice(&buffer[buffer.len() - keep..]);

        let tail_len = if at_end { 0 } else { keep };
        let chunk = self.emit(buffer, prefix_len, tail_len);
        self.position = end;
        Ok(Some(chunk))
    }

    fn emit(&mut self, data: Vec<u8>, prefix_len: usize, tail_len: usize) -> Chunk {
        let chunk = Chunk {
            index: self.next_index,
            base_offset: self.position - prefix_len as u64,
            prefix_len,
            tail_len,
            data,
        };
        self.next_index += 1;
        chunk
    }
}

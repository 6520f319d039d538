use std::fs::File;
use std::io::{self, ErrorKind};
use std::path::Path;

use kopis_core::{BlockSource, CoreError, Result};
use memmap2::Mmap;

/// Memory-mapped view of a regular image file, used for random access
/// during carving.
pub struct MmapReader {
    mmap: Mmap,
}

impl MmapReader {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let meta = file.metadata()?;

        if !meta.is_file() || meta.len() == 0 {
            return Err(CoreError::Io(io::Error::new(
                ErrorKind::InvalidInput,
                "only non-empty regular files can be mapped",
            )));
        }

        // SAFETY: the mapping is read-only; images are not expected to be
        // modified while they are being carved.
        let mmap = unsafe { Mmap::map(&file) }?;

        #[cfg(target_os = "linux")]
        {
            use memmap2::Advice;
            let _ = mmap.advise(Advice::Random);
        }

        Ok(Self { mmap })
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.mmap.len() as u64
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    /// Borrow of `len` bytes at `offset`, shortened at end of file.
    #[inline]
    pub fn slice(&self, offset: u64, len: usize) -> Option<&[u8]> {
        let start = usize::try_from(offset).ok()?;
        if start >= self.mmap.len() {
            return None;
        }
        let end = start.saturating_add(len).min(self.mmap.len());
        Some(&self.mmap[start..end])
    }

    #[cfg(target_os = "linux")]
    pub fn prefetch(&self, offset: u64, len: usize) {
        let Ok(start) = usize::try_from(offset) else {
            return;
        };
        if start >= self.mmap.len() {
            return;
        }
        let end = start.saturating_add(len).min(self.mmap.len());
        let _ = self
            .mmap
            .advise_range(memmap2::Advice::WillNeed, start, end - start);
    }

    #[cfg(not(target_os = "linux"))]
    pub fn prefetch(&self, _offset: u64, _len: usize) {}
}

impl BlockSource for MmapReader {
    fn read_chunk(&mut self, offset: u64, buffer: &mut [u8]) -> Result<usize> {
        match self.slice(offset, buffer.len()) {
            Some(slice) => {
                let len = slice.len();
                buffer[..len].copy_from_slice(slice);
                Ok(len)
            }
            None => Ok(0),
        }
    }

    fn size(&self) -> Option<u64> {
        Some(self.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_mmap_reader_slices() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"GIF89a....\x00\x3b").unwrap();
        temp_file.flush().unwrap();

        let reader = MmapReader::new(temp_file.path()).unwrap();
        assert_eq!(reader.size(), Some(12));
        assert_eq!(reader.slice(0, 6).unwrap(), b"GIF89a");
        assert_eq!(reader.slice(10, 100).unwrap(), b"\x00\x3b");
        assert!(reader.slice(12, 1).is_none());
    }

    #[test]
    fn test_mmap_reader_block_source_trait() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"%PDF-1.7 ... %EOF").unwrap();
        temp_file.flush().unwrap();

        let mut reader = MmapReader::new(temp_file.path()).unwrap();
        let mut buffer = vec![0u8; 4];
        assert_eq!(reader.read_chunk(0, &mut buffer).unwrap(), 4);
        assert_eq!(&buffer, b"%PDF");
        assert_eq!(reader.read_chunk(1000, &mut buffer).unwrap(), 0);
    }

    #[test]
    fn test_mmap_reader_empty_file() {
        let temp_file = NamedTempFile::new().unwrap();
        assert!(MmapReader::new(temp_file.path()).is_err());
    }

    #[test]
    fn test_prefetch_does_not_panic() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"prefetch").unwrap();
        temp_file.flush().unwrap();

        let reader = MmapReader::new(temp_file.path()).unwrap();
        reader.prefetch(0, 1024);
        reader.prefetch(1000, 1024);
    }
}

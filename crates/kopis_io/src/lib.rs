mod chunker;
mod mmap_reader;
pub mod probe;
mod reader;

pub use chunker::ImageReader;
pub use mmap_reader::MmapReader;
pub use reader::DiskReader;

use kopis_core::{BlockSource, Result};
use std::path::Path;

/// Image access picked per path: a memory map for regular files, plain
/// reads for devices and anything that cannot be mapped.
pub enum Reader {
    Mmap(MmapReader),
    Disk(DiskReader),
}

impl Reader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path_ref = path.as_ref();
        match MmapReader::new(path_ref) {
            Ok(r) => Ok(Reader::Mmap(r)),
            Err(_) => Ok(Reader::Disk(DiskReader::new(path_ref)?)),
        }
    }

    /// Sequential reads only; used by the dig phase.
    pub fn sequential(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Reader::Disk(DiskReader::new(path)?))
    }

    #[inline]
    pub fn is_mmap(&self) -> bool {
        matches!(self, Reader::Mmap(_))
    }
}

impl BlockSource for Reader {
    fn read_chunk(&mut self, offset: u64, buffer: &mut [u8]) -> Result<usize> {
        match self {
            Reader::Mmap(r) => r.read_chunk(offset, buffer),
            Reader::Disk(r) => r.read_chunk(offset, buffer),
        }
    }

    fn size(&self) -> Option<u64> {
        match self {
            Reader::Mmap(r) => r.size(),
            Reader::Disk(r) => r.size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn regular_files_are_mapped() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(&[1u8; 2048]).unwrap();
        temp_file.flush().unwrap();

        let reader = Reader::open(temp_file.path()).unwrap();
        assert!(reader.is_mmap());
        assert_eq!(reader.size(), Some(2048));

        let reader = Reader::sequential(temp_file.path()).unwrap();
        assert!(!reader.is_mmap());
        assert_eq!(reader.size(), Some(2048));
    }

    #[test]
    fn empty_files_fall_back_to_disk_reader() {
        let temp_file = NamedTempFile::new().unwrap();
        let reader = Reader::open(temp_file.path()).unwrap();
        assert!(!reader.is_mmap());
        assert_eq!(reader.size(), Some(0));
    }

    #[test]
    fn chunker_over_disk_reader() {
        let mut temp_file = NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 256) as u8).collect();
        temp_file.write_all(&data).unwrap();
        temp_file.flush().unwrap();

        let source = Reader::sequential(temp_file.path()).unwrap();
        let mut chunks = ImageReader::new(source, 1024, 7, 0);
        let mut total = 0;
        while let Some(chunk) = chunks.next_chunk(Vec::new()).unwrap() {
            let start = chunk.base_offset as usize;
            assert_eq!(chunk.data, &data[start..start + chunk.data.len()]);
            total += chunk.fresh_len();
        }
        assert_eq!(total, 5000);
    }
}

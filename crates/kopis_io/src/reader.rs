//! Read-only image reader for disk image files and block devices.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::Path;

use kopis_core::{BlockSource, Result};
use tracing::debug;

use crate::probe;

/// A read-only block source over an image file or a raw device
/// (`/dev/sda`, `/dev/nvme0n1p2`, ...).
///
/// Only safe Rust is used for reading; the size comes from
/// [`probe::measure_open_file`] and may be unknown for exotic streams.
pub struct DiskReader {
    file: File,
    size: Option<u64>,
}

impl DiskReader {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(false)
            .open(path.as_ref())?;

        #[cfg(target_os = "linux")]
        {
            use rustix::fs::{fadvise, Advice};

            let _ = fadvise(&file, 0, None, Advice::Sequential);
            let _ = fadvise(&file, 0, None, Advice::NoReuse);
        }

        let size = probe::measure_open_file(&mut file)?;
        debug!(path = %path.as_ref().display(), ?size, "opened image");

        Ok(Self { file, size })
    }
}

impl BlockSource for DiskReader {
    /// Fills as much of `buffer` as the image allows; short reads from the
    /// device are retried until end of data.
    fn read_chunk(&mut self, offset: u64, buffer: &mut [u8]) -> Result<usize> {
        self.file.seek(SeekFrom::Start(offset))?;

        let mut filled = 0;
        while filled < buffer.len() {
            match self.file.read(&mut buffer[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(filled)
    }

    fn size(&self) -> Option<u64> {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_disk_reader_basic() {
        let mut temp_file = NamedTempFile::new().unwrap();
        let test_data = b"\xff\xd8\xff\xe0 JFIF body bytes \xff\xd9 trailing";
        temp_file.write_all(test_data).unwrap();
        temp_file.flush().unwrap();
        let mut reader = DiskReader::new(temp_file.path()).unwrap();

        assert_eq!(reader.size(), Some(test_data.len() as u64));

        let mut buffer = vec![0u8; 4];
        let bytes_read = reader.read_chunk(0, &mut buffer).unwrap();
        assert_eq!(bytes_read, 4);
        assert_eq!(&buffer, b"\xff\xd8\xff\xe0");

        let mut buffer = vec![0u8; 4];
        let bytes_read = reader.read_chunk(5, &mut buffer).unwrap();
        assert_eq!(bytes_read, 4);
        assert_eq!(&buffer, b"JFIF");
    }

    #[test]
    fn test_disk_reader_read_beyond_end() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"Short").unwrap();
        temp_file.flush().unwrap();

        let mut reader = DiskReader::new(temp_file.path()).unwrap();

        let mut buffer = vec![0u8; 100];
        assert_eq!(reader.read_chunk(0, &mut buffer).unwrap(), 5);
        assert_eq!(reader.read_chunk(50, &mut buffer).unwrap(), 0);
    }

    #[test]
    fn test_disk_reader_missing_file() {
        assert!(DiskReader::new("/nonexistent/kopis/image.dd").is_err());
    }
}

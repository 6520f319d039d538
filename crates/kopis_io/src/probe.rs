//! Image size discovery.
//!
//! Regular files report their length through metadata. Block devices are
//! asked through `BLKGETSIZE64` on Linux; when that is unavailable the size
//! is found by probing single-byte reads, doubling and then bisecting, and
//! rounded down to whole sectors.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};

use tracing::debug;

pub const PROBE_SECTOR_SIZE: u64 = 512;

/// Size of an opened image, `None` when it cannot be determined.
pub fn measure_open_file(file: &mut File) -> io::Result<Option<u64>> {
    let meta = file.metadata()?;
    if meta.is_file() {
        return Ok(Some(meta.len()));
    }

    if is_block_device(&meta) {
        match block_device_size(file) {
            Ok(size) => return Ok(Some(size)),
            Err(e) => debug!(error = %e, "device size query failed, probing"),
        }
        let size = bisect_size(file)?;
        file.seek(SeekFrom::Start(0))?;
        return Ok(Some(size));
    }

    let size = file.seek(SeekFrom::End(0)).ok();
    file.seek(SeekFrom::Start(0))?;
    Ok(size.filter(|&s| s > 0))
}

#[cfg(unix)]
fn is_block_device(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::FileTypeExt;
    meta.file_type().is_block_device()
}

#[cfg(not(unix))]
fn is_block_device(_meta: &std::fs::Metadata) -> bool {
    false
}

#[cfg(target_os = "linux")]
fn block_device_size(file: &File) -> io::Result<u64> {
    use std::os::unix::io::AsRawFd;

    const BLKGETSIZE64: libc::c_ulong = 0x80081272;

    let mut size: u64 = 0;
    // SAFETY: BLKGETSIZE64 writes one u64 through the pointer, which lives
    // for the duration of the call.
    let result = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64 as _, &mut size as *mut u64) };

    if result == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(size)
    }
}

#[cfg(not(target_os = "linux"))]
fn block_device_size(_file: &File) -> io::Result<u64> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "device size query not supported on this platform",
    ))
}

fn readable_at<R: Read + Seek>(source: &mut R, offset: u64) -> bool {
    let mut byte = [0u8; 1];
    source.seek(SeekFrom::Start(offset)).is_ok() && matches!(source.read(&mut byte), Ok(1))
}

/// Finds the readable length of `source` with single-byte trial reads and
/// rounds it down to a multiple of [`PROBE_SECTOR_SIZE`].
pub fn bisect_size<R: Read + Seek>(source: &mut R) -> io::Result<u64> {
    if !readable_at(source, 0) {
        return Ok(0);
    }

    let mut low = 0u64;
    let mut high = PROBE_SECTOR_SIZE;
    while readable_at(source, high) {
        low = high;
        high = high.checked_mul(2).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "device size probe overflowed")
        })?;
    }

    // `low` is readable, `high` is not.
    while high - low > 1 {
        let mid = low + (high - low) / 2;
        if readable_at(source, mid) {
            low = mid;
        } else {
            high = mid;
        }
    }

    let size = ((low + 1) / PROBE_SECTOR_SIZE) * PROBE_SECTOR_SIZE;
    debug!(size, "probed device size");
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use tempfile::NamedTempFile;

    #[test]
    fn bisect_exact_sectors() {
        let mut cursor = Cursor::new(vec![0u8; 4096]);
        assert_eq!(bisect_size(&mut cursor).unwrap(), 4096);
    }

    #[test]
    fn bisect_rounds_down_to_sector() {
        let mut cursor = Cursor::new(vec![0u8; 5000]);
        assert_eq!(bisect_size(&mut cursor).unwrap(), 4608);
        let mut cursor = Cursor::new(vec![0u8; 100]);
        assert_eq!(bisect_size(&mut cursor).unwrap(), 0);
    }

    #[test]
    fn bisect_empty_source() {
        let mut cursor = Cursor::new(Vec::new());
        assert_eq!(bisect_size(&mut cursor).unwrap(), 0);
    }

    #[test]
    fn bisect_large_odd_size() {
        let mut cursor = Cursor::new(vec![0u8; 3 * 1024 * 1024 + 700]);
        assert_eq!(bisect_size(&mut cursor).unwrap(), 3 * 1024 * 1024 + 512);
    }

    #[test]
    fn regular_file_uses_metadata() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(&[7u8; 1234]).unwrap();
        temp_file.flush().unwrap();
        let mut file = File::open(temp_file.path()).unwrap();
        assert_eq!(measure_open_file(&mut file).unwrap(), Some(1234));
    }
}

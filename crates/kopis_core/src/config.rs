//! Run options and the context handed to every component.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;

use crate::carving::CarvePolicy;
use crate::database::MergePolicy;
use crate::error::{CoreError, Result};

pub const DEFAULT_CHUNK_SIZE: usize = 10 * 1024 * 1024;
pub const DEFAULT_MAX_FILES_PER_SUBDIR: usize = 1000;
pub const SECTOR_SIZE: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Cpu,
    Gpu,
}

#[derive(Debug, Clone, Serialize)]
pub struct CarveOptions {
    pub preview: bool,
    pub no_suffix: bool,
    pub organize_subdirs: bool,
    pub max_files_per_subdir: usize,
    pub carve_missing_footers: bool,
    pub handle_embedded: bool,
    pub block_aligned: Option<u64>,
    pub no_search_overlap: bool,
    pub full_database: bool,
    pub skip: u64,
    pub chunk_size: usize,
    pub queue_capacity: usize,
    pub workers: usize,
    pub backend: BackendKind,
}

impl Default for CarveOptions {
    fn default() -> Self {
        let workers = num_cpus::get().max(1);
        Self {
            preview: false,
            no_suffix: false,
            organize_subdirs: true,
            max_files_per_subdir: DEFAULT_MAX_FILES_PER_SUBDIR,
            carve_missing_footers: false,
            handle_embedded: false,
            block_aligned: None,
            no_search_overlap: false,
            full_database: false,
            skip: 0,
            chunk_size: DEFAULT_CHUNK_SIZE,
            queue_capacity: workers * 4,
            workers,
            backend: BackendKind::Cpu,
        }
    }
}

impl CarveOptions {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || self.chunk_size % SECTOR_SIZE != 0 {
            return Err(CoreError::InvalidOptions(format!(
                "chunk size {} must be a positive multiple of {SECTOR_SIZE}",
                self.chunk_size
            )));
        }
        if self.block_aligned == Some(0) {
            return Err(CoreError::InvalidOptions(
                "cluster block size must be positive".into(),
            ));
        }
        if self.workers == 0 {
            return Err(CoreError::InvalidOptions("worker count must be positive".into()));
        }
        if self.queue_capacity == 0 {
            return Err(CoreError::InvalidOptions("queue capacity must be positive".into()));
        }
        if self.max_files_per_subdir == 0 {
            return Err(CoreError::InvalidOptions(
                "files per subdirectory must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn merge_policy(&self) -> MergePolicy {
        MergePolicy {
            block_aligned: self.block_aligned,
            no_search_overlap: self.no_search_overlap,
        }
    }

    pub fn carve_policy(&self) -> CarvePolicy {
        CarvePolicy {
            carve_missing_footers: self.carve_missing_footers,
            handle_embedded: self.handle_embedded,
        }
    }
}

/// Process-wide cancellation signal, counted so callers can tell whether a
/// new request arrived since they last looked.
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    count: Arc<AtomicUsize>,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one interrupt request; returns the new count.
    pub fn raise(&self) -> usize {
        self.count.fetch_add(1, Ordering::SeqCst) + 1
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn is_raised(&self) -> bool {
        self.count() > 0
    }

    /// True once an interrupt arrived after `baseline` was taken.
    #[inline]
    pub fn raised_since(&self, baseline: usize) -> bool {
        self.count() > baseline
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub options: CarveOptions,
    pub interrupt: Interrupt,
}

impl RunContext {
    pub fn new(options: CarveOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            options,
            interrupt: Interrupt::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let opts = CarveOptions::default();
        assert!(opts.validate().is_ok());
        assert_eq!(opts.max_files_per_subdir, 1000);
        assert_eq!(opts.chunk_size, 10 * 1024 * 1024);
        assert!(opts.workers >= 1);
    }

    #[test]
    fn rejects_bad_chunk_size() {
        let opts = CarveOptions {
            chunk_size: 1000,
            ..CarveOptions::default()
        };
        assert!(matches!(opts.validate(), Err(CoreError::InvalidOptions(_))));
        let opts = CarveOptions {
            chunk_size: 0,
            ..CarveOptions::default()
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn rejects_zero_values() {
        for opts in [
            CarveOptions {
                block_aligned: Some(0),
                ..CarveOptions::default()
            },
            CarveOptions {
                workers: 0,
                ..CarveOptions::default()
            },
            CarveOptions {
                queue_capacity: 0,
                ..CarveOptions::default()
            },
            CarveOptions {
                max_files_per_subdir: 0,
                ..CarveOptions::default()
            },
        ] {
            assert!(opts.validate().unwrap_err().is_config());
        }
    }

    #[test]
    fn interrupt_counts() {
        let interrupt = Interrupt::new();
        let shared = interrupt.clone();
        assert!(!interrupt.is_raised());
        let baseline = interrupt.count();
        assert_eq!(shared.raise(), 1);
        assert!(interrupt.is_raised());
        assert!(interrupt.raised_since(baseline));
        assert!(!interrupt.raised_since(interrupt.count()));
    }

    #[test]
    fn policies_follow_options() {
        let opts = CarveOptions {
            block_aligned: Some(4096),
            no_search_overlap: true,
            carve_missing_footers: true,
            ..CarveOptions::default()
        };
        assert_eq!(opts.merge_policy().block_aligned, Some(4096));
        assert!(opts.merge_policy().no_search_overlap);
        assert!(opts.carve_policy().carve_missing_footers);
        assert!(!opts.carve_policy().handle_embedded);
    }
}

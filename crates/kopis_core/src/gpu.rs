//! Block-parallel batch scanner.
//!
//! The chunk is cut into [`GPU_BLOCK_SIZE`] byte blocks. A device matches
//! every literal pattern against every block independently and returns a
//! capped list of `(pattern, intra-block offset)` entries per block, which
//! this module decodes back into absolute image offsets.
//!
//! [`HostDevice`] runs those block semantics on the rayon pool, so the
//! backend is usable without accelerator hardware.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use rayon::prelude::*;
use tracing::{debug, warn};

use crate::error::{CoreError, Result};
use crate::matcher::LiteralMatcher;
use crate::scanners::ChunkHits;
use crate::spec::SpecSet;
use crate::traits::ChunkScanner;
use crate::types::{Chunk, Occurrence, OffsetKind};

pub const GPU_BLOCK_SIZE: usize = 256;
pub const MAX_RESULTS_PER_BLOCK: usize = 120;
pub const MAX_GPU_PATTERNS: usize = 1024;

/// One entry of a block's result list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockMatch {
    pub pattern: u16,
    pub offset: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockResults {
    pub matches: Vec<BlockMatch>,
    /// Matches found beyond [`MAX_RESULTS_PER_BLOCK`] and dropped.
    pub dropped: u32,
}

/// Pattern table laid out for the device: slot `2 * type` holds the header,
/// `2 * type + 1` the footer (empty when the type has none).
#[derive(Debug, Clone)]
pub struct PatternTable {
    slots: Vec<Option<LiteralMatcher>>,
}

impl PatternTable {
    pub fn build(specs: &SpecSet) -> Result<Self> {
        let needed = specs.len() * 2;
        if needed > MAX_GPU_PATTERNS {
            return Err(CoreError::GpuPatternLimit {
                needed,
                max: MAX_GPU_PATTERNS,
            });
        }

        let mut slots = Vec::with_capacity(needed);
        for spec in specs {
            let regex_error = || CoreError::RegexOnGpu {
                suffix: spec.suffix.clone(),
            };
            let header = spec.header.as_literal().ok_or_else(regex_error)?;
            slots.push(Some(header.clone()));
            match &spec.footer {
                Some(footer) => {
                    let footer = footer.as_literal().ok_or_else(regex_error)?;
                    slots.push(Some(footer.clone()));
                }
                None => slots.push(None),
            }
        }
        Ok(Self { slots })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<&LiteralMatcher> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &LiteralMatcher)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|m| (i, m)))
    }
}

/// Something that can run the block match kernel.
pub trait BlockMatchDevice: Send + Sync {
    /// Returns one result list per block of `data`, in block order. Matches
    /// start inside their block but may extend into the following bytes.
    fn match_blocks(&self, data: &[u8], table: &PatternTable) -> Vec<BlockResults>;

    fn name(&self) -> &str;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HostDevice;

impl HostDevice {
    fn match_block(data: &[u8], block: usize, table: &PatternTable) -> BlockResults {
        let start = block * GPU_BLOCK_SIZE;
        let end = (start + GPU_BLOCK_SIZE).min(data.len());
        let mut results = BlockResults::default();

        for (index, matcher) in table.iter() {
            let len = matcher.len();
            for pos in start..end {
                if pos + len > data.len() {
                    break;
                }
                if !matcher.matches_at(&data[pos..pos + len]) {
                    continue;
                }
                if results.matches.len() < MAX_RESULTS_PER_BLOCK {
                    results.matches.push(BlockMatch {
                        pattern: index as u16,
                        offset: (pos - start) as u8,
                    });
                } else {
                    results.dropped += 1;
                }
            }
        }
        results
    }
}

impl BlockMatchDevice for HostDevice {
    fn match_blocks(&self, data: &[u8], table: &PatternTable) -> Vec<BlockResults> {
        let blocks = data.len().div_ceil(GPU_BLOCK_SIZE);
        (0..blocks)
            .into_par_iter()
            .map(|block| Self::match_block(data, block, table))
            .collect()
    }

    fn name(&self) -> &str {
        "host"
    }
}

pub struct GpuBatchScanner {
    table: PatternTable,
    device: Box<dyn BlockMatchDevice>,
    overflow: Arc<AtomicU64>,
    type_count: usize,
}

impl GpuBatchScanner {
    /// Fails when a rule uses a regular expression or the rule set does not
    /// fit in the device pattern table.
    pub fn new(specs: &SpecSet, device: Box<dyn BlockMatchDevice>) -> Result<Self> {
        let table = PatternTable::build(specs)?;
        debug!(patterns = table.len(), device = device.name(), "gpu pattern table built");
        Ok(Self {
            table,
            device,
            overflow: Arc::new(AtomicU64::new(0)),
            type_count: specs.len(),
        })
    }

    pub fn with_host_device(specs: &SpecSet) -> Result<Self> {
        Self::new(specs, Box::new(HostDevice))
    }

    /// Total matches dropped because a block's result list was full.
    pub fn overflow_count(&self) -> u64 {
        self.overflow.load(Ordering::Relaxed)
    }

    pub fn overflow_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.overflow)
    }
}

impl ChunkScanner for GpuBatchScanner {
    fn scan(&self, chunk: &Chunk) -> ChunkHits {
        let mut hits = ChunkHits::new(chunk.index, self.type_count);
        let results = self.device.match_blocks(&chunk.data, &self.table);

        let mut dropped = 0u64;
        for (block, block_results) in results.iter().enumerate() {
            dropped += u64::from(block_results.dropped);
            for m in &block_results.matches {
                let slot = usize::from(m.pattern);
                let Some(matcher) = self.table.get(slot) else {
                    continue;
                };
                let local = block * GPU_BLOCK_SIZE + usize::from(m.offset);
                let len = matcher.len();
                if !chunk.owns_start(local) {
                    continue;
                }
                let kind = if slot % 2 == 0 {
                    OffsetKind::Header
                } else {
                    OffsetKind::Footer
                };
                hits.push(slot / 2, kind, Occurrence::new(chunk.absolute(local), len));
            }
        }

        if dropped > 0 {
            self.overflow.fetch_add(dropped, Ordering::Relaxed);
            warn!(
                chunk = chunk.index,
                dropped,
                max = MAX_RESULTS_PER_BLOCK,
                "gpu block result list overflow, matches truncated"
            );
        }

        hits.sort();
        hits
    }

    fn name(&self) -> &'static str {
        "gpu"
    }
}

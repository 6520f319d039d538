//! Per-type header and footer offsets collected during the dig phase.

use serde::Serialize;
use tracing::debug;

use crate::error::{CoreError, Result};
use crate::scanners::ChunkHits;
use crate::spec::SpecSet;
use crate::types::{Occurrence, OffsetKind, OffsetRecord};

/// Rules applied while merging chunk results into the database.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergePolicy {
    /// Accept headers only at offsets that are a multiple of this block size.
    pub block_aligned: Option<u64>,
    /// Drop matches that start inside the previous accepted match of the
    /// same type and kind.
    pub no_search_overlap: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub accepted: usize,
    pub misaligned: usize,
    pub overlapping: usize,
}

#[derive(Debug, Clone, Default)]
pub struct TypeOffsets {
    headers: Vec<Occurrence>,
    footers: Vec<Occurrence>,
    last_header_end: Option<u64>,
    last_footer_end: Option<u64>,
}

impl TypeOffsets {
    pub fn headers(&self) -> &[Occurrence] {
        &self.headers
    }

    pub fn footers(&self) -> &[Occurrence] {
        &self.footers
    }

    fn list_mut(&mut self, kind: OffsetKind) -> (&mut Vec<Occurrence>, &mut Option<u64>) {
        match kind {
            OffsetKind::Header => (&mut self.headers, &mut self.last_header_end),
            OffsetKind::Footer => (&mut self.footers, &mut self.last_footer_end),
        }
    }
}

/// Offsets of one image, in discovery order. Cleared between images.
#[derive(Debug, Clone, Default)]
pub struct OffsetDatabase {
    types: Vec<TypeOffsets>,
}

impl OffsetDatabase {
    pub fn new(type_count: usize) -> Self {
        Self {
            types: vec![TypeOffsets::default(); type_count],
        }
    }

    #[inline]
    pub fn type_count(&self) -> usize {
        self.types.len()
    }

    pub fn get(&self, type_index: usize) -> Option<&TypeOffsets> {
        self.types.get(type_index)
    }

    pub fn header_count(&self) -> usize {
        self.types.iter().map(|t| t.headers.len()).sum()
    }

    pub fn footer_count(&self) -> usize {
        self.types.iter().map(|t| t.footers.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.header_count() == 0 && self.footer_count() == 0
    }

    pub fn clear(&mut self) {
        for t in &mut self.types {
            *t = TypeOffsets::default();
        }
    }

    /// Appends one record, growing the storage geometrically.
    pub fn push(&mut self, record: OffsetRecord) -> Result<()> {
        let occurrence = Occurrence {
            offset: record.offset,
            len: record.len,
        };
        let (list, last_end) = self.types[record.type_index].list_mut(record.kind);
        append(list, occurrence, record.type_index, record.kind)?;
        *last_end = Some(occurrence.end());
        Ok(())
    }

    /// Merges the results of one chunk. Chunks must be merged in image order
    /// for overlap suppression to see matches in the order they occur.
    pub fn merge_chunk(&mut self, hits: &ChunkHits, policy: MergePolicy) -> Result<MergeStats> {
        let mut stats = MergeStats::default();

        for (type_index, offsets) in self.types.iter_mut().enumerate() {
            for kind in [OffsetKind::Header, OffsetKind::Footer] {
                let found = match kind {
                    OffsetKind::Header => hits.headers.get(type_index),
                    OffsetKind::Footer => hits.footers.get(type_index),
                };
                let Some(found) = found else { continue };
                let (list, last_end) = offsets.list_mut(kind);

                for &occurrence in found {
                    let misaligned = policy
                        .block_aligned
                        .is_some_and(|block| occurrence.offset % block != 0);
                    if kind == OffsetKind::Header && misaligned {
                        stats.misaligned += 1;
                        continue;
                    }
                    if policy.no_search_overlap
                        && last_end.is_some_and(|end| occurrence.offset < end)
                    {
                        stats.overlapping += 1;
                        continue;
                    }
                    append(list, occurrence, type_index, kind)?;
                    *last_end = Some(occurrence.end());
                    stats.accepted += 1;
                }
            }
        }

        Ok(stats)
    }

    /// Drops footers that no header of the same type can reach. Returns the
    /// number of footers removed. Carving results are unaffected.
    pub fn prune_unreachable_footers(&mut self, specs: &SpecSet) -> usize {
        let mut removed = 0;

        for (offsets, spec) in self.types.iter_mut().zip(specs.iter()) {
            if offsets.footers.is_empty() {
                continue;
            }
            let mut header_offsets: Vec<u64> = offsets.headers.iter().map(|h| h.offset).collect();
            header_offsets.sort_unstable();

            let before = offsets.footers.len();
            offsets.footers.retain(|f| {
                let idx = header_offsets.partition_point(|&h| h < f.offset);
                idx > 0 && f.offset - header_offsets[idx - 1] <= spec.max_len
            });
            removed += before - offsets.footers.len();
        }

        if removed > 0 {
            debug!(removed, "pruned unreachable footers");
        }
        removed
    }

    /// Snapshot used for the header/footer database dump.
    pub fn dump(&self, specs: &SpecSet) -> DatabaseDump {
        let types = self
            .types
            .iter()
            .zip(specs.iter())
            .enumerate()
            .map(|(type_index, (offsets, spec))| TypeDump {
                type_index,
                suffix: spec.suffix.clone(),
                headers: offsets.headers.iter().map(|o| o.offset).collect(),
                footers: offsets.footers.iter().map(|o| o.offset).collect(),
            })
            .collect();
        DatabaseDump { types }
    }
}

fn append(
    list: &mut Vec<Occurrence>,
    occurrence: Occurrence,
    type_index: usize,
    kind: OffsetKind,
) -> Result<()> {
    if list.len() == list.capacity() {
        let additional = list.capacity().max(64);
        list.try_reserve(additional)
            .map_err(|_| CoreError::Allocation {
                type_index,
                kind,
                requested: list.len() + additional,
            })?;
    }
    list.push(occurrence);
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct TypeDump {
    pub type_index: usize,
    pub suffix: String,
    pub headers: Vec<u64>,
    pub footers: Vec<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseDump {
    pub types: Vec<TypeDump>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::SpecCompiler;

    fn hits(headers: &[u64], footers: &[u64], len: usize) -> ChunkHits {
        let mut h = ChunkHits::new(0, 1);
        for &o in headers {
            h.push(0, OffsetKind::Header, Occurrence::new(o, len));
        }
        for &o in footers {
            h.push(0, OffsetKind::Footer, Occurrence::new(o, len));
        }
        h
    }

    fn offsets(list: &[Occurrence]) -> Vec<u64> {
        list.iter().map(|o| o.offset).collect()
    }

    #[test]
    fn merge_without_policies_keeps_everything() {
        let mut db = OffsetDatabase::new(1);
        let stats = db
            .merge_chunk(&hits(&[0, 1, 700], &[900], 4), MergePolicy::default())
            .unwrap();
        assert_eq!(stats.accepted, 4);
        assert_eq!(db.header_count(), 3);
        assert_eq!(db.footer_count(), 1);
    }

    #[test]
    fn block_alignment_filters_headers_only() {
        let mut db = OffsetDatabase::new(1);
        let policy = MergePolicy {
            block_aligned: Some(512),
            no_search_overlap: false,
        };
        let stats = db
            .merge_chunk(&hits(&[0, 100, 1024], &[77], 2), policy)
            .unwrap();
        assert_eq!(stats.misaligned, 1);
        assert_eq!(offsets(db.get(0).unwrap().headers()), vec![0, 1024]);
        assert_eq!(offsets(db.get(0).unwrap().footers()), vec![77]);
    }

    #[test]
    fn overlap_suppression_is_leftmost_first() {
        let mut db = OffsetDatabase::new(1);
        let policy = MergePolicy {
            block_aligned: None,
            no_search_overlap: true,
        };
        db.merge_chunk(&hits(&[10, 12, 14, 30], &[], 4), policy)
            .unwrap();
        assert_eq!(offsets(db.get(0).unwrap().headers()), vec![10, 14, 30]);

        // State carries over to the next chunk.
        let stats = db.merge_chunk(&hits(&[32, 40], &[], 4), policy).unwrap();
        assert_eq!(stats.overlapping, 1);
        assert_eq!(offsets(db.get(0).unwrap().headers()), vec![10, 14, 30, 40]);
    }

    #[test]
    fn prune_keeps_reachable_footers() {
        let specs = SpecCompiler::new()
            .compile_str("t y 100 ab cd\n")
            .unwrap();
        let mut db = OffsetDatabase::new(1);
        db.merge_chunk(&hits(&[200], &[5, 250, 300, 301], 2), MergePolicy::default())
            .unwrap();
        let removed = db.prune_unreachable_footers(&specs);
        assert_eq!(removed, 2);
        assert_eq!(offsets(db.get(0).unwrap().footers()), vec![250, 300]);
    }

    #[test]
    fn clear_resets_state() {
        let mut db = OffsetDatabase::new(2);
        db.push(OffsetRecord {
            type_index: 1,
            offset: 9,
            kind: OffsetKind::Footer,
            len: 1,
        })
        .unwrap();
        assert!(!db.is_empty());
        db.clear();
        assert!(db.is_empty());
        assert_eq!(db.type_count(), 2);
    }

    #[test]
    fn dump_lists_offsets_per_type() {
        let specs = SpecCompiler::new()
            .compile_str("a y 100 ab cd\nb y 100 ef\n")
            .unwrap();
        let mut db = OffsetDatabase::new(2);
        db.merge_chunk(&hits(&[1], &[9], 2), MergePolicy::default())
            .unwrap();
        let dump = db.dump(&specs);
        assert_eq!(dump.types.len(), 2);
        assert_eq!(dump.types[0].suffix, "a");
        assert_eq!(dump.types[0].headers, vec![1]);
        assert_eq!(dump.types[0].footers, vec![9]);
        assert!(dump.types[1].headers.is_empty());
    }
}

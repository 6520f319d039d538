use std::sync::Arc;

use crate::spec::SpecSet;
use crate::traits::ChunkScanner;
use crate::types::{Chunk, Occurrence, OffsetKind, OffsetRecord};

/// Every header and footer occurrence one chunk owns, per type, in ascending
/// offset order. No carving policy has been applied yet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkHits {
    pub chunk_index: u64,
    pub headers: Vec<Vec<Occurrence>>,
    pub footers: Vec<Vec<Occurrence>>,
}

impl ChunkHits {
    pub fn new(chunk_index: u64, type_count: usize) -> Self {
        Self {
            chunk_index,
            headers: vec![Vec::new(); type_count],
            footers: vec![Vec::new(); type_count],
        }
    }

    #[inline]
    pub fn push(&mut self, type_index: usize, kind: OffsetKind, occurrence: Occurrence) {
        match kind {
            OffsetKind::Header => self.headers[type_index].push(occurrence),
            OffsetKind::Footer => self.footers[type_index].push(occurrence),
        }
    }

    pub fn sort(&mut self) {
        for list in self.headers.iter_mut().chain(self.footers.iter_mut()) {
            list.sort_unstable();
        }
    }

    pub fn total(&self) -> usize {
        self.headers
            .iter()
            .chain(self.footers.iter())
            .map(Vec::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Flattened view, all headers before all footers.
    pub fn records(&self) -> impl Iterator<Item = OffsetRecord> + '_ {
        flatten(&self.headers, OffsetKind::Header).chain(flatten(&self.footers, OffsetKind::Footer))
    }
}

fn flatten(lists: &[Vec<Occurrence>], kind: OffsetKind) -> impl Iterator<Item = OffsetRecord> + '_ {
    lists.iter().enumerate().flat_map(move |(type_index, list)| {
        list.iter().map(move |o| OffsetRecord {
            type_index,
            offset: o.offset,
            kind,
            len: o.len,
        })
    })
}

/// Runs every compiled matcher over a chunk on the calling thread.
#[derive(Debug, Clone)]
pub struct CpuScanner {
    specs: Arc<SpecSet>,
}

impl CpuScanner {
    #[must_use]
    pub fn new(specs: Arc<SpecSet>) -> Self {
        Self { specs }
    }
}

impl ChunkScanner for CpuScanner {
    fn scan(&self, chunk: &Chunk) -> ChunkHits {
        let mut hits = ChunkHits::new(chunk.index, self.specs.len());

        for (type_index, spec) in self.specs.iter().enumerate() {
            spec.header.for_each_match(&chunk.data, |start, len| {
                if chunk.owns_start(start) {
                    hits.push(
                        type_index,
                        OffsetKind::Header,
                        Occurrence::new(chunk.absolute(start), len),
                    );
                }
            });
            if let Some(footer) = &spec.footer {
                footer.for_each_match(&chunk.data, |start, len| {
                    if chunk.owns_start(start) {
                        hits.push(
                            type_index,
                            OffsetKind::Footer,
                            Occurrence::new(chunk.absolute(start), len),
                        );
                    }
                });
            }
        }

        hits
    }

    fn name(&self) -> &'static str {
        "cpu"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::SpecCompiler;

    fn scanner(conf: &str) -> CpuScanner {
        let specs = SpecCompiler::new().compile_str(conf).unwrap();
        CpuScanner::new(Arc::new(specs))
    }

    fn chunk(index: u64, base: u64, prefix_len: usize, tail_len: usize, data: &[u8]) -> Chunk {
        Chunk {
            index,
            base_offset: base,
            prefix_len,
            tail_len,
            data: data.to_vec(),
        }
    }

    #[test]
    fn reports_headers_and_footers_with_absolute_offsets() {
        let s = scanner("jpg y 1000 \\xff\\xd8 \\xff\\xd9\n");
        let data = [0u8, 0xFF, 0xD8, 0, 0, 0xFF, 0xD9];
        let hits = s.scan(&chunk(0, 4096, 0, 0, &data));
        assert_eq!(hits.headers[0], vec![Occurrence::new(4097, 2)]);
        assert_eq!(hits.footers[0], vec![Occurrence::new(4101, 2)]);
        assert_eq!(hits.total(), 2);
    }

    #[test]
    fn prefix_matches_are_owned() {
        let s = scanner("t y 1000 abc\n");
        // The first "abc" lies inside the 4 byte prefix.
        let data = b"abcxabcy";
        let hits = s.scan(&chunk(1, 100, 4, 0, data));
        assert_eq!(
            hits.headers[0],
            vec![Occurrence::new(100, 3), Occurrence::new(104, 3)]
        );
    }

    #[test]
    fn tail_matches_are_left_to_next_chunk() {
        let s = scanner("t y 1000 abcd\n");
        let data = b"zzabcdzz";
        let hits = s.scan(&chunk(1, 0, 0, 4, data));
        assert_eq!(hits.headers[0].len(), 1);
        let hits = s.scan(&chunk(1, 0, 0, 6, data));
        assert!(hits.is_empty());
    }

    #[test]
    fn greedy_regex_at_chunk_edge_is_reported_once() {
        let s = scanner("t y 1000 /ab*/\n");
        let overlap = s.specs.overlap();
        let mut image = vec![0u8; 600];
        image[510..520].copy_from_slice(b"abbbbbbbbb");

        let first = chunk(0, 0, 0, overlap, &image[..512]);
        let base = 512 - overlap;
        let second = chunk(1, base as u64, overlap, 0, &image[base..]);

        let mut found: Vec<Occurrence> = s.scan(&first).headers[0].clone();
        found.extend(s.scan(&second).headers[0].iter().copied());
        assert_eq!(found, vec![Occurrence::new(510, 10)]);
    }

    #[test]
    fn records_flatten_in_type_order() {
        let s = scanner("a y 100 xy\nb y 100 yz\n");
        let hits = s.scan(&chunk(0, 0, 0, 0, b"xyz"));
        let records: Vec<_> = hits.records().collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].type_index, 0);
        assert_eq!(records[1].type_index, 1);
        assert_eq!(records[1].offset, 1);
        assert!(records.iter().all(OffsetRecord::is_header));
    }
}

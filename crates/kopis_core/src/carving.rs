//! Header/footer pairing.
//!
//! [`plan_carves`] turns the offsets of one image into an ordered list of
//! [`CarveTask`]s. Every header is paired independently:
//!
//! * `FORWARD` takes the first footer after the header whose resulting
//!   length (footer included) lies in `[min_len, max_len]`.
//! * `NEXT` does the same but stops before the footer.
//! * `REVERSE` takes the farthest such footer inside the header's window.
//! * With embedded handling, `FORWARD` and `NEXT` skip footers that close
//!   headers nested between the header and the footer.
//! * A header left without a footer is carved as `max_len` bytes only when
//!   missing footers are tolerated. Rules without a footer pattern always
//!   carve `max_len` bytes.

use serde::Serialize;

use crate::database::OffsetDatabase;
use crate::spec::{PatternSpec, SearchDirection, SpecSet};
use crate::types::Occurrence;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CarvePolicy {
    pub carve_missing_footers: bool,
    pub handle_embedded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CarveExtent {
    /// Ends at an exclusive absolute offset.
    Bounded { end: u64 },
    /// Runs for `max_len` bytes or to the end of the image.
    Open { max_len: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CarveTask {
    pub type_index: usize,
    pub start: u64,
    pub extent: CarveExtent,
    pub suffix: String,
    /// Set when the file was cut at `max_len` instead of ending at a footer.
    pub chopped: bool,
}

impl CarveTask {
    /// Byte count the task covers in an image of `image_len` bytes, or
    /// without clamping when the image length is unknown.
    pub fn length(&self, image_len: Option<u64>) -> u64 {
        let end = match self.extent {
            CarveExtent::Bounded { end } => end,
            CarveExtent::Open { max_len } => self.start.saturating_add(max_len),
        };
        let end = image_len.map_or(end, |len| end.min(len));
        end.saturating_sub(self.start)
    }
}

/// Plans every carve for one image, ordered by start offset then type.
pub fn plan_carves(db: &OffsetDatabase, specs: &SpecSet, policy: CarvePolicy) -> Vec<CarveTask> {
    let mut tasks = Vec::new();

    for (type_index, spec) in specs.iter().enumerate() {
        let Some(offsets) = db.get(type_index) else {
            continue;
        };
        let mut headers = offsets.headers().to_vec();
        headers.sort_unstable();
        headers.dedup_by_key(|h| h.offset);
        let mut footers = offsets.footers().to_vec();
        footers.sort_unstable();

        for header in &headers {
            if let Some(task) = pair_header(type_index, spec, header, &headers, &footers, policy) {
                tasks.push(task);
            }
        }
    }

    tasks.sort_by_key(|t| (t.start, t.type_index));
    tasks
}

fn pair_header(
    type_index: usize,
    spec: &PatternSpec,
    header: &Occurrence,
    headers: &[Occurrence],
    footers: &[Occurrence],
    policy: CarvePolicy,
) -> Option<CarveTask> {
    let task = |extent, chopped| CarveTask {
        type_index,
        start: header.offset,
        extent,
        suffix: spec.suffix.clone(),
        chopped,
    };

    if !spec.has_footer() {
        return Some(task(
            CarveExtent::Open {
                max_len: spec.max_len,
            },
            false,
        ));
    }

    let end = match spec.direction {
        SearchDirection::Forward | SearchDirection::Next if policy.handle_embedded => {
            nested_forward(spec, header, headers, footers)
        }
        SearchDirection::Forward | SearchDirection::Next => first_forward(spec, header, footers),
        SearchDirection::Reverse => farthest_reverse(spec, header, footers),
    };

    match end {
        Some(end) => Some(task(CarveExtent::Bounded { end }, false)),
        None if policy.carve_missing_footers => Some(task(
            CarveExtent::Open {
                max_len: spec.max_len,
            },
            true,
        )),
        None => None,
    }
}

/// End of the file if `footer` closes `header`.
#[inline]
fn carve_end(spec: &PatternSpec, footer: &Occurrence) -> u64 {
    if spec.direction.includes_footer() {
        footer.end()
    } else {
        footer.offset
    }
}

#[inline]
fn in_range(spec: &PatternSpec, len: u64) -> bool {
    len >= spec.min_len && len <= spec.max_len
}

/// Occurrences starting after `header` and no more than `max_len` bytes past
/// it. `sorted` must be in offset order.
fn window<'a>(spec: &PatternSpec, header: &Occurrence, sorted: &'a [Occurrence]) -> &'a [Occurrence] {
    let limit = header.offset.saturating_add(spec.max_len);
    let first = sorted.partition_point(|o| o.offset <= header.offset);
    let last = sorted.partition_point(|o| o.offset <= limit);
    &sorted[first..last.max(first)]
}

fn first_forward(spec: &PatternSpec, header: &Occurrence, footers: &[Occurrence]) -> Option<u64> {
    window(spec, header, footers)
        .iter()
        .map(|f| carve_end(spec, f))
        .find(|&end| in_range(spec, end - header.offset))
}

fn farthest_reverse(
    spec: &PatternSpec,
    header: &Occurrence,
    footers: &[Occurrence],
) -> Option<u64> {
    window(spec, header, footers)
        .iter()
        .rev()
        .map(|f| carve_end(spec, f))
        .find(|&end| in_range(spec, end - header.offset))
}

/// Walks headers and footers in offset order; every later header opens a
/// nesting level that the next footer closes.
fn nested_forward(
    spec: &PatternSpec,
    header: &Occurrence,
    headers: &[Occurrence],
    footers: &[Occurrence],
) -> Option<u64> {
    let inner = window(spec, header, headers);
    let mut opened = 0usize;
    let mut depth = 0usize;

    for footer in window(spec, header, footers) {
        let before = opened + inner[opened..].partition_point(|h| h.offset < footer.offset);
        depth += before - opened;
        opened = before;
        if depth > 0 {
            depth -= 1;
            continue;
        }
        let end = carve_end(spec, footer);
        if in_range(spec, end - header.offset) {
            return Some(end);
        }
    }
    None
}

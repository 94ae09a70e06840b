//! Byte-range primitives for chunked package streaming.
//!
//! A [`ChunkRange`] is a half-open `[start, end)` interval of bytes within a
//! single package. Ranges are the unit of fetch, cache storage, and request
//! deduplication. A [`ResidencySet`] is the per-package ordered set of
//! disjoint ranges known to be locally available; it merges adjacent and
//! overlapping ranges on insert so the stored spans never touch.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// ChunkRange
// ============================================================================

/// Half-open byte interval `[start, end)` within a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkRange {
    /// First byte covered by the range.
    pub start: u64,
    /// One past the last byte covered by the range.
    pub end: u64,
}

impl ChunkRange {
    /// Creates a range from explicit bounds.
    ///
    /// An empty range (`start == end`) is permitted; callers filter empties
    /// before fetch or insert.
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end, "inverted range [{start}, {end})");
        Self { start, end }
    }

    /// Creates a range from an offset and a length.
    pub fn at(offset: u64, length: u64) -> Self {
        Self::new(offset, offset + length)
    }

    /// Number of bytes covered.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// True when the range covers no bytes.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// True when `offset` falls inside the range.
    pub fn contains_offset(&self, offset: u64) -> bool {
        offset >= self.start && offset < self.end
    }

    /// True when `other` is entirely inside this range.
    pub fn contains(&self, other: &ChunkRange) -> bool {
        other.start >= self.start && other.end <= self.end
    }

    /// True when the two ranges share at least one byte.
    pub fn intersects(&self, other: &ChunkRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// The shared bytes of two ranges, if any.
    pub fn intersection(&self, other: &ChunkRange) -> Option<ChunkRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        if start < end {
            Some(ChunkRange { start, end })
        } else {
            None
        }
    }

    /// True when the ranges overlap or touch end-to-start.
    ///
    /// Touching ranges (`[0,5)` and `[5,9)`) carry no shared bytes but merge
    /// into one contiguous span.
    pub fn mergeable(&self, other: &ChunkRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Smallest range covering both inputs.
    ///
    /// Only meaningful when [`mergeable`](Self::mergeable) holds; merging
    /// disjoint ranges would claim bytes neither input covers.
    pub fn merge(&self, other: &ChunkRange) -> ChunkRange {
        debug_assert!(self.mergeable(other), "merging disjoint ranges {self} and {other}");
        ChunkRange {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

impl fmt::Display for ChunkRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

// ============================================================================
// ResidencySet
// ============================================================================

/// Ordered set of disjoint, non-touching byte ranges for one package.
///
/// Inserts merge any adjacent or overlapping spans, so at rest every pair of
/// stored spans has a gap between them. The set only shrinks through
/// [`remove`](Self::remove) (whole-span eviction) or [`clear`](Self::clear)
/// (package invalidation).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResidencySet {
    /// Span start → span end. Keys are disjoint and non-adjacent.
    spans: BTreeMap<u64, u64>,
}

impl ResidencySet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a set from arbitrary ranges, merging as needed.
    pub fn from_ranges<I: IntoIterator<Item = ChunkRange>>(ranges: I) -> Self {
        let mut set = Self::new();
        for range in ranges {
            set.insert(range);
        }
        set
    }

    /// Inserts a range, merging it with any span it overlaps or touches.
    ///
    /// Returns the merged span now covering the inserted bytes. Empty ranges
    /// are ignored and reported as-is.
    pub fn insert(&mut self, range: ChunkRange) -> ChunkRange {
        if range.is_empty() {
            return range;
        }

        let mut merged = range;
        let mut absorbed = Vec::new();
        // Any span starting at or before the new end can touch it; spans
        // starting later cannot.
        for (&start, &end) in self.spans.range(..=range.end) {
            if end >= range.start {
                absorbed.push(start);
                merged.start = merged.start.min(start);
                merged.end = merged.end.max(end);
            }
        }
        for start in absorbed {
            self.spans.remove(&start);
        }
        self.spans.insert(merged.start, merged.end);
        merged
    }

    /// Removes a span that exactly matches `range`.
    ///
    /// Eviction operates on whole cached ranges, which map one-to-one onto
    /// spans, so partial removal is not supported. Returns whether a span was
    /// removed.
    pub fn remove(&mut self, range: &ChunkRange) -> bool {
        match self.spans.get(&range.start) {
            Some(&end) if end == range.end => {
                self.spans.remove(&range.start);
                true
            }
            _ => false,
        }
    }

    /// Drops all spans.
    pub fn clear(&mut self) {
        self.spans.clear();
    }

    /// True when every byte of `range` is covered by a single span.
    ///
    /// Spans never touch, so coverage by multiple spans is impossible.
    pub fn covers(&self, range: &ChunkRange) -> bool {
        if range.is_empty() {
            return true;
        }
        self.spans
            .range(..=range.start)
            .next_back()
            .is_some_and(|(_, &end)| end >= range.end)
    }

    /// The sub-ranges of `range` not covered by any span, in ascending order.
    pub fn missing_within(&self, range: &ChunkRange) -> Vec<ChunkRange> {
        let mut missing = Vec::new();
        if range.is_empty() {
            return missing;
        }

        let mut cursor = range.start;
        // Start from the span at or before the cursor, if it reaches into
        // the queried range.
        let overlapping = self
            .spans
            .range(..range.end)
            .filter(|(_, &end)| end > range.start);
        for (&start, &end) in overlapping {
            if start > cursor {
                missing.push(ChunkRange::new(cursor, start.min(range.end)));
            }
            cursor = cursor.max(end);
            if cursor >= range.end {
                break;
            }
        }
        if cursor < range.end {
            missing.push(ChunkRange::new(cursor, range.end));
        }
        missing
    }

    /// The span covering `offset`, if any.
    pub fn span_at(&self, offset: u64) -> Option<ChunkRange> {
        self.spans
            .range(..=offset)
            .next_back()
            .filter(|(_, &end)| end > offset)
            .map(|(&start, &end)| ChunkRange::new(start, end))
    }

    /// All spans in ascending order.
    pub fn ranges(&self) -> Vec<ChunkRange> {
        self.spans
            .iter()
            .map(|(&start, &end)| ChunkRange::new(start, end))
            .collect()
    }

    /// Total bytes covered across all spans.
    pub fn resident_bytes(&self) -> u64 {
        self.spans.iter().map(|(start, end)| end - start).sum()
    }

    /// Number of disjoint spans.
    pub fn span_count(&self) -> usize {
        self.spans.len()
    }

    /// True when no bytes are resident.
    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }
}

impl fmt::Display for ResidencySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (start, end)) in self.spans.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "[{start}, {end})")?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(start: u64, end: u64) -> ChunkRange {
        ChunkRange::new(start, end)
    }

    #[test]
    fn test_range_basic_accessors() {
        let range = ChunkRange::at(100, 50);
        assert_eq!(range.start, 100);
        assert_eq!(range.end, 150);
        assert_eq!(range.len(), 50);
        assert!(!range.is_empty());
        assert!(range.contains_offset(100));
        assert!(range.contains_offset(149));
        assert!(!range.contains_offset(150));
    }

    #[test]
    fn test_range_intersection() {
        assert_eq!(r(0, 500).intersection(&r(400, 700)), Some(r(400, 500)));
        assert_eq!(r(0, 500).intersection(&r(500, 700)), None);
        assert_eq!(r(0, 500).intersection(&r(600, 700)), None);
        assert_eq!(r(200, 300).intersection(&r(0, 1000)), Some(r(200, 300)));
    }

    #[test]
    fn test_range_containment() {
        assert!(r(0, 500).contains(&r(200, 300)));
        assert!(r(0, 500).contains(&r(0, 500)));
        assert!(!r(0, 500).contains(&r(400, 501)));
    }

    #[test]
    fn test_touching_ranges_merge_but_do_not_intersect() {
        let left = r(0, 5);
        let right = r(5, 9);
        assert!(!left.intersects(&right));
        assert!(left.mergeable(&right));
        assert_eq!(left.merge(&right), r(0, 9));
    }

    #[test]
    fn test_range_display() {
        assert_eq!(r(0, 500).to_string(), "[0, 500)");
    }

    #[test]
    fn test_residency_insert_disjoint() {
        let mut set = ResidencySet::new();
        set.insert(r(0, 100));
        set.insert(r(200, 300));
        assert_eq!(set.ranges(), vec![r(0, 100), r(200, 300)]);
        assert_eq!(set.resident_bytes(), 200);
        assert_eq!(set.span_count(), 2);
    }

    #[test]
    fn test_residency_insert_merges_adjacent() {
        let mut set = ResidencySet::new();
        set.insert(r(0, 500));
        let merged = set.insert(r(500, 700));
        assert_eq!(merged, r(0, 700));
        assert_eq!(set.ranges(), vec![r(0, 700)]);
    }

    #[test]
    fn test_residency_insert_merges_overlapping() {
        let mut set = ResidencySet::new();
        set.insert(r(0, 500));
        let merged = set.insert(r(400, 700));
        assert_eq!(merged, r(0, 700));
        assert_eq!(set.ranges(), vec![r(0, 700)]);
    }

    #[test]
    fn test_residency_insert_bridges_multiple_spans() {
        let mut set = ResidencySet::new();
        set.insert(r(0, 100));
        set.insert(r(200, 300));
        set.insert(r(400, 500));
        // Covers the gaps between all three.
        let merged = set.insert(r(50, 450));
        assert_eq!(merged, r(0, 500));
        assert_eq!(set.ranges(), vec![r(0, 500)]);
    }

    #[test]
    fn test_residency_insert_contained_is_absorbed() {
        let mut set = ResidencySet::new();
        set.insert(r(0, 1000));
        let merged = set.insert(r(200, 300));
        assert_eq!(merged, r(0, 1000));
        assert_eq!(set.span_count(), 1);
    }

    #[test]
    fn test_residency_empty_insert_ignored() {
        let mut set = ResidencySet::new();
        set.insert(r(100, 100));
        assert!(set.is_empty());
    }

    #[test]
    fn test_residency_covers() {
        let mut set = ResidencySet::new();
        set.insert(r(0, 500));
        assert!(set.covers(&r(0, 500)));
        assert!(set.covers(&r(200, 300)));
        assert!(!set.covers(&r(400, 501)));
        assert!(!set.covers(&r(600, 700)));
        // Empty request is trivially covered.
        assert!(set.covers(&r(900, 900)));
    }

    #[test]
    fn test_residency_missing_within_empty_set() {
        let set = ResidencySet::new();
        assert_eq!(set.missing_within(&r(0, 500)), vec![r(0, 500)]);
    }

    #[test]
    fn test_residency_missing_within_partial_overlap() {
        let mut set = ResidencySet::new();
        set.insert(r(0, 500));
        // Only the tail is missing.
        assert_eq!(set.missing_within(&r(400, 700)), vec![r(500, 700)]);
    }

    #[test]
    fn test_residency_missing_within_gap_between_spans() {
        let mut set = ResidencySet::new();
        set.insert(r(0, 100));
        set.insert(r(200, 300));
        assert_eq!(
            set.missing_within(&r(50, 250)),
            vec![r(100, 200)],
        );
        assert_eq!(
            set.missing_within(&r(0, 400)),
            vec![r(100, 200), r(300, 400)],
        );
    }

    #[test]
    fn test_residency_missing_within_fully_covered() {
        let mut set = ResidencySet::new();
        set.insert(r(0, 500));
        assert!(set.missing_within(&r(100, 400)).is_empty());
    }

    #[test]
    fn test_residency_remove_exact_span_only() {
        let mut set = ResidencySet::new();
        set.insert(r(0, 100));
        set.insert(r(200, 300));
        assert!(set.remove(&r(0, 100)));
        // Partial or stale ranges are rejected.
        assert!(!set.remove(&r(200, 250)));
        assert!(!set.remove(&r(0, 100)));
        assert_eq!(set.ranges(), vec![r(200, 300)]);
    }

    #[test]
    fn test_residency_span_at() {
        let mut set = ResidencySet::new();
        set.insert(r(100, 200));
        assert_eq!(set.span_at(100), Some(r(100, 200)));
        assert_eq!(set.span_at(199), Some(r(100, 200)));
        assert_eq!(set.span_at(200), None);
        assert_eq!(set.span_at(0), None);
    }

    #[test]
    fn test_residency_display() {
        let mut set = ResidencySet::new();
        set.insert(r(0, 100));
        set.insert(r(200, 300));
        assert_eq!(set.to_string(), "{[0, 100), [200, 300)}");
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        fn arb_range() -> impl Strategy<Value = ChunkRange> {
            (0u64..10_000, 1u64..500).prop_map(|(start, len)| ChunkRange::at(start, len))
        }

        proptest! {
            #[test]
            fn test_spans_stay_disjoint_and_sorted(ranges in prop::collection::vec(arb_range(), 0..40)) {
                let set = ResidencySet::from_ranges(ranges);
                let spans = set.ranges();
                for pair in spans.windows(2) {
                    // Strictly increasing with a gap: touching spans must
                    // have been merged on insert.
                    prop_assert!(pair[0].end < pair[1].start,
                        "spans {} and {} touch or overlap", pair[0], pair[1]);
                }
            }

            #[test]
            fn test_inserted_bytes_are_covered(ranges in prop::collection::vec(arb_range(), 1..40)) {
                let set = ResidencySet::from_ranges(ranges.clone());
                for range in &ranges {
                    prop_assert!(set.covers(range), "{} not covered by {}", range, set);
                }
            }

            #[test]
            fn test_missing_plus_resident_partition_request(
                ranges in prop::collection::vec(arb_range(), 0..20),
                request in arb_range(),
            ) {
                let set = ResidencySet::from_ranges(ranges);
                let missing = set.missing_within(&request);

                // Missing sub-ranges are ascending, disjoint, and inside the request.
                for pair in missing.windows(2) {
                    prop_assert!(pair[0].end <= pair[1].start);
                }
                for gap in &missing {
                    prop_assert!(request.contains(gap));
                    prop_assert!(!gap.is_empty());
                }

                // Every byte of the request is either resident or reported missing.
                let missing_bytes: u64 = missing.iter().map(|g| g.len()).sum();
                let resident_bytes: u64 = set
                    .ranges()
                    .iter()
                    .filter_map(|span| span.intersection(&request))
                    .map(|overlap| overlap.len())
                    .sum();
                prop_assert_eq!(missing_bytes + resident_bytes, request.len());
            }

            #[test]
            fn test_insert_is_monotonic(
                initial in prop::collection::vec(arb_range(), 0..20),
                extra in arb_range(),
            ) {
                let mut set = ResidencySet::from_ranges(initial);
                let before = set.resident_bytes();
                set.insert(extra);
                prop_assert!(set.resident_bytes() >= before);
                prop_assert!(set.covers(&extra));
            }

            #[test]
            fn test_resident_bytes_matches_span_sum(ranges in prop::collection::vec(arb_range(), 0..30)) {
                let set = ResidencySet::from_ranges(ranges);
                let sum: u64 = set.ranges().iter().map(|span| span.len()).sum();
                prop_assert_eq!(set.resident_bytes(), sum);
            }
        }
    }
}

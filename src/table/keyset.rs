use crate::types::KeyRange;

/// Ranges held by one transaction in one shard.
///
/// Small sets keep every acquired range verbatim. Once a set grows past the
/// fixed slice limit its ranges are coalesced into sorted disjoint intervals:
/// membership answers stay exact, but the individual acquisitions are gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum KeySet {
    Fixed(Vec<KeyRange>),
    Coalesced(Vec<KeyRange>),
}

impl Default for KeySet {
    fn default() -> Self {
        KeySet::Fixed(Vec::new())
    }
}

impl KeySet {
    pub(crate) fn insert(&mut self, range: KeyRange, max_fixed_slice_size: usize) {
        match self {
            KeySet::Fixed(ranges) => {
                let pos = ranges.partition_point(|r| r.start < range.start);
                if ranges[pos..].iter().take_while(|r| r.start == range.start).any(|r| *r == range) {
                    return;
                }
                ranges.insert(pos, range);
                if ranges.len() > max_fixed_slice_size {
                    *self = KeySet::Coalesced(coalesce(std::mem::take(ranges)));
                }
            }
            KeySet::Coalesced(intervals) => {
                let pos = intervals.partition_point(|r| r.start < range.start);
                intervals.insert(pos, range);
                *intervals = coalesce(std::mem::take(intervals));
            }
        }
    }

    pub(crate) fn contains(&self, key: &[u8]) -> bool {
        match self {
            KeySet::Fixed(ranges) => ranges.iter().any(|r| r.contains(key)),
            KeySet::Coalesced(intervals) => {
                let pos = intervals.partition_point(|r| &r.start[..] <= key);
                pos > 0 && intervals[pos - 1].contains(key)
            }
        }
    }

    pub(crate) fn overlaps(&self, range: &KeyRange) -> bool {
        match self {
            KeySet::Fixed(ranges) => ranges.iter().any(|r| r.overlaps(range)),
            KeySet::Coalesced(intervals) => {
                // first interval that does not end before the range starts
                let pos = intervals.partition_point(|r| r.end < range.start);
                intervals.get(pos).map_or(false, |r| r.overlaps(range))
            }
        }
    }

    /// Explicit ranges of this set that fall inside `range`, clipped to it.
    pub(crate) fn split(&self, range: &KeyRange) -> KeySet {
        let ranges = match self {
            KeySet::Fixed(ranges) | KeySet::Coalesced(ranges) => ranges,
        };
        let mut clipped: Vec<KeyRange> = ranges
            .iter()
            .filter_map(|r| r.intersection(range))
            .collect();
        clipped.sort_by(|a, b| a.start.cmp(&b.start));
        clipped.dedup();
        KeySet::Fixed(clipped)
    }

    /// Whether every key of `range` is in the set.
    pub(crate) fn covers(&self, range: &KeyRange) -> bool {
        let clipped = coalesce(self.split(range).ranges().to_vec());
        clipped.len() == 1 && clipped[0] == *range
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            KeySet::Fixed(ranges) | KeySet::Coalesced(ranges) => ranges.len(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn is_coalesced(&self) -> bool {
        matches!(self, KeySet::Coalesced(_))
    }

    pub(crate) fn ranges(&self) -> &[KeyRange] {
        match self {
            KeySet::Fixed(ranges) | KeySet::Coalesced(ranges) => ranges,
        }
    }
}

fn coalesce(mut ranges: Vec<KeyRange>) -> Vec<KeyRange> {
    ranges.sort_by(|a, b| a.start.cmp(&b.start));
    let mut merged: Vec<KeyRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(last) if range.start <= last.end => {
                if range.end > last.end {
                    last.end = range.end;
                }
            }
            _ => merged.push(range),
        }
    }
    merged
}

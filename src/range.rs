//! Byte ranges already present on disk and `Range` request header parsing.

use crate::error::ProxyError;

/// Inclusive byte range `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskRange {
    pub start: u64,
    pub end: u64,
}

impl DiskRange {
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end, "inverted range {start}-{end}");
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn contains(&self, other: &DiskRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// How a cached range relates to a requested one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overlap {
    /// The cached range covers the start of the request but ends inside it.
    Left,
    /// The cached range starts inside the request and covers its end.
    Right,
    /// The cached range lies strictly inside the request.
    Mixed,
    None,
}

/// Sorted, non-overlapping, non-adjacent ranges of a file that are on disk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeList {
    ranges: Vec<DiskRange>,
}

impl RangeList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ranges(&self) -> &[DiskRange] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.ranges.iter().map(DiskRange::len).sum()
    }

    /// Records `range` as present, merging it with any range it overlaps or touches.
    pub fn insert(&mut self, range: DiskRange) {
        let at = self.ranges.partition_point(|r| r.start < range.start);
        self.ranges.insert(at, range);

        // Only the predecessor can reach into the new range from the left.
        let mut merged_at = at;
        if at > 0 && self.ranges[at - 1].end.saturating_add(1) >= range.start {
            merged_at = at - 1;
            let end = self.ranges[at - 1].end.max(range.end);
            self.ranges[merged_at].end = end;
            self.ranges.remove(at);
        }

        while merged_at + 1 < self.ranges.len() {
            let next = self.ranges[merged_at + 1];
            if self.ranges[merged_at].end.saturating_add(1) < next.start {
                break;
            }
            self.ranges[merged_at].end = self.ranges[merged_at].end.max(next.end);
            self.ranges.remove(merged_at + 1);
        }

        debug_assert!(self.is_normalized(), "range list not normalized: {:?}", self.ranges);
    }

    pub fn contains(&self, range: &DiskRange) -> bool {
        self.find(range).is_some()
    }

    /// The stored range fully containing `range`.
    pub fn find(&self, range: &DiskRange) -> Option<DiskRange> {
        let at = self.ranges.partition_point(|r| r.start <= range.start);
        if at == 0 {
            return None;
        }
        let candidate = self.ranges[at - 1];
        candidate.contains(range).then_some(candidate)
    }

    /// First stored range that intersects `range`, together with how it intersects.
    ///
    /// A stored range that fully covers the request is reported as [`Overlap::Left`].
    pub fn overlap(&self, range: &DiskRange) -> (Overlap, Option<DiskRange>) {
        for disk in &self.ranges {
            let kind = overlap_of(disk, range);
            if kind != Overlap::None {
                return (kind, Some(*disk));
            }
        }
        (Overlap::None, None)
    }

    fn is_normalized(&self) -> bool {
        self.ranges
            .windows(2)
            .all(|pair| pair[0].end.saturating_add(1) < pair[1].start)
            && self.ranges.iter().all(|r| r.start <= r.end)
    }
}

pub fn overlap_of(disk: &DiskRange, range: &DiskRange) -> Overlap {
    if disk.end < range.start || range.end < disk.start {
        return Overlap::None;
    }
    if disk.start <= range.start {
        return Overlap::Left;
    }
    if disk.end >= range.end {
        return Overlap::Right;
    }
    Overlap::Mixed
}

/// Parses a `Range` request header against a resource of `length` bytes.
///
/// Only the first range of a multi-range request is honoured. An open end runs
/// to the last byte and `bytes=-N` selects the final `N` bytes.
pub fn parse_range_header(header: &str, length: u64) -> Result<DiskRange, ProxyError> {
    let spec = header
        .trim()
        .strip_prefix("bytes=")
        .ok_or_else(|| ProxyError::bad_request(format!("unsupported range unit in `{header}`")))?;
    let first = spec.split(',').next().unwrap_or_default().trim();
    let (start, end) = first
        .split_once('-')
        .ok_or_else(|| ProxyError::bad_request(format!("malformed range `{first}`")))?;

    if length == 0 {
        return Err(ProxyError::RangeNotSatisfiable { length });
    }

    let parse = |value: &str| {
        value
            .trim()
            .parse::<u64>()
            .map_err(|_| ProxyError::bad_request(format!("malformed range `{first}`")))
    };

    let range = match (start.trim().is_empty(), end.trim().is_empty()) {
        (true, true) => return Err(ProxyError::bad_request("empty range")),
        (true, false) => {
            let suffix = parse(end)?;
            if suffix == 0 {
                return Err(ProxyError::RangeNotSatisfiable { length });
            }
            DiskRange::new(length.saturating_sub(suffix), length - 1)
        }
        (false, true) => {
            let start = parse(start)?;
            if start >= length {
                return Err(ProxyError::RangeNotSatisfiable { length });
            }
            DiskRange::new(start, length - 1)
        }
        (false, false) => {
            let (start, end) = (parse(start)?, parse(end)?);
            if start > end {
                return Err(ProxyError::bad_request(format!("inverted range `{first}`")));
            }
            if start >= length {
                return Err(ProxyError::RangeNotSatisfiable { length });
            }
            DiskRange::new(start, end.min(length - 1))
        }
    };
    Ok(range)
}

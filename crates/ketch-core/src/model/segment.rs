use serde::{Deserialize, Serialize};

/// A contiguous byte range of the destination file, downloaded
/// independently. `end` is inclusive; `end == start - 1` denotes an empty
/// segment (used for zero-byte files and the `-1` unknown-length marker).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub index: usize,
    pub start: i64,
    pub end: i64,
    pub downloaded_bytes: i64,
}

impl Segment {
    pub fn new(index: usize, start: i64, end: i64) -> Self {
        Self { index, start, end, downloaded_bytes: 0 }
    }

    /// `end - start + 1`, or `0` for the unknown-length marker (`end == -1`
    /// with `start == 0`).
    pub fn len(&self) -> i64 {
        if self.end < self.start {
            0
        } else {
            self.end - self.start + 1
        }
    }

    pub fn is_complete(&self) -> bool {
        self.downloaded_bytes == self.len()
    }

    /// `Range: bytes=start+downloaded-end`, per §4.2.
    pub fn range_header_value(&self) -> String {
        format!("bytes={}-{}", self.start + self.downloaded_bytes, self.end)
    }

    pub fn remaining(&self) -> i64 {
        self.len() - self.downloaded_bytes
    }
}

/// Pairwise-disjoint, index-ordered segments whose union covers
/// `[0, total_bytes - 1]` for a known-length download.
pub fn segments_cover(segments: &[Segment], total_bytes: i64) -> bool {
    if total_bytes < 0 {
        return true;
    }
    if total_bytes == 0 {
        return segments.len() == 1 && segments[0].len() == 0;
    }
    let mut sorted: Vec<&Segment> = segments.iter().collect();
    sorted.sort_by_key(|s| s.start);
    let mut expected_start = 0i64;
    for seg in sorted {
        if seg.start != expected_start {
            return false;
        }
        expected_start = seg.end + 1;
    }
    expected_start == total_bytes
}

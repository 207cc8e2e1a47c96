//! RangeString - run-length set of message numbers
//!
//! Tracks which message numbers a sequence has received (receiving side) or
//! had acknowledged by the peer (sending side).
//!
//! ```text
//! add(1) add(2) add(3)      add(7)          add_range(5, 6)
//!     [1-3]        ──→    [1-3][7-7]    ──→    [1-3][5-7]
//! ```
//!
//! ## Invariants
//!
//! - Intervals are sorted by `lower`
//! - Intervals never overlap and are never adjacent (adjacent inserts merge)
//!
//! Serialized form is `"lo-hi,lo-hi,..."`; the empty set is the empty string.

use serde::{Deserialize, Serialize};
use serde_with::{DeserializeFromStr, SerializeDisplay};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Closed interval `[lower, upper]` of message numbers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageRange {
    pub lower: u64,
    pub upper: u64,
}

impl MessageRange {
    /// Build a range, rejecting `lower > upper`.
    pub fn new(lower: u64, upper: u64) -> Result<Self, RangeParseError> {
        if lower > upper {
            return Err(RangeParseError::Inverted { lower, upper });
        }
        Ok(Self { lower, upper })
    }

    pub fn single(value: u64) -> Self {
        Self {
            lower: value,
            upper: value,
        }
    }

    pub fn contains(&self, value: u64) -> bool {
        self.lower <= value && value <= self.upper
    }

    /// Number of values in the interval.
    pub fn len(&self) -> u64 {
        self.upper - self.lower + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

impl fmt::Display for MessageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.lower, self.upper)
    }
}

/// Errors parsing the `"lo-hi,lo-hi"` form.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RangeParseError {
    #[error("Malformed range segment '{segment}'")]
    Malformed { segment: String },

    #[error("Inverted range: lower {lower} > upper {upper}")]
    Inverted { lower: u64, upper: u64 },
}

/// Ordered set of disjoint, non-adjacent message-number intervals.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, SerializeDisplay, DeserializeFromStr)]
pub struct RangeString {
    ranges: Vec<MessageRange>,
}

impl RangeString {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set holding exactly `[lower, upper]`.
    pub fn from_range(lower: u64, upper: u64) -> Self {
        let mut set = Self::new();
        set.add_range(lower, upper);
        set
    }

    /// Insert a single value.
    pub fn add(&mut self, value: u64) {
        self.add_range(value, value);
    }

    /// Insert `[lower, upper]`, merging every interval it overlaps or touches.
    ///
    /// An inverted interval is empty and adds nothing.
    pub fn add_range(&mut self, lower: u64, upper: u64) {
        if lower > upper {
            return;
        }
        let mut merged = MessageRange { lower, upper };

        // First interval that overlaps or is adjacent to `lower`
        let start = self
            .ranges
            .partition_point(|r| r.upper.saturating_add(1) < lower);
        let mut end = start;
        while end < self.ranges.len() && self.ranges[end].lower <= upper.saturating_add(1) {
            merged.lower = merged.lower.min(self.ranges[end].lower);
            merged.upper = merged.upper.max(self.ranges[end].upper);
            end += 1;
        }
        self.ranges.splice(start..end, std::iter::once(merged));
    }

    /// Merge every interval of `other` into `self`.
    pub fn add_all(&mut self, other: &RangeString) {
        for range in &other.ranges {
            self.add_range(range.lower, range.upper);
        }
    }

    pub fn contains(&self, value: u64) -> bool {
        let idx = self.ranges.partition_point(|r| r.upper < value);
        idx < self.ranges.len() && self.ranges[idx].lower <= value
    }

    /// True when every value of `[lower, upper]` is in the set.
    pub fn is_covered(&self, lower: u64, upper: u64) -> bool {
        if lower > upper {
            return false;
        }
        let idx = self.ranges.partition_point(|r| r.upper < lower);
        idx < self.ranges.len() && self.ranges[idx].lower <= lower && self.ranges[idx].upper >= upper
    }

    /// True when `[1, n]` is covered (vacuously true for `n == 0`).
    pub fn covers_prefix(&self, n: u64) -> bool {
        n == 0 || self.is_covered(1, n)
    }

    /// Values in `self` that are not in `other`.
    pub fn difference(&self, other: &RangeString) -> RangeString {
        let mut out = Vec::new();
        for range in &self.ranges {
            let mut lower = range.lower;
            let mut exhausted = false;
            for hole in other
                .ranges
                .iter()
                .filter(|o| o.upper >= range.lower && o.lower <= range.upper)
            {
                if hole.lower > lower {
                    out.push(MessageRange {
                        lower,
                        upper: hole.lower - 1,
                    });
                }
                if hole.upper >= range.upper {
                    exhausted = true;
                    break;
                }
                lower = hole.upper + 1;
            }
            if !exhausted {
                out.push(MessageRange {
                    lower,
                    upper: range.upper,
                });
            }
        }
        RangeString { ranges: out }
    }

    pub fn ranges(&self) -> &[MessageRange] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn lowest(&self) -> Option<u64> {
        self.ranges.first().map(|r| r.lower)
    }

    pub fn highest(&self) -> Option<u64> {
        self.ranges.last().map(|r| r.upper)
    }

    /// Total count of values held.
    pub fn count(&self) -> u64 {
        self.ranges.iter().map(MessageRange::len).sum()
    }

    /// Every contained value, ascending.
    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.ranges.iter().flat_map(|r| r.lower..=r.upper)
    }

    pub fn numbers(&self) -> Vec<u64> {
        self.iter().collect()
    }
}

impl fmt::Display for RangeString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, range) in self.ranges.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", range)?;
        }
        Ok(())
    }
}

impl FromStr for RangeString {
    type Err = RangeParseError;

    /// Parses `"lo-hi,lo-hi"`. Unsorted or touching segments are merged.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut set = RangeString::new();
        if s.trim().is_empty() {
            return Ok(set);
        }
        for segment in s.split(',') {
            let segment = segment.trim();
            let malformed = || RangeParseError::Malformed {
                segment: segment.to_string(),
            };
            let (lo, hi) = segment.split_once('-').ok_or_else(malformed)?;
            let lower: u64 = lo.trim().parse().map_err(|_| malformed())?;
            let upper: u64 = hi.trim().parse().map_err(|_| malformed())?;
            let range = MessageRange::new(lower, upper)?;
            set.add_range(range.lower, range.upper);
        }
        Ok(set)
    }
}

impl FromIterator<u64> for RangeString {
    fn from_iter<I: IntoIterator<Item = u64>>(iter: I) -> Self {
        let mut set = RangeString::new();
        for value in iter {
            set.add(value);
        }
        set
    }
}

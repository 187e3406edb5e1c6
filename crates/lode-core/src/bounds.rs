//! Range bounds for cursor scans.

use std::ops::Bound;

use bytes::Bytes;
use lode_common::UNBOUNDED_LIMIT;
use lode_engine::RawIterator;

/// Lower/upper key bounds plus a row limit.
///
/// Each bound is optional and independently inclusive or exclusive.
/// Comparison is byte-wise lexicographic, matching engine key order.
/// A negative `limit` means unbounded.
///
/// # Example
///
/// ```rust
/// use lode_core::RangeBounds;
///
/// let bounds = RangeBounds::all().gt("b").lte("d");
/// assert!(!bounds.contains(b"b"));
/// assert!(bounds.contains(b"c"));
/// assert!(bounds.contains(b"d"));
/// assert!(!bounds.contains(b"e"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeBounds {
    lower: Bound<Bytes>,
    upper: Bound<Bytes>,
    limit: i64,
}

impl Default for RangeBounds {
    fn default() -> Self {
        Self::all()
    }
}

impl RangeBounds {
    /// Covers every key, no limit.
    pub fn all() -> Self {
        Self {
            lower: Bound::Unbounded,
            upper: Bound::Unbounded,
            limit: UNBOUNDED_LIMIT,
        }
    }

    /// Builds bounds from optional `(key, inclusive)` pairs.
    pub fn new(
        lower: Option<(Bytes, bool)>,
        upper: Option<(Bytes, bool)>,
        limit: i64,
    ) -> Self {
        let to_bound = |b: Option<(Bytes, bool)>| match b {
            Some((key, true)) => Bound::Included(key),
            Some((key, false)) => Bound::Excluded(key),
            None => Bound::Unbounded,
        };
        Self {
            lower: to_bound(lower),
            upper: to_bound(upper),
            limit,
        }
    }

    /// Sets an exclusive lower bound.
    #[must_use]
    pub fn gt(mut self, key: impl Into<Bytes>) -> Self {
        self.lower = Bound::Excluded(key.into());
        self
    }

    /// Sets an inclusive lower bound.
    #[must_use]
    pub fn gte(mut self, key: impl Into<Bytes>) -> Self {
        self.lower = Bound::Included(key.into());
        self
    }

    /// Sets an exclusive upper bound.
    #[must_use]
    pub fn lt(mut self, key: impl Into<Bytes>) -> Self {
        self.upper = Bound::Excluded(key.into());
        self
    }

    /// Sets an inclusive upper bound.
    #[must_use]
    pub fn lte(mut self, key: impl Into<Bytes>) -> Self {
        self.upper = Bound::Included(key.into());
        self
    }

    /// Sets the row limit. Negative means unbounded.
    #[must_use]
    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    /// Lower bound.
    pub fn lower(&self) -> Bound<&[u8]> {
        as_slice_bound(&self.lower)
    }

    /// Upper bound.
    pub fn upper(&self) -> Bound<&[u8]> {
        as_slice_bound(&self.upper)
    }

    /// Row limit as given.
    pub fn limit(&self) -> i64 {
        self.limit
    }

    /// Row limit, or `None` when unbounded.
    pub fn max_rows(&self) -> Option<u64> {
        u64::try_from(self.limit).ok()
    }

    /// Returns true if `emitted` rows exhaust the limit.
    #[inline]
    pub fn limit_reached(&self, emitted: u64) -> bool {
        self.max_rows().is_some_and(|max| emitted >= max)
    }

    /// Returns true if the key falls below the lower bound.
    pub fn is_below_lower(&self, key: &[u8]) -> bool {
        match self.lower() {
            Bound::Included(start) => key < start,
            Bound::Excluded(start) => key <= start,
            Bound::Unbounded => false,
        }
    }

    /// Returns true if the key lies past the upper bound. Once true for a
    /// key, it is true for every later key in iteration order.
    pub fn is_beyond_upper(&self, key: &[u8]) -> bool {
        match self.upper() {
            Bound::Included(end) => key > end,
            Bound::Excluded(end) => key >= end,
            Bound::Unbounded => false,
        }
    }

    /// Returns true if the key lies within both bounds.
    pub fn contains(&self, key: &[u8]) -> bool {
        !self.is_below_lower(key) && !self.is_beyond_upper(key)
    }

    /// Positions a fresh iterator at the first key within the lower bound.
    ///
    /// An exclusive lower bound that exists in the store is stepped over.
    pub fn seek_start(&self, iter: &mut dyn RawIterator) {
        match self.lower() {
            Bound::Included(start) => iter.seek(start),
            Bound::Excluded(start) => {
                iter.seek(start);
                if iter.valid() && iter.key() == Some(start) {
                    iter.next();
                }
            }
            Bound::Unbounded => iter.seek_to_first(),
        }
    }
}

fn as_slice_bound(bound: &Bound<Bytes>) -> Bound<&[u8]> {
    match bound {
        Bound::Included(key) => Bound::Included(&key[..]),
        Bound::Excluded(key) => Bound::Excluded(&key[..]),
        Bound::Unbounded => Bound::Unbounded,
    }
}

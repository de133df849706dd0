//! Cache geometry and set-range selection.

use crate::status::{ Error, Result };

/// Size of a single A64 instruction word (in bytes).
pub const INS_SIZE: usize = 4;

/// Geometry of a set-associative cache-like structure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheShape {
    pub num_sets: usize,
    pub associativity: usize,
    pub line_size: usize,
}
impl CacheShape {
    pub const fn new(num_sets: usize, associativity: usize, line_size: usize)
        -> Self
    {
        Self { num_sets, associativity, line_size }
    }

    /// Total number of lines covered by this shape.
    pub const fn num_lines(&self) -> usize {
        self.num_sets * self.associativity
    }

    /// Number of bytes spanned by one full way (every set, one line each).
    pub const fn way_stride(&self) -> usize {
        self.num_sets * self.line_size
    }

    /// The set that the line containing `addr` maps to.
    pub const fn set_of(&self, addr: usize) -> usize {
        (addr / self.line_size) % self.num_sets
    }

    /// Bytes spanned by the shape plus one spare way and one trailing
    /// instruction, or `None` if that doesn't fit in a `usize`.
    pub fn footprint(&self) -> Option<usize> {
        self.num_sets
            .checked_mul(self.associativity.checked_add(1)?)?
            .checked_mul(self.line_size)?
            .checked_add(INS_SIZE)
    }

    /// Check that all dimensions are positive and that the memory the shape
    /// spans can be addressed.
    pub fn validate(&self) -> Result<()> {
        if self.num_sets == 0 {
            return Err(Error::BadArgument("cache shape needs at least one set"));
        }
        if self.associativity == 0 {
            return Err(Error::BadArgument("cache shape needs at least one way"));
        }
        if self.line_size == 0 {
            return Err(Error::BadArgument("cache shape needs a nonzero line size"));
        }
        if self.footprint().is_none() {
            return Err(Error::BadArgument("cache shape is too large"));
        }
        Ok(())
    }

    /// Check that a line is large enough to hold a gadget of `words`
    /// instructions and is made of whole instruction words.
    pub fn validate_for_code(&self, words: usize) -> Result<()> {
        self.validate()?;
        if self.line_size < words * INS_SIZE {
            return Err(Error::BadArgument("line size too small for gadget"));
        }
        if self.line_size % INS_SIZE != 0 {
            return Err(Error::BadArgument(
                "line size must be a multiple of the instruction size"
            ));
        }
        Ok(())
    }
}

/// A half-open range of cache sets `[set_start, set_end)`.
///
/// The range wraps around the end of the cache when `set_end <= set_start`,
/// so `{ 6, 2 }` on an 8-set cache selects sets 6, 7, 0 and 1.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProbeConfig {
    pub set_start: usize,
    pub set_end: usize,
}
impl ProbeConfig {
    pub const fn new(set_start: usize, set_end: usize) -> Self {
        Self { set_start, set_end }
    }

    /// The configuration applied when a probe is attached: every set.
    pub const fn all_sets(shape: &CacheShape) -> Self {
        Self { set_start: 0, set_end: shape.num_sets }
    }

    /// Check this range against the given shape.
    ///
    /// `set_end` may equal `num_sets`, which reads as "through the last set".
    pub fn validate(&self, shape: &CacheShape) -> Result<()> {
        if self.set_start >= shape.num_sets {
            return Err(Error::BadArgument("set_start out of range"));
        }
        if self.set_end > shape.num_sets {
            return Err(Error::BadArgument("set_end out of range"));
        }
        if self.set_start == self.set_end {
            return Err(Error::BadArgument("set range is empty"));
        }
        Ok(())
    }

    /// Number of sets selected by this range.
    pub const fn active_sets(&self, shape: &CacheShape) -> usize {
        set_count(self.set_start, self.set_end, shape.num_sets)
    }

    /// Returns true if `set` falls within this range.
    pub const fn contains(&self, set: usize) -> bool {
        set_inside(set, self.set_start, self.set_end)
    }

    /// Iterate over the selected sets in measurement order.
    pub fn sets(&self, shape: &CacheShape) -> impl Iterator<Item=usize> {
        let n = shape.num_sets;
        let start = self.set_start;
        (0..self.active_sets(shape)).map(move |i| (start + i) % n)
    }
}

/// Number of sets in the circular range `[start, end)` of a cache with
/// `nsets` sets.
pub const fn set_count(start: usize, end: usize, nsets: usize) -> usize {
    if start < end {
        end - start
    } else {
        end + nsets - start
    }
}

/// Returns true if `set` falls within the circular range `[start, end)`.
pub const fn set_inside(set: usize, start: usize, end: usize) -> bool {
    (start < end && start <= set && set < end)
        || (start > end && (start <= set || set < end))
}

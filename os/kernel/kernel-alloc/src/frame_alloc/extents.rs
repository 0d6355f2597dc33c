//! The physical extents the allocator was given.
//!
//! Extents are kept sorted by start page and adjacent extents are merged, so
//! a range of frames the allocator handed out always lies inside exactly one
//! entry. A free is only accepted for frames inside an entry.

/// Slots for disjoint extents.
pub const MAX_EXTENTS: usize = 128;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct Extent {
    start: u64,
    end: u64,
}

pub struct Extents {
    list: [Extent; MAX_EXTENTS],
    len: usize,
}

impl Extents {
    pub const fn new() -> Self {
        Self {
            list: [Extent { start: 0, end: 0 }; MAX_EXTENTS],
            len: 0,
        }
    }

    #[inline]
    fn entries(&self) -> &[Extent] {
        &self.list[..self.len]
    }

    #[inline]
    pub const fn count(&self) -> usize {
        self.len
    }

    /// Record the page range `[start, end)`, which must not overlap a recorded
    /// extent. Returns `false` when it neither touches a neighbour nor fits.
    pub fn add(&mut self, start: u64, end: u64) -> bool {
        debug_assert!(start < end);
        let at = self.entries().partition_point(|e| e.start < start);
        let joins_prev = at > 0 && self.list[at - 1].end == start;
        let joins_next = at < self.len && self.list[at].start == end;

        match (joins_prev, joins_next) {
            (true, true) => {
                self.list[at - 1].end = self.list[at].end;
                self.list.copy_within(at + 1..self.len, at);
                self.len -= 1;
            }
            (true, false) => self.list[at - 1].end = end,
            (false, true) => self.list[at].start = start,
            (false, false) => {
                if self.len == MAX_EXTENTS {
                    return false;
                }
                self.list.copy_within(at..self.len, at + 1);
                self.list[at] = Extent { start, end };
                self.len += 1;
            }
        }
        true
    }

    /// Whether `[start, end)` lies inside one recorded extent.
    pub fn contains(&self, start: u64, end: u64) -> bool {
        let at = self.entries().partition_point(|e| e.start <= start);
        at > 0 && end <= self.list[at - 1].end && start < self.list[at - 1].end
    }
}

//! Extent allocator for file-backed stores.

use std::collections::BTreeMap;

/// First-fit allocator over allocation units.
///
/// Free extents are kept sorted by start unit and merged with their
/// neighbors on release. Space past the highest allocated unit is handed
/// out by bumping `end`.
#[derive(Debug)]
pub struct ExtentAllocator {
    /// Free extents: start unit -> length in units.
    free: BTreeMap<u64, u64>,
    /// One past the highest unit ever allocated.
    end: u64,
    /// Maximum number of units (None = unbounded).
    capacity: Option<u64>,
    allocated: u64,
}

impl ExtentAllocator {
    /// Creates an allocator whose first `used` units are already allocated.
    pub fn new(used: u64, capacity: Option<u64>) -> Self {
        Self {
            free: BTreeMap::new(),
            end: used,
            capacity,
            allocated: used,
        }
    }

    /// Allocates `units` contiguous units, returning the first unit.
    pub fn allocate(&mut self, units: u64) -> Option<u64> {
        debug_assert!(units > 0);
        let fit = self
            .free
            .iter()
            .find(|(_, &len)| len >= units)
            .map(|(&start, &len)| (start, len));

        let start = match fit {
            Some((start, len)) => {
                self.free.remove(&start);
                if len > units {
                    self.free.insert(start + units, len - units);
                }
                start
            }
            None => {
                if let Some(cap) = self.capacity {
                    if self.end + units > cap {
                        return None;
                    }
                }
                let start = self.end;
                self.end += units;
                start
            }
        };
        self.allocated += units;
        Some(start)
    }

    /// Releases `units` units starting at `start`.
    pub fn free(&mut self, start: u64, units: u64) {
        debug_assert!(start + units <= self.end, "free past end of store");
        let mut start = start;
        let mut len = units;

        if let Some((&prev, &prev_len)) = self.free.range(..start).next_back() {
            debug_assert!(prev + prev_len <= start, "double free at unit {}", start);
            if prev + prev_len == start {
                self.free.remove(&prev);
                start = prev;
                len += prev_len;
            }
        }
        if let Some(next_len) = self.free.remove(&(start + len)) {
            len += next_len;
        }

        if start + len == self.end {
            self.end = start;
        } else {
            self.free.insert(start, len);
        }
        self.allocated -= units;
    }

    /// Returns the number of allocated units.
    pub fn allocated_units(&self) -> u64 {
        self.allocated
    }

    /// Returns one past the highest allocated unit.
    pub fn end(&self) -> u64 {
        self.end
    }
}

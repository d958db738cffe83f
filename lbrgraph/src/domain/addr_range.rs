use serde::{Deserialize, Serialize};
use std::fmt;

/// Half-open address range `[lo, hi)`
///
/// `hi == 0` marks a single address (`lo` only); such a range has size zero
/// but still contains `lo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct AddrRange {
    pub lo: u64,
    pub hi: u64,
}

impl AddrRange {
    #[must_use]
    pub fn new(lo: u64, hi: u64) -> Self {
        Self { lo, hi }
    }

    #[must_use]
    pub fn point(addr: u64) -> Self {
        Self { lo: addr, hi: 0 }
    }

    #[must_use]
    pub fn is_single(&self) -> bool {
        self.hi == 0
    }

    /// Exclusive end, treating a single address as one byte wide
    #[must_use]
    pub fn end(&self) -> u64 {
        if self.is_single() {
            self.lo.saturating_add(1)
        } else {
            self.hi
        }
    }

    #[must_use]
    pub fn last(&self) -> u64 {
        self.end() - 1
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        if self.is_single() {
            0
        } else {
            self.hi - self.lo
        }
    }

    #[must_use]
    pub fn valid(&self) -> bool {
        self.is_single() || self.hi > self.lo
    }

    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.lo && addr < self.end()
    }

    /// True if either range contains an endpoint of the other
    #[must_use]
    pub fn overlaps(&self, other: &AddrRange) -> bool {
        self.contains(other.lo)
            || self.contains(other.last())
            || other.contains(self.lo)
            || other.contains(self.last())
    }

    /// Widen to cover `addr`
    pub fn add_addr(&mut self, addr: u64) {
        if addr == 0 {
            return;
        }
        if self.lo == 0 && self.hi == 0 {
            *self = Self::point(addr);
            return;
        }
        let lo = self.lo.min(addr);
        let hi = self.end().max(addr.saturating_add(1));
        *self = Self { lo, hi };
    }

    /// Smallest range covering both
    #[must_use]
    pub fn merged(&self, other: &AddrRange) -> Self {
        Self { lo: self.lo.min(other.lo), hi: self.end().max(other.end()) }
    }
}

impl fmt::Display for AddrRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_single() {
            write!(f, "[{:#x}]", self.lo)
        } else {
            write!(f, "[{:#x}, {:#x})", self.lo, self.hi)
        }
    }
}

/// Total bytes covered by the union of `ranges`
#[must_use]
pub fn union_size(ranges: &mut [AddrRange]) -> u64 {
    ranges.sort_unstable();
    let mut total = 0;
    let mut cur: Option<(u64, u64)> = None;
    for r in ranges.iter() {
        let (lo, hi) = (r.lo, r.lo + r.size());
        cur = match cur {
            Some((clo, chi)) if lo <= chi => Some((clo, chi.max(hi))),
            Some((clo, chi)) => {
                total += chi - clo;
                Some((lo, hi))
            }
            None => Some((lo, hi)),
        };
    }
    if let Some((clo, chi)) = cur {
        total += chi - clo;
    }
    total
}

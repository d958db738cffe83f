//! Domain types providing compile-time safety and self-documentation
//!
//! Newtype wrappers keep pids, tids and perf timestamps from being mixed up
//! with the raw addresses and counters that fill the rest of the pipeline.

use std::fmt;

/// Process ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Pid(pub u32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PID:{}", self.0)
    }
}

/// Thread ID
///
/// Threads of one process share its address space, so mapping lookups are
/// keyed by [`Pid`] alone while aggregation buckets fold in the tid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Tid(pub u32);

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TID:{}", self.0)
    }
}

/// Perf timestamp packed as `(seconds << 32) + microseconds`
///
/// `perf script` prints `<sec>.<usec>`; packing both halves keeps ordering a
/// plain integer comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Timestamp(pub u64);

impl Timestamp {
    #[must_use]
    pub fn from_parts(secs: u64, usecs: u64) -> Self {
        Self((secs << 32).wrapping_add(usecs))
    }

    #[must_use]
    pub fn secs(self) -> u64 {
        self.0 >> 32
    }

    #[must_use]
    pub fn usecs(self) -> u64 {
        self.0 & 0xffff_ffff
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.secs(), self.usecs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_packing() {
        let ts = Timestamp::from_parts(1_114_875, 29_688);
        assert_eq!(ts.0, (1_114_875u64 << 32) + 29_688);
        assert_eq!(ts.secs(), 1_114_875);
        assert_eq!(ts.usecs(), 29_688);
        assert_eq!(ts.to_string(), "1114875.029688");
    }

    #[test]
    fn test_timestamp_ordering_follows_seconds_first() {
        let early = Timestamp::from_parts(10, 999_999);
        let late = Timestamp::from_parts(11, 0);
        assert!(early < late);
    }

    #[test]
    fn test_id_display() {
        assert_eq!(Pid(42).to_string(), "PID:42");
        assert_eq!(Tid(7).to_string(), "TID:7");
    }
}

//! Parsed trace records
//!
//! Every string field is a `&'a str` borrowed from the line the record was
//! parsed from. The line buffer is reused for the next line, so a record must
//! be fully consumed (resolved, or its strings interned) before the reader
//! advances; the lifetime makes that a compile-time requirement.

use crate::domain::{Pid, Tid, Timestamp};
use lbrgraph_common::BranchInsn;

/// Maximum LBR depth printed by `perf script`
pub const MAX_LBR_ENTRIES: usize = 32;

/// `<comm> <pid>/<tid> <sec>.<usec>:` prefix shared by all lines
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleHeader<'a> {
    pub pid: Pid,
    pub tid: Tid,
    pub timestamp: Timestamp,
    pub comm: &'a str,
}

impl SampleHeader<'_> {
    #[must_use]
    pub fn tpid(&self) -> u64 {
        lbrgraph_common::tpid(self.pid.0, self.tid.0)
    }
}

/// One sampled address
///
/// `unmapped_addr` is zero until the mapping tracker resolves the sample to
/// a file offset inside `dso`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleLoc<'a> {
    pub mapped_addr: u64,
    pub unmapped_addr: u64,
    pub dso: &'a str,
}

impl<'a> SampleLoc<'a> {
    #[must_use]
    pub fn new(mapped_addr: u64, dso: &'a str) -> Self {
        Self { mapped_addr, unmapped_addr: 0, dso }
    }

    #[must_use]
    pub fn valid(&self) -> bool {
        !self.dso.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Prediction {
    Mispredicted,
    Predicted,
    #[default]
    Unknown,
}

/// One LBR entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LbrBranch<'a> {
    pub from: SampleLoc<'a>,
    pub to: SampleLoc<'a>,
    pub cycles: u32,
    pub prediction: Prediction,
    pub in_tx: bool,
    pub aborted: bool,
    /// Decoded from the `from` instruction bytes; bad until resolved
    pub branch: BranchInsn,
}

impl LbrBranch<'_> {
    #[must_use]
    pub fn valid(&self) -> bool {
        self.from.valid() && self.to.valid()
    }
}

// ============================================================================
// Info Events
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct MmapRecord<'a> {
    pub base: u64,
    pub size: u64,
    pub off: u64,
    pub pid: Pid,
    pub tid: Tid,
    pub read: bool,
    pub write: bool,
    pub exec: bool,
    pub shared: bool,
    pub private: bool,
    pub dso: &'a str,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForkRecord {
    pub ppid: Pid,
    pub ptid: Tid,
    pub cpid: Pid,
    pub ctid: Tid,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommRecord<'a> {
    pub pid: Pid,
    pub tid: Tid,
    pub exec: bool,
    pub comm: &'a str,
}

/// Payload of an info line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InfoRecord<'a> {
    #[default]
    Unused,
    Mmap(MmapRecord<'a>),
    Fork(ForkRecord),
    Comm(CommRecord<'a>),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InfoSample<'a> {
    pub header: SampleHeader<'a>,
    pub record: InfoRecord<'a>,
}

impl<'a> InfoSample<'a> {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        !matches!(self.record, InfoRecord::Unused)
    }

    #[must_use]
    pub fn as_mmap(&self) -> Option<&MmapRecord<'a>> {
        match &self.record {
            InfoRecord::Mmap(m) => Some(m),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_fork(&self) -> Option<&ForkRecord> {
        match &self.record {
            InfoRecord::Fork(f) => Some(f),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_comm(&self) -> Option<&CommRecord<'a>> {
        match &self.record {
            InfoRecord::Comm(c) => Some(c),
            _ => None,
        }
    }
}

// ============================================================================
// Event Samples
// ============================================================================

/// IP sample: header plus one location
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimpleSample<'a> {
    pub header: SampleHeader<'a>,
    pub loc: SampleLoc<'a>,
}

impl SimpleSample<'_> {
    #[must_use]
    pub fn valid(&self) -> bool {
        self.loc.valid()
    }
}

/// IP sample followed by its branch stack, oldest branch first
#[derive(Debug, Clone, Default)]
pub struct LbrSample<'a> {
    pub sample: SimpleSample<'a>,
    branches: [LbrBranch<'a>; MAX_LBR_ENTRIES],
    len: usize,
}

impl<'a> LbrSample<'a> {
    #[must_use]
    pub fn branches(&self) -> &[LbrBranch<'a>] {
        &self.branches[..self.len]
    }

    pub fn branches_mut(&mut self) -> &mut [LbrBranch<'a>] {
        &mut self.branches[..self.len]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Replace the branch stack; entries past [`MAX_LBR_ENTRIES`] are dropped
    pub fn set_branches(&mut self, branches: &[LbrBranch<'a>]) {
        let n = branches.len().min(MAX_LBR_ENTRIES);
        self.branches[..n].copy_from_slice(&branches[..n]);
        self.len = n;
    }

    #[must_use]
    pub fn valid(&self) -> bool {
        (1..=MAX_LBR_ENTRIES).contains(&self.len)
            && self.sample.valid()
            && self.branches().iter().all(LbrBranch::valid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn branch<'a>(from: u64, to: u64, dso: &'a str) -> LbrBranch<'a> {
        LbrBranch { from: SampleLoc::new(from, dso), to: SampleLoc::new(to, dso), ..Default::default() }
    }

    #[test]
    fn test_info_accessors_are_partial() {
        let mut info = InfoSample::default();
        assert!(!info.is_active());
        assert!(info.as_mmap().is_none());

        info.record = InfoRecord::Fork(ForkRecord { ppid: Pid(1), ptid: Tid(1), cpid: Pid(2), ctid: Tid(2) });
        assert!(info.is_active());
        assert!(info.as_fork().is_some());
        assert!(info.as_mmap().is_none());
        assert!(info.as_comm().is_none());

        info.reset();
        assert_eq!(info.record, InfoRecord::Unused);
    }

    #[test]
    fn test_lbr_validity_requires_entries() {
        let mut lbr = LbrSample::default();
        lbr.sample.loc = SampleLoc::new(0x1000, "/bin/true");
        assert!(!lbr.valid());

        lbr.set_branches(&[branch(0x1000, 0x2000, "/bin/true")]);
        assert!(lbr.valid());
        assert_eq!(lbr.len(), 1);

        lbr.set_branches(&[branch(0x1000, 0x2000, "")]);
        assert!(!lbr.valid());
    }

    #[test]
    fn test_set_branches_truncates() {
        let many = vec![branch(1, 2, "a"); MAX_LBR_ENTRIES + 4];
        let mut lbr = LbrSample::default();
        lbr.set_branches(&many);
        assert_eq!(lbr.len(), MAX_LBR_ENTRIES);
    }

    #[test]
    fn test_header_tpid() {
        let hdr = SampleHeader { pid: Pid(3), tid: Tid(4), ..Default::default() };
        assert_eq!(hdr.tpid(), (3u64 << 32) | 4);
    }
}

//! Address-space mapping tracker
//!
//! Replays `PERF_RECORD_MMAP2` and `PERF_RECORD_FORK` events into a
//! per-process table so sampled virtual addresses can be translated back to
//! file offsets inside their DSO.
//!
//! ```text
//! pid ──► DSO name ──► [MapInfo { ts, base, size, off }, ...]   (sorted by ts)
//! ```
//!
//! Lookups walk a DSO's list newest first and take the first mapping that
//! already existed at the sample's timestamp and contains the address.

use super::registry::{DsoId, SymbolRegistry};
use crate::domain::{Pid, Timestamp};
use crate::telemetry::Telemetry;
use crate::trace::{strip_deleted, ForkRecord, MmapRecord, SampleHeader, SampleLoc};
use lbrgraph_common::BranchInsn;
use log::{info, trace, warn};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// One executable mapping of a DSO
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapInfo {
    pub ts: Timestamp,
    pub base: u64,
    pub size: u64,
    pub off: u64,
}

impl MapInfo {
    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        addr.wrapping_sub(self.base) < self.size
    }

    /// Virtual address to file offset
    #[must_use]
    pub fn unmap(&self, addr: u64) -> u64 {
        addr.wrapping_sub(self.base).wrapping_add(self.off)
    }
}

impl fmt::Display for MapInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: [{:#x} + {:#x} -> {:#x}]", self.ts, self.base, self.off, self.size)
    }
}

/// Mappings of one DSO in one process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DsoMappings {
    maps: Vec<MapInfo>,
}

impl DsoMappings {
    pub fn add(&mut self, map: MapInfo) {
        self.maps.push(map);
    }

    pub fn merge(&mut self, other: &DsoMappings) {
        self.maps.extend_from_slice(&other.maps);
    }

    /// Stable sort by timestamp
    pub fn finalize(&mut self) {
        self.maps.sort_by_key(|m| m.ts);
    }

    #[must_use]
    pub fn find(&self, ts: Timestamp, addr: u64) -> Option<&MapInfo> {
        self.maps.iter().rev().find(|m| m.ts <= ts && m.contains(addr))
    }

    #[must_use]
    pub fn maps(&self) -> &[MapInfo] {
        &self.maps
    }
}

/// Mappings of one process, by canonical DSO name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PidMappings {
    dsos: BTreeMap<String, DsoMappings>,
}

impl PidMappings {
    pub fn add(&mut self, dso: &str, map: MapInfo) {
        self.dsos.entry(dso.to_string()).or_default().add(map);
    }

    pub fn merge(&mut self, other: &PidMappings) {
        for (name, maps) in &other.dsos {
            self.dsos.entry(name.clone()).or_default().merge(maps);
        }
    }

    pub fn finalize(&mut self) {
        self.dsos.values_mut().for_each(DsoMappings::finalize);
    }

    #[must_use]
    pub fn find(&self, dso: &str, ts: Timestamp, addr: u64) -> Option<&MapInfo> {
        self.dsos.get(dso)?.find(ts, addr)
    }

    #[must_use]
    pub fn dso(&self, dso: &str) -> Option<&DsoMappings> {
        self.dsos.get(dso)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.dsos.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dsos.is_empty()
    }
}

impl fmt::Display for PidMappings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, maps) in &self.dsos {
            writeln!(f, "{name}")?;
            for map in maps.maps() {
                writeln!(f, "\t{map}")?;
            }
        }
        Ok(())
    }
}

/// Address spaces of every traced process
#[derive(Debug, Clone, Default)]
pub struct Mappings {
    pids: HashMap<Pid, PidMappings>,
}

impl Mappings {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an mmap event; only readable executable mappings are kept
    pub fn add_mmap(&mut self, header: &SampleHeader<'_>, mmap: &MmapRecord<'_>) -> bool {
        if !(mmap.read && mmap.exec) || mmap.dso.is_empty() {
            return false;
        }
        let map = MapInfo { ts: header.timestamp, base: mmap.base, size: mmap.size, off: mmap.off };
        self.pids.entry(mmap.pid).or_default().add(strip_deleted(mmap.dso), map);
        true
    }

    /// Copy the parent's address space into a forked child
    ///
    /// A child that already has mappings keeps them and gets the parent's
    /// appended; that case is counted in `total_bad_mappings`.
    pub fn add_fork(&mut self, header: &SampleHeader<'_>, fork: &ForkRecord, telemetry: &mut Telemetry) -> bool {
        telemetry.total_mappings += 1;
        if fork.ppid == fork.cpid {
            return false;
        }
        let Some(parent) = self.pids.get(&fork.ppid).cloned() else {
            return false;
        };
        match self.pids.entry(fork.cpid) {
            Entry::Vacant(slot) => {
                slot.insert(parent);
                true
            }
            Entry::Occupied(mut slot) => {
                telemetry.total_bad_mappings += 1;
                warn!(
                    "fork ({} -> {}) duplicates {} at {}\nparent:\n{parent}child:\n{}",
                    fork.ppid,
                    fork.cpid,
                    fork.cpid,
                    header.timestamp,
                    slot.get()
                );
                slot.get_mut().merge(&parent);
                false
            }
        }
    }

    /// Sort every mapping list by timestamp; call once the info pass is done
    pub fn finalize(&mut self) {
        self.pids.values_mut().for_each(PidMappings::finalize);
    }

    #[must_use]
    pub fn pid(&self, pid: Pid) -> Option<&PidMappings> {
        self.pids.get(&pid)
    }

    #[must_use]
    pub fn num_pids(&self) -> usize {
        self.pids.len()
    }

    /// Log every process's mappings at info level, lowest pid first
    pub fn log_dump(&self) {
        let mut pids: Vec<_> = self.pids.iter().collect();
        pids.sort_by_key(|(pid, _)| **pid);
        for (pid, maps) in pids {
            info!("pid {pid}:\n{maps}");
        }
    }

    #[must_use]
    pub fn find(&self, pid: Pid, dso: &str, ts: Timestamp, addr: u64) -> Option<&MapInfo> {
        self.pids.get(&pid)?.find(dso, ts, addr)
    }

    /// Resolve `loc` to a file offset inside `dso`
    ///
    /// With `branch_out`, the instruction at the resolved offset is read
    /// from the DSO image and decoded into it (bad when undecodable or no
    /// image). Returns false if no mapping covers the address at that time.
    pub fn fillin_sample_loc(
        &self,
        registry: &SymbolRegistry,
        dso: DsoId,
        header: &SampleHeader<'_>,
        loc: &mut SampleLoc<'_>,
        branch_out: Option<&mut BranchInsn>,
        telemetry: &mut Telemetry,
    ) -> bool {
        let name = registry.dso(dso).name();
        let Some(map) = self.find(header.pid, name, header.timestamp, loc.mapped_addr) else {
            return false;
        };
        loc.unmapped_addr = map.unmap(loc.mapped_addr);

        if let Some(out) = branch_out {
            let insn = registry.read_insn(dso, loc.unmapped_addr).unwrap_or(BranchInsn::BAD);
            telemetry.total_insn_searched += 1;
            if insn.is_good() {
                telemetry.total_insn_decoded += 1;
            } else {
                trace!("{name} + {:#x}: no branch decoded", loc.unmapped_addr);
            }
            *out = insn;
        }
        true
    }
}

//! DSO records and their function tables

use super::func::Func;
use super::image::{DsoImage, FuncSymbol};
use super::registry::ClumpId;
use crate::domain::AddrRange;
use lbrgraph_common::{decode, BranchInsn, MAX_INSN_SIZE};
use std::collections::BTreeSet;
use std::fmt;

/// Name perf prints for addresses outside any mapping
pub const UNKNOWN_DSO: &str = "[unknown]";

/// Function ends are padded up to this alignment when the gap allows
pub const FUNC_ALIGN: u64 = 16;

/// One binary image referenced by the trace
pub struct Dso {
    name: String,
    reloaded: bool,
    comms: BTreeSet<String>,
    /// Ranges as built from the image; sorted, non-overlapping. Kept apart
    /// from the clumps so later merges cannot disturb the search order.
    funcs: Vec<(AddrRange, ClumpId)>,
    image: Option<Box<dyn DsoImage>>,
    findable: bool,
}

impl Dso {
    pub(crate) fn new(name: &str, reloaded: bool, image: Option<Box<dyn DsoImage>>) -> Self {
        let findable = image.is_some();
        Self { name: name.to_string(), reloaded, comms: BTreeSet::new(), funcs: Vec::new(), image, findable }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn is_reloaded(&self) -> bool {
        self.reloaded
    }

    #[must_use]
    pub fn is_unknown(&self) -> bool {
        self.name == UNKNOWN_DSO
    }

    /// The backing binary was found and loaded (or was when a reloaded state was saved)
    #[must_use]
    pub fn is_findable(&self) -> bool {
        self.findable
    }

    pub(crate) fn set_findable(&mut self, findable: bool) {
        self.findable = findable;
    }

    #[must_use]
    pub fn has_debug_info(&self) -> bool {
        self.image.as_ref().is_some_and(|i| i.has_debug_info())
    }

    #[must_use]
    pub fn comms(&self) -> &BTreeSet<String> {
        &self.comms
    }

    pub fn add_comm(&mut self, comm: &str) {
        if !comm.is_empty() && !self.comms.contains(comm) {
            self.comms.insert(comm.to_string());
        }
    }

    #[must_use]
    pub fn func_table(&self) -> &[(AddrRange, ClumpId)] {
        &self.funcs
    }

    pub(crate) fn set_func_table(&mut self, funcs: Vec<(AddrRange, ClumpId)>) {
        self.funcs = funcs;
    }

    pub(crate) fn image(&self) -> Option<&dyn DsoImage> {
        self.image.as_deref()
    }

    /// Binary search the function table for the clump covering `offset`
    #[must_use]
    pub fn lookup(&self, offset: u64) -> Option<ClumpId> {
        let idx = self.funcs.partition_point(|(range, _)| range.end() <= offset);
        let (range, id) = self.funcs.get(idx)?;
        range.contains(offset).then_some(*id)
    }

    /// Decode the instruction at a file offset; `None` without an image
    #[must_use]
    pub fn read_insn(&self, offset: u64) -> Option<BranchInsn> {
        let image = self.image()?;
        let mut buf = [0u8; MAX_INSN_SIZE];
        let n = image.read_at(offset, &mut buf);
        Some(decode(&buf[..n]))
    }
}

impl fmt::Debug for Dso {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dso")
            .field("name", &self.name)
            .field("reloaded", &self.reloaded)
            .field("comms", &self.comms)
            .field("funcs", &self.funcs.len())
            .field("findable", &self.is_findable())
            .finish()
    }
}

/// Group image symbols into non-overlapping clumps
///
/// Symbols are sorted by range, each end is padded to [`FUNC_ALIGN`] when
/// that stays clear of the next symbol, and runs of overlapping symbols
/// (aliases, folded functions) become one group.
#[must_use]
pub fn build_func_groups(symbols: &[FuncSymbol]) -> Vec<Vec<Func>> {
    let mut funcs: Vec<Func> = symbols.iter().map(FuncSymbol::to_func).collect();
    funcs.sort_by_key(|f| f.range);

    for i in 0..funcs.len() {
        let next_lo = funcs.get(i + 1).map_or(u64::MAX, |f| f.range.lo);
        let aligned = funcs[i].range.hi.next_multiple_of(FUNC_ALIGN);
        if aligned <= next_lo {
            funcs[i].range.hi = aligned;
        }
    }

    let mut groups: Vec<Vec<Func>> = Vec::new();
    let mut group_end = 0;
    for func in funcs {
        match groups.last_mut() {
            Some(group) if func.range.lo < group_end => {
                group_end = group_end.max(func.range.hi);
                group.push(func);
            }
            _ => {
                group_end = func.range.hi;
                groups.push(vec![func]);
            }
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_groups_pad_and_merge_aliases() {
        let symbols = vec![
            FuncSymbol::new("b", 0x120, 0x12a),
            FuncSymbol::new("a", 0x100, 0x118),
            FuncSymbol::new("a_alias", 0x100, 0x118),
            FuncSymbol::new("c", 0x12c, 0x140),
        ];
        let groups = build_func_groups(&symbols);
        assert_eq!(groups.len(), 3);

        let names: Vec<_> = groups[0].iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["a", "a_alias"]);
        assert_eq!(groups[0][0].range.hi, 0x120);

        // padding 0x12a -> 0x130 would run into c
        assert_eq!(groups[1][0].range.hi, 0x12a);
        assert_eq!(groups[2][0].range.hi, 0x140);
    }

    #[test]
    fn test_groups_chain_overlaps() {
        let symbols = vec![
            FuncSymbol::new("outer", 0x1000, 0x1100),
            FuncSymbol::new("inner1", 0x1010, 0x1020),
            FuncSymbol::new("inner2", 0x10f0, 0x1200),
        ];
        let groups = build_func_groups(&symbols);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 3);
    }

    #[test]
    fn test_add_comm_dedups() {
        let mut dso = Dso::new("/bin/app", false, None);
        dso.add_comm("app");
        dso.add_comm("app");
        dso.add_comm("");
        assert_eq!(dso.comms().len(), 1);
        assert!(!dso.is_findable());
        assert_eq!(dso.read_insn(0), None);
    }

    #[test]
    fn test_lookup_uses_half_open_ranges() {
        let mut dso = Dso::new("/bin/app", false, None);
        dso.set_func_table(vec![
            (AddrRange::new(0x100, 0x120), ClumpId::from_index(0)),
            (AddrRange::new(0x140, 0x160), ClumpId::from_index(1)),
        ]);
        assert_eq!(dso.lookup(0x100), Some(ClumpId::from_index(0)));
        assert_eq!(dso.lookup(0x11f), Some(ClumpId::from_index(0)));
        assert_eq!(dso.lookup(0x120), None);
        assert_eq!(dso.lookup(0x150), Some(ClumpId::from_index(1)));
        assert_eq!(dso.lookup(0x160), None);
        assert_eq!(dso.lookup(0x10), None);
    }
}

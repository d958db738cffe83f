//! Symbol identity registry
//!
//! Owns every [`Dso`] and [`FuncClump`] seen during a run in two append-only
//! arenas. The rest of the pipeline holds [`DsoId`] / [`ClumpId`] handles,
//! so identity is handle equality and the arenas are dropped wholesale with
//! the registry.
//!
//! # Interning
//!
//! - DSOs are keyed by canonical name (` (deleted)` stripped) and the
//!   reloaded flag; the two variants are distinct identities.
//! - Clumps are keyed by content: owning DSO, constituent names and span.
//! - Addresses no symbol covers get one `[unknown]` clump per address.

// Arena indices are stored as u32; a registry never holds 2^32 entries
#![allow(clippy::cast_possible_truncation)]

use super::dso::{build_func_groups, Dso};
use super::func::{ClumpKey, FuncClump};
use super::image::{ImageLoader, NullLoader};
use crate::telemetry::Telemetry;
use crate::trace::strip_deleted;
use lbrgraph_common::BranchInsn;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DsoId(u32);

impl DsoId {
    #[must_use]
    pub fn from_index(index: usize) -> Self {
        Self(index as u32)
    }

    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClumpId(u32);

impl ClumpId {
    #[must_use]
    pub fn from_index(index: usize) -> Self {
        Self(index as u32)
    }

    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for DsoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dso#{}", self.0)
    }
}

impl fmt::Display for ClumpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "clump#{}", self.0)
    }
}

pub struct SymbolRegistry {
    loader: Box<dyn ImageLoader>,
    dsos: Vec<Dso>,
    clumps: Vec<FuncClump>,
    /// `[normal, reloaded]` per canonical name
    dso_index: HashMap<String, [Option<DsoId>; 2]>,
    clump_index: HashMap<ClumpKey, ClumpId>,
    unknown_index: HashMap<(DsoId, u64), ClumpId>,
}

impl SymbolRegistry {
    #[must_use]
    pub fn new(loader: Box<dyn ImageLoader>) -> Self {
        Self {
            loader,
            dsos: Vec::new(),
            clumps: Vec::new(),
            dso_index: HashMap::new(),
            clump_index: HashMap::new(),
            unknown_index: HashMap::new(),
        }
    }

    /// Registry whose DSOs never have images; every address is unknown
    #[must_use]
    pub fn without_images() -> Self {
        Self::new(Box::new(NullLoader))
    }

    // ========================================================================
    // DSOs
    // ========================================================================

    /// Handle for the DSO named `name`, loading its image on first sight
    pub fn get_dso(&mut self, name: &str, telemetry: &mut Telemetry) -> DsoId {
        self.get_or_create_dso(name, false, telemetry)
    }

    /// Handle for the reloaded variant of `name`; never loads an image
    pub fn get_reloaded_dso(&mut self, name: &str, telemetry: &mut Telemetry) -> DsoId {
        self.get_or_create_dso(name, true, telemetry)
    }

    #[must_use]
    pub fn find_dso(&self, name: &str, reloaded: bool) -> Option<DsoId> {
        self.dso_index.get(strip_deleted(name))?[usize::from(reloaded)]
    }

    fn get_or_create_dso(&mut self, name: &str, reloaded: bool, telemetry: &mut Telemetry) -> DsoId {
        let name = strip_deleted(name);
        if let Some(id) = self.find_dso(name, reloaded) {
            return id;
        }

        let id = DsoId::from_index(self.dsos.len());
        telemetry.total_dsos += 1;

        let image = if reloaded { None } else { self.loader.open(name) };
        if let Some(image) = &image {
            telemetry.total_processed_dsos += 1;
            if image.has_debug_info() {
                telemetry.total_processed_dso_debugs += 1;
            }
        }
        let groups = image.as_ref().map(|i| build_func_groups(i.functions())).unwrap_or_default();
        self.dsos.push(Dso::new(name, reloaded, image));
        self.dso_index.entry(name.to_string()).or_default()[usize::from(reloaded)] = Some(id);

        let mut table = Vec::with_capacity(groups.len());
        for group in groups {
            let clump_id = self.intern_clump(FuncClump::new(id, group));
            table.push((self.clumps[clump_id.index()].range(), clump_id));
        }
        debug!("New DSO {name}{}: {} functions", if reloaded { " (reloaded)" } else { "" }, table.len());
        self.dsos[id.index()].set_func_table(table);
        id
    }

    #[must_use]
    pub fn dso(&self, id: DsoId) -> &Dso {
        &self.dsos[id.index()]
    }

    pub(crate) fn dso_mut(&mut self, id: DsoId) -> &mut Dso {
        &mut self.dsos[id.index()]
    }

    pub fn add_comm(&mut self, dso: DsoId, comm: &str) {
        self.dsos[dso.index()].add_comm(comm);
    }

    /// Decode the instruction at `offset` in the DSO's image
    #[must_use]
    pub fn read_insn(&self, dso: DsoId, offset: u64) -> Option<BranchInsn> {
        self.dsos[dso.index()].read_insn(offset)
    }

    pub fn dsos(&self) -> impl Iterator<Item = (DsoId, &Dso)> {
        self.dsos.iter().enumerate().map(|(i, d)| (DsoId::from_index(i), d))
    }

    #[must_use]
    pub fn num_dsos(&self) -> usize {
        self.dsos.len()
    }

    // ========================================================================
    // Clumps
    // ========================================================================

    /// Clump covering file offset `addr` in `dso`, or the unknown clump for it
    ///
    /// Every lookup counts as a known or unknown hit.
    pub fn get_func(&mut self, dso: DsoId, addr: u64, telemetry: &mut Telemetry) -> ClumpId {
        if let Some(id) = self.dsos[dso.index()].lookup(addr) {
            telemetry.total_known_funcs += 1;
            return id;
        }
        telemetry.total_unknown_funcs += 1;
        if let Some(&id) = self.unknown_index.get(&(dso, addr)) {
            return id;
        }
        let id = self.intern_clump(FuncClump::unknown(dso, addr));
        self.unknown_index.insert((dso, addr), id);
        id
    }

    /// Handle for a clump with this content, allocating one if new
    pub fn intern_clump(&mut self, clump: FuncClump) -> ClumpId {
        let key = clump.key();
        if let Some(&id) = self.clump_index.get(&key) {
            return id;
        }
        let id = ClumpId::from_index(self.clumps.len());
        self.clumps.push(clump);
        self.clump_index.insert(key, id);
        id
    }

    /// Merge `src` into `dst` in place; `src` stays allocated and unchanged
    pub fn merge_clumps(&mut self, dst: ClumpId, src: ClumpId) {
        if dst == src {
            return;
        }
        let src = self.clumps[src.index()].clone();
        let merged = &mut self.clumps[dst.index()];
        merged.merge(&src);
        self.clump_index.entry(merged.key()).or_insert(dst);
    }

    pub fn add_sample_addr(&mut self, id: ClumpId, addr: u64) {
        self.clumps[id.index()].add_sample_addr(addr);
    }

    #[must_use]
    pub fn clump(&self, id: ClumpId) -> &FuncClump {
        &self.clumps[id.index()]
    }

    pub fn clumps(&self) -> impl Iterator<Item = (ClumpId, &FuncClump)> {
        self.clumps.iter().enumerate().map(|(i, c)| (ClumpId::from_index(i), c))
    }

    #[must_use]
    pub fn num_clumps(&self) -> usize {
        self.clumps.len()
    }

    /// Clump is known and its DSO's binary was found
    #[must_use]
    pub fn is_findable(&self, id: ClumpId) -> bool {
        let clump = self.clump(id);
        clump.is_findable() && self.dso(clump.dso()).is_findable()
    }
}

impl Default for SymbolRegistry {
    fn default() -> Self {
        Self::without_images()
    }
}

impl fmt::Debug for SymbolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymbolRegistry")
            .field("dsos", &self.dsos.len())
            .field("clumps", &self.clumps.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbols::image::{FuncSymbol, MemoryImage, MemoryLoader};
    use lbrgraph_common::kind;

    fn registry() -> SymbolRegistry {
        let image = MemoryImage::new(vec![
            FuncSymbol::new("main", 0x100, 0x140),
            FuncSymbol::new("helper", 0x140, 0x158),
            FuncSymbol::new("helper_alias", 0x140, 0x158),
        ])
        .with_bytes(0x104, &[0xe8, 0x00, 0x00, 0x00, 0x00]);
        SymbolRegistry::new(Box::new(MemoryLoader::new().with_image("/bin/app", image)))
    }

    #[test]
    fn test_dso_identity() {
        let mut reg = registry();
        let mut t = Telemetry::new();
        let a = reg.get_dso("/bin/app", &mut t);
        let b = reg.get_dso("/bin/app (deleted)", &mut t);
        let r = reg.get_reloaded_dso("/bin/app", &mut t);
        assert_eq!(a, b);
        assert_ne!(a, r);
        assert_eq!(reg.find_dso("/bin/app", true), Some(r));
        assert_eq!(reg.find_dso("/bin/other", false), None);
        assert_eq!(t.total_dsos, 2);
        assert_eq!(t.total_processed_dsos, 1);
        assert!(reg.dso(a).is_findable());
        assert!(!reg.dso(r).is_findable());
        assert!(reg.dso(r).is_reloaded());
    }

    #[test]
    fn test_get_func_known_and_unknown() {
        let mut reg = registry();
        let mut t = Telemetry::new();
        let dso = reg.get_dso("/bin/app", &mut t);
        assert_eq!(t.total_known_funcs, 0);

        let main = reg.get_func(dso, 0x120, &mut t);
        assert_eq!(reg.clump(main).name(), "main");
        assert_eq!(reg.get_func(dso, 0x100, &mut t), main);

        // aliases share one clump; padded end reaches 0x160
        let helper = reg.get_func(dso, 0x15c, &mut t);
        assert_eq!(reg.clump(helper).funcs().len(), 2);
        assert_eq!(t.total_known_funcs, 3);

        let u1 = reg.get_func(dso, 0x900, &mut t);
        let u2 = reg.get_func(dso, 0x901, &mut t);
        assert_ne!(u1, u2);
        assert_eq!(reg.get_func(dso, 0x900, &mut t), u1);
        assert!(reg.clump(u1).is_unknown());
        assert_eq!(t.total_unknown_funcs, 3);
        assert_eq!(t.total_known_funcs, 3);
        assert!(!reg.is_findable(u1));
        assert!(reg.is_findable(main));
    }

    #[test]
    fn test_unknown_dso_has_no_functions() {
        let mut reg = SymbolRegistry::without_images();
        let mut t = Telemetry::new();
        let dso = reg.get_dso("[unknown]", &mut t);
        let id = reg.get_func(dso, 0x10, &mut t);
        assert!(reg.clump(id).is_unknown());
        assert!(reg.dso(dso).is_unknown());
        assert_eq!(reg.read_insn(dso, 0x10), None);
    }

    #[test]
    fn test_intern_and_merge() {
        let mut reg = registry();
        let mut t = Telemetry::new();
        let dso = reg.get_dso("/bin/app", &mut t);
        let main = reg.get_func(dso, 0x100, &mut t);
        let copy = reg.clump(main).clone();
        assert_eq!(reg.intern_clump(copy), main);

        let before = reg.clump(main).clone();
        reg.merge_clumps(main, main);
        assert_eq!(reg.clump(main), &before);

        let helper = reg.get_func(dso, 0x140, &mut t);
        reg.merge_clumps(main, helper);
        assert_eq!(reg.clump(main).funcs().len(), 3);
        assert_eq!(reg.clump(helper).funcs().len(), 2);
        // lookups still use the original table
        assert_eq!(reg.get_func(dso, 0x150, &mut t), helper);
    }

    #[test]
    fn test_read_insn() {
        let mut reg = registry();
        let mut t = Telemetry::new();
        let dso = reg.get_dso("/bin/app", &mut t);
        let insn = reg.read_insn(dso, 0x104).unwrap_or(BranchInsn::BAD);
        assert!(insn.kind() & kind::CALL != 0);
        assert!(insn.is_trackable_call());
        assert_eq!(reg.read_insn(dso, 0x4000), Some(BranchInsn::BAD));
    }
}

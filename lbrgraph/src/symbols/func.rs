//! Functions and function clumps
//!
//! A [`Func`] is one symbol: a name plus the file-offset range it covers. A
//! [`FuncClump`] is the call-graph node: one or more functions that are
//! treated as a single unit because their ranges overlap (aliases, ICF) or
//! because they share a name.

use super::registry::DsoId;
use crate::domain::addr_range::{union_size, AddrRange};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Name given to addresses no symbol covers
pub const UNKNOWN_NAME: &str = "[unknown]";

/// Functions larger than this are treated as bogus symbol sizes
pub const MAX_FUNC_SIZE: u64 = 32 * 1024 * 1024;

/// Symbol identifier decorations (`foo@plt`, `foo@@GLIBC_2.2.5`)
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Ident {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub plt: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
}

impl Ident {
    /// Split a raw symbol name into its base name and identifier
    #[must_use]
    pub fn split(raw: &str) -> (&str, Ident) {
        match raw.split_once('@') {
            Some((base, "plt")) => (base, Ident { plt: true, version: String::new() }),
            Some((base, version)) => {
                (base, Ident { plt: false, version: version.trim_start_matches('@').to_string() })
            }
            None => (raw, Ident::default()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Func {
    pub name: String,
    #[serde(default)]
    pub ident: Ident,
    pub range: AddrRange,
    /// Range came from a symbol table rather than observed samples
    #[serde(default)]
    pub has_symbol: bool,
}

impl Func {
    #[must_use]
    pub fn from_symbol(raw_name: &str, range: AddrRange) -> Self {
        let (name, ident) = Ident::split(raw_name);
        Self { name: name.to_string(), ident, range, has_symbol: true }
    }

    #[must_use]
    pub fn unknown(addr: u64) -> Self {
        Self {
            name: UNKNOWN_NAME.to_string(),
            ident: Ident::default(),
            range: AddrRange::new(addr, addr.saturating_add(1)),
            has_symbol: false,
        }
    }

    #[must_use]
    pub fn is_unknown(&self) -> bool {
        self.name == UNKNOWN_NAME
    }

    /// Real symbol that a later link step can place
    #[must_use]
    pub fn is_findable(&self) -> bool {
        !self.is_unknown() && !self.ident.plt
    }

    /// Demangled display name
    #[must_use]
    pub fn label(&self) -> String {
        let base = rustc_demangle::try_demangle(&self.name)
            .map_or_else(|_| self.name.clone(), |d| format!("{d:#}"));
        if self.ident.plt {
            format!("{base}@plt")
        } else {
            base
        }
    }
}

/// Content key used to intern clumps
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClumpKey {
    dso: DsoId,
    names: Vec<(String, Ident)>,
    range: AddrRange,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FuncClump {
    dso: DsoId,
    funcs: Vec<Func>,
    range: AddrRange,
    size: u64,
    contiguous: bool,
    reloaded: bool,
    unknown: bool,
}

impl FuncClump {
    /// Clump over functions already known to overlap (or a single function)
    #[must_use]
    pub fn new(dso: DsoId, mut funcs: Vec<Func>) -> Self {
        funcs.sort();
        funcs.dedup();
        let range = span(&funcs);
        let mut ranges: Vec<_> = funcs.iter().map(|f| f.range).collect();
        let size = union_size(&mut ranges);
        let unknown = funcs.iter().any(Func::is_unknown);
        Self { dso, funcs, range, size, contiguous: true, reloaded: false, unknown }
    }

    #[must_use]
    pub fn unknown(dso: DsoId, addr: u64) -> Self {
        Self::new(dso, vec![Func::unknown(addr)])
    }

    /// Clump restored from a save state; its size is taken as recorded
    #[must_use]
    pub fn reloaded(dso: DsoId, funcs: Vec<Func>, size: u64, contiguous: bool) -> Self {
        let mut clump = Self::new(dso, funcs);
        clump.size = size;
        clump.contiguous = contiguous;
        clump.reloaded = true;
        clump
    }

    pub(crate) fn mark_unknown(&mut self) {
        self.unknown = true;
    }

    #[must_use]
    pub fn dso(&self) -> DsoId {
        self.dso
    }

    #[must_use]
    pub fn funcs(&self) -> &[Func] {
        &self.funcs
    }

    /// Span of all constituent ranges
    #[must_use]
    pub fn range(&self) -> AddrRange {
        self.range
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn is_contiguous(&self) -> bool {
        self.contiguous
    }

    #[must_use]
    pub fn is_reloaded(&self) -> bool {
        self.reloaded
    }

    #[must_use]
    pub fn is_unknown(&self) -> bool {
        self.unknown
    }

    #[must_use]
    pub fn is_findable(&self) -> bool {
        !self.unknown && self.funcs.iter().any(Func::is_findable)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.funcs.first().map_or(UNKNOWN_NAME, |f| f.name.as_str())
    }

    #[must_use]
    pub fn key(&self) -> ClumpKey {
        ClumpKey {
            dso: self.dso,
            names: self.funcs.iter().map(|f| (f.name.clone(), f.ident.clone())).collect(),
            range: self.range,
        }
    }

    /// Same DSO and at least one pair of constituent ranges overlap
    #[must_use]
    pub fn overlaps(&self, other: &FuncClump) -> bool {
        if self.dso != other.dso || !self.range.overlaps(&other.range) {
            return false;
        }
        self.funcs.iter().any(|a| other.funcs.iter().any(|b| a.range.overlaps(&b.range)))
    }

    /// Absorb `other` into `self`
    ///
    /// Overlapping clumps take the size of the union of their ranges, disjoint
    /// ones the sum of both sizes.
    pub fn merge(&mut self, other: &FuncClump) {
        if self == other {
            return;
        }
        let overlapping = self.overlaps(other);
        self.size = if overlapping {
            let mut ranges: Vec<_> = self.funcs.iter().chain(&other.funcs).map(|f| f.range).collect();
            union_size(&mut ranges)
        } else {
            self.size + other.size
        };
        self.funcs.extend(other.funcs.iter().cloned());
        self.funcs.sort();
        self.funcs.dedup();
        self.range = self.range.merged(&other.range);
        self.contiguous = self.contiguous && other.contiguous && overlapping;
        self.unknown |= other.unknown;
    }

    /// Widen an unsized function's estimate with an observed address
    pub fn add_sample_addr(&mut self, addr: u64) {
        if let [func] = self.funcs.as_mut_slice() {
            if !func.has_symbol {
                func.range.add_addr(addr);
                self.range = func.range;
                self.size = self.size.max(self.range.size());
            }
        }
    }

    #[must_use]
    pub fn valid(&self) -> bool {
        !self.funcs.is_empty()
            && self.range.valid()
            && self.size != 0
            && (self.unknown || self.size <= MAX_FUNC_SIZE)
    }

    /// Demangled names of all constituents joined with `/`
    #[must_use]
    pub fn label(&self) -> String {
        let mut labels: Vec<String> = self.funcs.iter().map(Func::label).collect();
        labels.dedup();
        labels.join("/")
    }
}

impl fmt::Display for FuncClump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{} size={:#x}", self.label(), self.range, self.size)
    }
}

fn span(funcs: &[Func]) -> AddrRange {
    let mut iter = funcs.iter().map(|f| f.range);
    let first = iter.next().unwrap_or_default();
    iter.fold(first, |acc, r| acc.merged(&r))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn func(name: &str, lo: u64, hi: u64) -> Func {
        Func::from_symbol(name, AddrRange::new(lo, hi))
    }

    #[test]
    fn test_ident_split() {
        assert_eq!(Ident::split("memcpy@plt"), ("memcpy", Ident { plt: true, version: String::new() }));
        let (name, ident) = Ident::split("memcpy@@GLIBC_2.14");
        assert_eq!(name, "memcpy");
        assert_eq!(ident.version, "GLIBC_2.14");
        assert!(!ident.plt);
        assert_eq!(Ident::split("main"), ("main", Ident::default()));
    }

    #[test]
    fn test_merge_disjoint_sums_sizes() {
        let dso = DsoId::from_index(0);
        let mut a = FuncClump::new(dso, vec![func("foo", 0x100, 0x110)]);
        let b = FuncClump::new(dso, vec![func("foo", 0x200, 0x210)]);
        a.merge(&b);
        assert_eq!(a.size(), 0x20);
        assert_eq!(a.funcs().len(), 2);
        assert!(!a.is_contiguous());
        assert_eq!(a.range(), AddrRange::new(0x100, 0x210));
    }

    #[test]
    fn test_merge_overlapping_uses_union() {
        let dso = DsoId::from_index(0);
        let mut a = FuncClump::new(dso, vec![func("a", 0x100, 0x140)]);
        let b = FuncClump::new(dso, vec![func("b", 0x120, 0x150)]);
        assert!(a.overlaps(&b));
        a.merge(&b);
        assert_eq!(a.size(), 0x50);
        assert!(a.is_contiguous());
    }

    #[test]
    fn test_merge_with_self_is_noop() {
        let dso = DsoId::from_index(0);
        let mut a = FuncClump::new(dso, vec![func("a", 0x100, 0x140)]);
        let copy = a.clone();
        a.merge(&copy);
        assert_eq!(a, copy);
    }

    #[test]
    fn test_different_dsos_never_overlap() {
        let a = FuncClump::new(DsoId::from_index(0), vec![func("a", 0x100, 0x140)]);
        let b = FuncClump::new(DsoId::from_index(1), vec![func("a", 0x100, 0x140)]);
        assert!(!a.overlaps(&b));
    }

    #[test]
    fn test_unknown_clump() {
        let c = FuncClump::unknown(DsoId::from_index(3), 0x4242);
        assert!(c.is_unknown());
        assert!(!c.is_findable());
        assert_eq!(c.size(), 1);
        assert!(c.valid());
        assert_eq!(c.range(), AddrRange::new(0x4242, 0x4243));
    }

    #[test]
    fn test_oversized_function_invalid() {
        let c = FuncClump::new(DsoId::from_index(0), vec![func("huge", 0, MAX_FUNC_SIZE + 0x1000)]);
        assert!(!c.valid());
    }

    #[test]
    fn test_label_demangles_rust_names() {
        let f = func("_ZN4core3fmt5write17h0123456789abcdefE", 0, 0x10);
        assert_eq!(f.label(), "core::fmt::write");
        let plt = func("malloc@plt", 0, 0x10);
        assert_eq!(plt.label(), "malloc@plt");
        assert!(!plt.is_findable());
    }
}

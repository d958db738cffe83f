//! Selection of functions and edges for export
//!
//! Filters see the `(pid << 32) | tid` bucket key first and then each
//! function or edge, together with the registry so they can inspect the
//! owning DSO.

use crate::symbols::{ClumpId, SymbolRegistry};
use lbrgraph_common::BranchInsn;

pub trait FuncFilter {
    fn match_tpid(&self, _tpid: u64) -> bool {
        true
    }

    fn match_func(&self, registry: &SymbolRegistry, clump: ClumpId) -> bool;
}

pub trait EdgeFilter {
    fn match_tpid(&self, _tpid: u64) -> bool {
        true
    }

    fn match_edge(&self, registry: &SymbolRegistry, from: ClumpId, to: ClumpId, branch: BranchInsn) -> bool;
}

/// Keep everything
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl FuncFilter for AcceptAll {
    fn match_func(&self, _registry: &SymbolRegistry, _clump: ClumpId) -> bool {
        true
    }
}

impl EdgeFilter for AcceptAll {
    fn match_edge(&self, _registry: &SymbolRegistry, _from: ClumpId, _to: ClumpId, _branch: BranchInsn) -> bool {
        true
    }
}

/// Keep only functions a linker could place: real symbols in a loaded DSO
#[derive(Debug, Default, Clone, Copy)]
pub struct Findable;

impl FuncFilter for Findable {
    fn match_func(&self, registry: &SymbolRegistry, clump: ClumpId) -> bool {
        registry.is_findable(clump)
    }
}

impl EdgeFilter for Findable {
    fn match_edge(&self, registry: &SymbolRegistry, from: ClumpId, to: ClumpId, _branch: BranchInsn) -> bool {
        registry.is_findable(from) && registry.is_findable(to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbols::{FuncSymbol, MemoryImage, MemoryLoader};
    use crate::telemetry::Telemetry;

    #[test]
    fn test_findable_rejects_unknown_and_plt() {
        let image = MemoryImage::new(vec![FuncSymbol::new("main", 0x100, 0x140), FuncSymbol::new("puts@plt", 0x40, 0x50)]);
        let mut reg = SymbolRegistry::new(Box::new(MemoryLoader::new().with_image("/bin/app", image)));
        let mut t = Telemetry::new();
        let app = reg.get_dso("/bin/app", &mut t);
        let lost = reg.get_dso("/bin/lost", &mut t);

        let main = reg.get_func(app, 0x110, &mut t);
        let plt = reg.get_func(app, 0x44, &mut t);
        let unknown = reg.get_func(app, 0x900, &mut t);
        let lost_fn = reg.get_func(lost, 0x10, &mut t);

        assert!(Findable.match_func(&reg, main));
        assert!(!Findable.match_func(&reg, plt));
        assert!(!Findable.match_func(&reg, unknown));
        assert!(!Findable.match_func(&reg, lost_fn));
        assert!(!Findable.match_edge(&reg, main, unknown, BranchInsn::BAD));
        assert!(AcceptAll.match_func(&reg, lost_fn));
        assert!(FuncFilter::match_tpid(&Findable, 7));
    }
}

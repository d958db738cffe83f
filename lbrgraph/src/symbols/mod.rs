//! Symbol resolution
//!
//! - [`registry`]: arena-backed identities for DSOs and function clumps
//! - [`dso`]: per-DSO function tables and instruction reads
//! - [`func`]: functions, clumps and their merge rules
//! - [`image`]: the binary-image seam (ELF on disk, or in memory)
//! - [`mappings`]: per-process mmap/fork replay for address translation

pub mod dso;
pub mod func;
pub mod image;
pub mod mappings;
pub mod registry;

pub use dso::{Dso, UNKNOWN_DSO};
pub use func::{Func, FuncClump, Ident, MAX_FUNC_SIZE, UNKNOWN_NAME};
pub use image::{DsoImage, ElfImage, ElfLoader, FuncSymbol, ImageLoader, MemoryImage, MemoryLoader, NullLoader};
pub use mappings::{MapInfo, Mappings};
pub use registry::{ClumpId, DsoId, SymbolRegistry};

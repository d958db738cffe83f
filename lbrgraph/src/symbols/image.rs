//! DSO images: function symbols and raw bytes of a binary on disk
//!
//! The registry only needs two things from a binary: the file-offset ranges
//! of its functions and the bytes at a file offset (to decode the branch
//! instruction at an LBR source). [`DsoImage`] is that seam; [`ElfImage`]
//! implements it with the `object` crate, tests implement it in memory.

use super::func::Func;
use crate::domain::AddrRange;
use anyhow::{Context, Result};
use log::{debug, info};
use object::{Object, ObjectSection, ObjectSymbol, SymbolKind};
use std::fs;
use std::path::{Path, PathBuf};

/// Default location of split debug files
pub const DEBUG_ROOT: &str = "/usr/lib/debug";

/// A function symbol, in file-offset space
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct FuncSymbol {
    pub name: String,
    pub range: AddrRange,
}

impl FuncSymbol {
    #[must_use]
    pub fn new(name: impl Into<String>, lo: u64, hi: u64) -> Self {
        Self { name: name.into(), range: AddrRange::new(lo, hi) }
    }

    #[must_use]
    pub fn to_func(&self) -> Func {
        Func::from_symbol(&self.name, self.range)
    }
}

/// Backing binary of a DSO
pub trait DsoImage {
    /// Function symbols in file-offset space, in any order
    fn functions(&self) -> &[FuncSymbol];

    /// Copy bytes at `offset` into `buf`; returns how many were available
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> usize;

    /// Symbols came (at least partly) from a separate debug file
    fn has_debug_info(&self) -> bool {
        false
    }
}

/// Opens the image for a DSO path as printed by perf
pub trait ImageLoader {
    fn open(&self, dso: &str) -> Option<Box<dyn DsoImage>>;
}

/// Loader that never finds an image; every address resolves to an unknown function
#[derive(Debug, Default, Clone, Copy)]
pub struct NullLoader;

impl ImageLoader for NullLoader {
    fn open(&self, _dso: &str) -> Option<Box<dyn DsoImage>> {
        None
    }
}

/// Image assembled in memory, for JIT symbol maps and synthetic traces
#[derive(Debug, Clone, Default)]
pub struct MemoryImage {
    functions: Vec<FuncSymbol>,
    bytes: Vec<u8>,
}

impl MemoryImage {
    #[must_use]
    pub fn new(functions: Vec<FuncSymbol>) -> Self {
        Self { functions, bytes: Vec::new() }
    }

    /// Place `code` at file offset `offset`, zero-filling any gap
    #[must_use]
    pub fn with_bytes(mut self, offset: u64, code: &[u8]) -> Self {
        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        let end = start.saturating_add(code.len());
        if end > self.bytes.len() {
            self.bytes.resize(end, 0);
        }
        self.bytes[start..end].copy_from_slice(code);
        self
    }
}

impl DsoImage for MemoryImage {
    fn functions(&self) -> &[FuncSymbol] {
        &self.functions
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> usize {
        let Some(src) = usize::try_from(offset).ok().and_then(|o| self.bytes.get(o..)) else {
            return 0;
        };
        let n = src.len().min(buf.len());
        buf[..n].copy_from_slice(&src[..n]);
        n
    }
}

/// Serves [`MemoryImage`]s by DSO name
#[derive(Debug, Clone, Default)]
pub struct MemoryLoader {
    images: Vec<(String, MemoryImage)>,
}

impl MemoryLoader {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_image(mut self, dso: impl Into<String>, image: MemoryImage) -> Self {
        self.images.push((dso.into(), image));
        self
    }
}

impl ImageLoader for MemoryLoader {
    fn open(&self, dso: &str) -> Option<Box<dyn DsoImage>> {
        self.images
            .iter()
            .find(|(name, _)| name == dso)
            .map(|(_, image)| Box::new(image.clone()) as Box<dyn DsoImage>)
    }
}

// ============================================================================
// ELF
// ============================================================================

/// ELF file held in memory
pub struct ElfImage {
    data: Vec<u8>,
    functions: Vec<FuncSymbol>,
    has_debug: bool,
}

/// `(vaddr, size, file offset)` of every section with file contents
type SectionMap = Vec<(u64, u64, u64)>;

impl ElfImage {
    /// Load `path`, plus its split debug file when one can be found
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or is not a parseable object
    pub fn open(path: &Path, debug_root: &Path) -> Result<Self> {
        let data = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;

        let (mut functions, debug_path) = {
            let file = object::File::parse(&*data)
                .with_context(|| format!("Failed to parse object file {}", path.display()))?;
            let sections = section_map(&file);
            let functions = collect_functions(&file, &sections);
            let debug_path = find_debug_file(path, debug_root, &file);
            (functions, debug_path.map(|p| (p, sections)))
        };

        let mut has_debug = false;
        if let Some((debug_path, sections)) = debug_path {
            match load_debug_functions(&debug_path, &sections) {
                Ok(extra) => {
                    debug!("{}: {} symbols from {}", path.display(), extra.len(), debug_path.display());
                    functions.extend(extra);
                    has_debug = true;
                }
                Err(e) => debug!("Ignoring debug file {}: {e:#}", debug_path.display()),
            }
        }

        functions.sort();
        functions.dedup();
        Ok(Self { data, functions, has_debug })
    }

    /// Parse an in-memory ELF without looking for debug files
    ///
    /// # Errors
    /// Returns an error if `data` is not a parseable object
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        let mut functions = {
            let file = object::File::parse(&*data).context("Failed to parse object file")?;
            let sections = section_map(&file);
            collect_functions(&file, &sections)
        };
        functions.sort();
        functions.dedup();
        Ok(Self { data, functions, has_debug: false })
    }
}

impl DsoImage for ElfImage {
    fn functions(&self) -> &[FuncSymbol] {
        &self.functions
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> usize {
        let Ok(start) = usize::try_from(offset) else {
            return 0;
        };
        let Some(src) = self.data.get(start..) else {
            return 0;
        };
        let n = src.len().min(buf.len());
        buf[..n].copy_from_slice(&src[..n]);
        n
    }

    fn has_debug_info(&self) -> bool {
        self.has_debug
    }
}

fn section_map(file: &object::File<'_>) -> SectionMap {
    file.sections()
        .filter_map(|s| {
            let (off, _) = s.file_range()?;
            (s.size() > 0).then_some((s.address(), s.size(), off))
        })
        .collect()
}

fn vaddr_to_offset(sections: &SectionMap, vaddr: u64) -> Option<u64> {
    sections
        .iter()
        .find(|(addr, size, _)| vaddr >= *addr && vaddr - addr < *size)
        .map(|(addr, _, off)| vaddr - addr + off)
}

/// File offsets `[lo, hi)` of a symbol; `None` for unmapped or corrupt entries
fn symbol_offsets(sections: &SectionMap, vaddr: u64, size: u64) -> Option<(u64, u64)> {
    let lo = vaddr_to_offset(sections, vaddr)?;
    Some((lo, lo.checked_add(size)?))
}

/// Sized, defined text symbols from both symbol tables
fn collect_functions(file: &object::File<'_>, sections: &SectionMap) -> Vec<FuncSymbol> {
    file.symbols()
        .chain(file.dynamic_symbols())
        .filter(|sym| sym.kind() == SymbolKind::Text && sym.is_definition() && sym.size() > 0)
        .filter_map(|sym| {
            let name = sym.name().ok().filter(|n| !n.is_empty())?;
            let (lo, hi) = symbol_offsets(sections, sym.address(), sym.size())?;
            Some(FuncSymbol::new(name, lo, hi))
        })
        .collect()
}

/// Debug files carry symbols but usually no text; map with the main file's sections
fn load_debug_functions(path: &Path, sections: &SectionMap) -> Result<Vec<FuncSymbol>> {
    let data = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let file = object::File::parse(&*data).context("Failed to parse debug file")?;
    Ok(collect_functions(&file, sections))
}

/// `<path>.debug`, then `<debug_root>/.build-id/xx/yyyy.debug`
fn find_debug_file(path: &Path, debug_root: &Path, file: &object::File<'_>) -> Option<PathBuf> {
    let mut sibling = path.as_os_str().to_owned();
    sibling.push(".debug");
    let sibling = PathBuf::from(sibling);
    if sibling.is_file() {
        return Some(sibling);
    }

    let build_id = file.build_id().ok().flatten()?;
    let (first, rest) = build_id.split_first()?;
    let hex: String = rest.iter().map(|b| format!("{b:02x}")).collect();
    let by_id = debug_root.join(".build-id").join(format!("{first:02x}")).join(format!("{hex}.debug"));
    by_id.is_file().then_some(by_id)
}

// ============================================================================
// Loader
// ============================================================================

/// Opens DSOs from disk, optionally below a root directory
///
/// A root lets a trace recorded on another machine be resolved against a
/// copy of that machine's binaries.
#[derive(Debug, Clone)]
pub struct ElfLoader {
    root: Option<PathBuf>,
    debug_root: PathBuf,
}

impl ElfLoader {
    #[must_use]
    pub fn new(root: Option<PathBuf>) -> Self {
        Self { root, debug_root: PathBuf::from(DEBUG_ROOT) }
    }

    #[must_use]
    pub fn with_debug_root(mut self, debug_root: impl Into<PathBuf>) -> Self {
        self.debug_root = debug_root.into();
        self
    }

    /// Where `dso` lives on this machine
    #[must_use]
    pub fn resolve(&self, dso: &str) -> PathBuf {
        match &self.root {
            Some(root) => root.join(dso.trim_start_matches('/')),
            None => PathBuf::from(dso),
        }
    }
}

impl ImageLoader for ElfLoader {
    fn open(&self, dso: &str) -> Option<Box<dyn DsoImage>> {
        // [vdso], [kernel.kallsyms], [unknown], //anon ...
        if dso.starts_with('[') || dso.starts_with("//") {
            return None;
        }
        let path = self.resolve(dso);
        if !path.is_file() {
            debug!("DSO not found: {}", path.display());
            return None;
        }
        match ElfImage::open(&path, &self.debug_root) {
            Ok(image) => {
                info!("Loaded {} ({} functions)", path.display(), image.functions().len());
                Some(Box::new(image))
            }
            Err(e) => {
                debug!("Unable to load {}: {e:#}", path.display());
                None
            }
        }
    }
}

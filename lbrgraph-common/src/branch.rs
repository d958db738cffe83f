// Table indices and encodings are bounded by compile-time asserts below
#![allow(clippy::cast_possible_truncation)]

use core::fmt;

/// Bytes read from a DSO image for each decode
pub const MAX_INSN_SIZE: usize = 16;

/// Longest opcode encoding present in the table
pub const MAX_ENCODING_LEN: usize = 4;

/// Branch kind bits
pub mod kind {
    pub const CALL: u32 = 1 << 0;
    pub const JMP: u32 = 1 << 1;
    pub const IND: u32 = 1 << 2;
    pub const REL: u32 = 1 << 3;
    pub const COND: u32 = 1 << 4;
    pub const UNCOND: u32 = 1 << 5;
    pub const INT: u32 = 1 << 6;
    pub const RET: u32 = 1 << 7;
    pub const LOOP: u32 = 1 << 8;
    pub const RIPREL: u32 = 1 << 9;
    pub const DBL_IND: u32 = 1 << 10;
    pub const BAD: u32 = 1 << 11;
}

use kind::{CALL, COND, DBL_IND, IND, INT, JMP, LOOP, REL, RET, RIPREL, UNCOND};

/// One row of the decoded branch table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchDesc {
    pub name: &'static str,
    pub kind: u32,
    /// Big-endian opcode bytes (after prefixes)
    pub encoding: u32,
    /// Number of bytes in `encoding`
    pub len: u8,
}

impl BranchDesc {
    const EMPTY: Self = Self { name: "", kind: 0, encoding: 0, len: 0 };
}

// ============================================================================
// Table Definition
// ============================================================================

/// A run of consecutive encodings sharing a name and kind
struct Row {
    name: &'static str,
    kind: u32,
    first: u32,
    len: u8,
    count: u32,
}

const fn one(name: &'static str, kind: u32, encoding: u32, len: u8) -> Row {
    Row { name, kind, first: encoding, len, count: 1 }
}

const fn run(name: &'static str, kind: u32, first: u32, len: u8, count: u32) -> Row {
    Row { name, kind, first, len, count }
}

const JCC: u32 = JMP | COND | REL;
const CALL_MEM: u32 = CALL | IND | DBL_IND | UNCOND;
const CALL_REG: u32 = CALL | IND | UNCOND;
const JMP_MEM: u32 = JMP | IND | DBL_IND | UNCOND;
const JMP_REG: u32 = JMP | IND | UNCOND;

// `ff /r` forms are listed per ModRM byte: mod 00/01/10 address memory,
// mod 11 a register. rm=101 under mod 00 is RIP-relative.
const ROWS: &[Row] = &[
    run("jcc", JCC, 0x70, 1, 16),
    one("ret", RET, 0xc2, 1),
    one("ret", RET, 0xc3, 1),
    one("lret", RET, 0xca, 1),
    one("lret", RET, 0xcb, 1),
    one("int3", INT, 0xcc, 1),
    one("int", INT, 0xcd, 1),
    one("iret", RET | INT, 0xcf, 1),
    run("loop", JCC | LOOP, 0xe0, 1, 3),
    one("jrcxz", JCC, 0xe3, 1),
    one("call", CALL | REL | UNCOND, 0xe8, 1),
    one("jmp", JMP | REL | UNCOND, 0xe9, 1),
    one("jmp", JMP | REL | UNCOND, 0xeb, 1),
    one("syscall", INT, 0x0f05, 2),
    one("sysret", RET | INT, 0x0f07, 2),
    run("jcc", JCC, 0x0f80, 2, 16),
    run("call *mem", CALL_MEM, 0xff10, 2, 5),
    one("call *rip", CALL_MEM | RIPREL, 0xff15, 2),
    run("call *mem", CALL_MEM, 0xff16, 2, 2),
    run("lcall *mem", CALL_MEM, 0xff18, 2, 8),
    run("jmp *mem", JMP_MEM, 0xff20, 2, 5),
    one("jmp *rip", JMP_MEM | RIPREL, 0xff25, 2),
    run("jmp *mem", JMP_MEM, 0xff26, 2, 2),
    run("ljmp *mem", JMP_MEM, 0xff28, 2, 8),
    run("call *mem", CALL_MEM, 0xff50, 2, 8),
    run("lcall *mem", CALL_MEM, 0xff58, 2, 8),
    run("jmp *mem", JMP_MEM, 0xff60, 2, 8),
    run("ljmp *mem", JMP_MEM, 0xff68, 2, 8),
    run("call *mem", CALL_MEM, 0xff90, 2, 8),
    run("lcall *mem", CALL_MEM, 0xff98, 2, 8),
    run("jmp *mem", JMP_MEM, 0xffa0, 2, 8),
    run("ljmp *mem", JMP_MEM, 0xffa8, 2, 8),
    run("call *reg", CALL_REG, 0xffd0, 2, 8),
    run("jmp *reg", JMP_REG, 0xffe0, 2, 8),
];

const fn table_len(rows: &[Row]) -> usize {
    let mut n = 0;
    let mut i = 0;
    while i < rows.len() {
        n += rows[i].count as usize;
        i += 1;
    }
    n
}

const TABLE_LEN: usize = table_len(ROWS);

const fn build_table(rows: &[Row]) -> [BranchDesc; TABLE_LEN] {
    let mut out = [BranchDesc::EMPTY; TABLE_LEN];
    let mut n = 0;
    let mut i = 0;
    while i < rows.len() {
        let row = &rows[i];
        let mut k = 0;
        while k < row.count {
            out[n] =
                BranchDesc { name: row.name, kind: row.kind, encoding: row.first + k, len: row.len };
            n += 1;
            k += 1;
        }
        i += 1;
    }
    out
}

const fn is_sorted(table: &[BranchDesc]) -> bool {
    let mut i = 1;
    while i < table.len() {
        if table[i - 1].encoding >= table[i].encoding {
            return false;
        }
        i += 1;
    }
    true
}

const TABLE_DATA: [BranchDesc; TABLE_LEN] = build_table(ROWS);

const _: () = assert!(is_sorted(&TABLE_DATA), "branch table must be sorted by encoding");
const _: () = assert!(TABLE_LEN < u16::MAX as usize);

/// All known control-transfer encodings, sorted ascending by encoding
pub static TABLE: [BranchDesc; TABLE_LEN] = TABLE_DATA;

// ============================================================================
// Decoded Handle
// ============================================================================

/// Handle to a decoded branch instruction
///
/// The bad handle (index one past the table) is a regular value: it compares,
/// hashes and orders like any other handle, it just carries no semantics.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BranchInsn(u16);

impl BranchInsn {
    pub const BAD: Self = Self(TABLE_LEN as u16);

    #[must_use]
    pub fn desc(self) -> Option<&'static BranchDesc> {
        TABLE.get(usize::from(self.0))
    }

    /// Kind bits, or [`kind::BAD`] for the bad handle
    #[must_use]
    pub fn kind(self) -> u32 {
        self.desc().map_or(kind::BAD, |d| d.kind)
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        self.desc().map_or("bad", |d| d.name)
    }

    #[must_use]
    pub fn is_good(self) -> bool {
        self.desc().is_some()
    }

    #[must_use]
    pub fn is_bad(self) -> bool {
        !self.is_good()
    }

    fn has(self, bits: u32) -> bool {
        self.kind() & bits != 0
    }

    #[must_use]
    pub fn is_call_like(self) -> bool {
        self.has(CALL)
    }

    #[must_use]
    pub fn is_jump_like(self) -> bool {
        self.has(JMP)
    }

    #[must_use]
    pub fn is_return(self) -> bool {
        self.has(RET)
    }

    #[must_use]
    pub fn is_conditional(self) -> bool {
        self.has(COND)
    }

    #[must_use]
    pub fn is_indirect(self) -> bool {
        self.has(IND)
    }

    /// Calls and unconditional jumps (tail calls) become call-graph edges.
    #[must_use]
    pub fn is_trackable_call(self) -> bool {
        self.is_good()
            && (self.is_call_like() || (self.is_jump_like() && !self.is_conditional()))
    }

    /// Raw table index, used by persisted state
    #[must_use]
    pub fn index(self) -> u16 {
        self.0
    }

    /// Inverse of [`BranchInsn::index`]; out of range indices map to bad
    #[must_use]
    pub fn from_index(index: u16) -> Self {
        if usize::from(index) < TABLE_LEN {
            Self(index)
        } else {
            Self::BAD
        }
    }
}

impl Default for BranchInsn {
    fn default() -> Self {
        Self::BAD
    }
}

impl fmt::Debug for BranchInsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BranchInsn({}:{:#x})", self.name(), self.kind())
    }
}

impl fmt::Display for BranchInsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Decoding
// ============================================================================

/// Operand/address size, segment, REX, bnd/notrack and repeat prefixes
#[must_use]
pub fn is_prefix(byte: u8) -> bool {
    matches!(byte, 0x26 | 0x2e | 0x36 | 0x3e | 0x64 | 0x65 | 0x66 | 0x67 | 0xf2 | 0xf3 | 0x40..=0x4f)
}

/// Classify the instruction starting at `bytes[0]`
///
/// Returns [`BranchInsn::BAD`] when the bytes (after prefixes) do not start
/// with any known control-transfer encoding.
#[must_use]
pub fn decode(bytes: &[u8]) -> BranchInsn {
    let Some(start) = bytes.iter().position(|b| !is_prefix(*b)) else {
        return BranchInsn::BAD;
    };

    let mut encoding: u32 = 0;
    for (i, &byte) in bytes[start..].iter().take(MAX_ENCODING_LEN).enumerate() {
        encoding = (encoding << 8) | u32::from(byte);
        if let Ok(idx) = TABLE.binary_search_by_key(&encoding, |d| d.encoding) {
            if usize::from(TABLE[idx].len) == i + 1 {
                return BranchInsn(idx as u16);
            }
        }
    }
    BranchInsn::BAD
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_is_sorted() {
        assert!(is_sorted(&TABLE));
        assert!(TABLE.iter().all(|d| d.len >= 1 && usize::from(d.len) <= MAX_ENCODING_LEN));
    }

    #[test]
    fn test_decode_direct_call() {
        let insn = decode(&[0xe8, 0x10, 0x20, 0x30, 0x40]);
        assert!(insn.is_good());
        assert!(insn.is_call_like());
        assert!(insn.is_trackable_call());
        assert_eq!(insn.name(), "call");
    }

    #[test]
    fn test_decode_skips_prefixes() {
        // notrack call *%rax
        let insn = decode(&[0x3e, 0xff, 0xd0]);
        assert!(insn.is_call_like());
        assert!(insn.is_indirect());

        // call *%r11
        let insn = decode(&[0x41, 0xff, 0xd3]);
        assert_eq!(insn.name(), "call *reg");

        // bnd jmp
        let insn = decode(&[0xf2, 0xe9, 0, 0, 0, 0]);
        assert!(insn.is_jump_like());
        assert!(insn.is_trackable_call());
    }

    #[test]
    fn test_conditional_and_return_not_trackable() {
        let jcc = decode(&[0x74, 0x05]);
        assert!(jcc.is_jump_like());
        assert!(jcc.is_conditional());
        assert!(!jcc.is_trackable_call());

        let jcc32 = decode(&[0x0f, 0x84, 0, 0, 0, 0]);
        assert_eq!(jcc32.name(), "jcc");
        assert!(!jcc32.is_trackable_call());

        let ret = decode(&[0xc3]);
        assert!(ret.is_return());
        assert!(!ret.is_trackable_call());
    }

    #[test]
    fn test_rip_relative_jump() {
        let insn = decode(&[0xff, 0x25, 0x00, 0x10, 0x00, 0x00]);
        assert_eq!(insn.name(), "jmp *rip");
        assert_ne!(insn.kind() & kind::RIPREL, 0);
        assert!(insn.is_trackable_call());
    }

    #[test]
    fn test_unknown_bytes_decode_bad() {
        for bytes in [&[0x90u8, 0x90][..], &[0x48, 0x89, 0xe5], &[], &[0x66, 0x66], &[0xff, 0xc0]] {
            let insn = decode(bytes);
            assert_eq!(insn, BranchInsn::BAD);
            assert!(insn.is_bad());
            assert!(!insn.is_trackable_call());
            assert_eq!(insn.kind(), kind::BAD);
        }
    }

    #[test]
    fn test_decode_is_deterministic() {
        let bytes = [0xff, 0x14, 0x25, 0x00, 0x00, 0x00, 0x00];
        let first = decode(&bytes);
        for _ in 0..8 {
            assert_eq!(decode(&bytes), first);
        }
        assert_eq!(first.name(), "call *mem");
    }

    #[test]
    fn test_index_round_trip() {
        let insn = decode(&[0xeb, 0x02]);
        assert_eq!(BranchInsn::from_index(insn.index()), insn);
        assert_eq!(BranchInsn::from_index(u16::MAX), BranchInsn::BAD);
        assert_eq!(BranchInsn::default(), BranchInsn::BAD);
    }
}

//! # Shared Branch and Identity Definitions
//!
//! Types used by both the trace parser and the aggregation pipeline that have
//! no dependency on the standard library:
//!
//! - [`BranchInsn`] - handle into the static x86-64 control-transfer table
//! - [`decode`] - classify raw instruction bytes read from a DSO image
//! - [`tpid`] / [`split_tpid`] - fold a process id and thread id into one key
//!
//! ## Branch Table
//!
//! The table is a sorted list of `(encoding, kind)` rows. Decoding skips
//! instruction prefixes, then grows a big-endian encoding one byte at a time
//! and binary searches for an exact match at each length. The table order is
//! checked at compile time.

#![cfg_attr(not(test), no_std)]

pub mod branch;

pub use branch::{decode, kind, BranchDesc, BranchInsn, MAX_ENCODING_LEN, MAX_INSN_SIZE};

/// Combine a pid and tid into the 64-bit bucket key used by the aggregator
#[must_use]
#[allow(clippy::cast_lossless)]
pub const fn tpid(pid: u32, tid: u32) -> u64 {
    ((pid as u64) << 32) | tid as u64
}

/// Split a key produced by [`tpid`] back into `(pid, tid)`
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn split_tpid(tpid: u64) -> (u32, u32) {
    ((tpid >> 32) as u32, tpid as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tpid_packs_pid_high() {
        assert_eq!(tpid(1, 2), 0x0000_0001_0000_0002);
        assert_eq!(split_tpid(tpid(4242, 17)), (4242, 17));
        assert_eq!(split_tpid(tpid(u32::MAX, 0)), (u32::MAX, 0));
    }
}

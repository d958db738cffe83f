//! Trace records and the `perf script` line parser
//!
//! - [`sample`]: record types borrowed from one input line
//! - [`parse`]: line parser returning [`ParseStatus`] sentinels
//!
//! The parser does not allocate and keeps no state between lines. Callers
//! own the line buffer and must finish with a parsed record before reading
//! the next line into it.

pub mod parse;
pub mod sample;

pub use parse::{parse_info_line, parse_lbr_line, parse_sample_line, strip_deleted, ParseStatus};
pub use sample::{
    CommRecord, ForkRecord, InfoRecord, InfoSample, LbrBranch, LbrSample, MmapRecord, Prediction,
    SampleHeader, SampleLoc, SimpleSample, MAX_LBR_ENTRIES,
};

//! Domain model for lbrgraph
//!
//! Core value types and errors shared by every pipeline stage:
//! - Newtypes for process/thread ids and perf timestamps
//! - Address ranges used for functions and mappings
//! - Structured error enums for the fallible (IO-facing) stages

pub mod addr_range;
pub mod errors;
pub mod types;

pub use addr_range::AddrRange;
pub use errors::{ExportError, IngestError, StateError};
pub use types::{Pid, Tid, Timestamp};

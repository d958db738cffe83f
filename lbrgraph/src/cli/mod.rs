//! Command-line interface for lbrgraph
//!
//! This module contains CLI argument parsing and validation

pub mod args;

pub use args::Args;

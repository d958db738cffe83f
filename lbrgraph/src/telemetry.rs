//! Run-wide counters
//!
//! A single [`Telemetry`] value is threaded by `&mut` through ingestion,
//! aggregation and clumping. Nothing in the pipeline reads these counters to
//! make decisions; they exist for the end-of-run summary and for tests.

// Counters are printed as floats next to the call-distance accumulator
#![allow(clippy::cast_precision_loss)]

use log::info;
use serde::{Deserialize, Serialize};

macro_rules! telemetry_counters {
    ($($(#[$doc:meta])* $name:ident),* $(,)?) => {
        /// Counters collected over one run
        #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
        #[serde(default)]
        pub struct Telemetry {
            $($(#[$doc])* pub $name: u64,)*
            /// Sum of `|from - to|` over true calls (see [`Telemetry::average_call_distance`])
            pub average_call_dist: f64,
        }

        impl Telemetry {
            /// Add every counter of `other` into `self`
            pub fn merge(&mut self, other: &Telemetry) {
                $(self.$name += other.$name;)*
                self.average_call_dist += other.average_call_dist;
            }

            /// `(name, value)` pairs in declaration order
            #[must_use]
            pub fn entries(&self) -> Vec<(&'static str, f64)> {
                let mut out = vec![$((stringify!($name), self.$name as f64),)*];
                out.push(("average_call_dist", self.average_call_distance()));
                out
            }
        }
    };
}

telemetry_counters! {
    /// Branches between two different functions with a trackable branch type
    total_true_calls,
    /// True calls whose endpoints differ above the low 12 bits
    total_page_cross_calls,
    total_insn_searched,
    total_insn_decoded,
    total_mappings,
    /// Fork events whose child pid already had mappings
    total_bad_mappings,
    total_tracked_samples,
    total_samples,
    total_tracked_branches,
    total_branches,
    total_unknown_funcs,
    total_known_funcs,
    total_dsos,
    total_processed_dsos,
    total_processed_dso_debugs,
    total_funcs,
    total_edges,
    total_clumped_funcs,
    total_tracked_edges,
}

impl Telemetry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn average_call_distance(&self) -> f64 {
        if self.total_true_calls == 0 {
            0.0
        } else {
            self.average_call_dist / self.total_true_calls as f64
        }
    }

    /// Log every non-zero counter at info level
    pub fn log_summary(&self) {
        for (name, value) in self.entries() {
            if value != 0.0 {
                info!("{name:<28} {value:.2}");
            }
        }
    }
}

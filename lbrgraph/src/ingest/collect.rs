//! The two collection passes
//!
//! ```text
//!   info input ──► collect_info ──► Mappings ──► finalize
//!                                                   │
//!   event input ─► collect_events ─► resolve ◄──────┘ ──► per-thread stats
//! ```
//!
//! Both passes are line loops over a [`TraceInput`]: parse, hand the record
//! to the [`SampleAggregator`], count what could not be used.

use super::reader::TraceInput;
use crate::analysis::SampleAggregator;
use crate::domain::errors::IngestError;
use crate::telemetry::Telemetry;
use crate::trace::{parse_info_line, parse_lbr_line, parse_sample_line, InfoRecord, InfoSample, LbrSample, ParseStatus};
use log::{debug, info, warn};

/// Lines between progress messages
pub const PROGRESS_INTERVAL: u64 = 1_000_000;

/// Malformed lines logged at warn level before going quiet
const BAD_LINE_WARNINGS: u64 = 8;

/// Line counts for one pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub lines: u64,
    pub bad_lines: u64,
    /// Records (info pass) or samples (event pass) that changed the aggregate
    pub attributed: u64,
}

impl PassSummary {
    fn line(&mut self, input: &TraceInput) {
        self.lines += 1;
        if self.lines % PROGRESS_INTERVAL == 0 {
            info!("{}: {} lines, {} attributed", input.name(), self.lines, self.attributed);
        }
    }

    fn bad_line(&mut self, input: &TraceInput, line: &str) {
        self.bad_lines += 1;
        if self.bad_lines <= BAD_LINE_WARNINGS {
            warn!("{}:{}: unable to parse {:?}", input.name(), self.lines, line.trim_end());
        } else {
            debug!("{}:{}: unable to parse {:?}", input.name(), self.lines, line.trim_end());
        }
    }

    fn finish(self, pass: &str, input: &TraceInput) -> Result<Self, IngestError> {
        info!(
            "{pass} pass over {}: {} lines, {} bad, {} attributed",
            input.name(),
            self.lines,
            self.bad_lines,
            self.attributed
        );
        if self.attributed == 0 {
            return Err(IngestError::NoSamples(input.name().to_string(), self.lines));
        }
        Ok(self)
    }
}

/// Read mmap and fork records into the aggregator's mappings, then finalize them
///
/// Comm records and other event kinds are accepted and ignored.
pub fn collect_info(
    mut input: TraceInput,
    aggregator: &mut SampleAggregator,
    telemetry: &mut Telemetry,
) -> Result<PassSummary, IngestError> {
    let mut summary = PassSummary::default();
    let mut line = String::new();

    while input.read_line(&mut line)? {
        summary.line(&input);
        let mut record = InfoSample::default();
        match parse_info_line(&line, &mut record) {
            ParseStatus::Done => {}
            ParseStatus::Continue(_) => continue,
            ParseStatus::Incomplete | ParseStatus::Error => {
                summary.bad_line(&input, &line);
                continue;
            }
        }
        let used = match record.record {
            InfoRecord::Mmap(_) => aggregator.collect_mmap(&record),
            InfoRecord::Fork(_) => aggregator.collect_fork(&record, telemetry),
            InfoRecord::Comm(_) | InfoRecord::Unused => false,
        };
        if used {
            summary.attributed += 1;
        }
    }

    aggregator.finalize_mappings();
    let summary = summary.finish("Info", &input)?;
    input.finish()?;
    Ok(summary)
}

/// Attribute every sample line; lines without a branch stack count as plain
/// IP samples
pub fn collect_events(
    mut input: TraceInput,
    aggregator: &mut SampleAggregator,
    telemetry: &mut Telemetry,
) -> Result<PassSummary, IngestError> {
    let mut summary = PassSummary::default();
    let mut line = String::new();

    while input.read_line(&mut line)? {
        summary.line(&input);
        let mut sample = LbrSample::default();
        let attributed = match parse_sample_line(&line, &mut sample.sample) {
            ParseStatus::Done => aggregator.collect_simple(&mut sample.sample, telemetry),
            ParseStatus::Continue(offset) => match parse_lbr_line(&line, offset, &mut sample) {
                ParseStatus::Done => aggregator.collect_lbr(&mut sample, telemetry),
                ParseStatus::Incomplete => aggregator.collect_simple(&mut sample.sample, telemetry),
                ParseStatus::Continue(_) | ParseStatus::Error => {
                    summary.bad_line(&input, &line);
                    continue;
                }
            },
            ParseStatus::Incomplete | ParseStatus::Error => {
                summary.bad_line(&input, &line);
                continue;
            }
        };
        if attributed {
            summary.attributed += 1;
        }
    }

    let summary = summary.finish("Event", &input)?;
    let name = input.name().to_string();
    input.finish()?;
    if !aggregator.valid() {
        return Err(IngestError::InvalidAggregate(name));
    }
    Ok(summary)
}

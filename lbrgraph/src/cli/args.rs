//! CLI argument definitions

use anyhow::{bail, Result};
use clap::{ArgAction, Parser};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "lbrgraph",
    about = "Build a weighted call graph from perf LBR samples",
    after_help = "\
EXAMPLES:
    lbrgraph -p perf.data -o graph.json               Run perf script on perf.data for both passes
    lbrgraph -r ./run1 --save run1.json               Use profile.txt[.gz] and info-events.txt[.gz] in ./run1
    lbrgraph --reload run1.json,run2.json --dot cg.dot  Combine two save states into one graph"
)]
pub struct Args {
    /// Sample events: `perf script` text, gzip'd text, or perf.data
    #[arg(short, long, value_name = "FILE")]
    pub perf: Option<PathBuf>,

    /// mmap/fork events (defaults to the --perf file when it is perf.data)
    #[arg(short, long, value_name = "FILE")]
    pub map: Option<PathBuf>,

    /// Directory holding the traced binaries and default input files
    #[arg(short, long, value_name = "DIR")]
    pub root: Option<PathBuf>,

    /// Write the call graph as JSON
    #[arg(short, long, value_name = "FILE")]
    pub out: Option<PathBuf>,

    /// Write the call graph as Graphviz DOT
    #[arg(long, value_name = "FILE")]
    pub dot: Option<PathBuf>,

    /// Restrict the DOT output to one DSO and its direct neighbours
    #[arg(long, value_name = "NAME", requires = "dot")]
    pub dot_dso: Option<String>,

    /// Write a save state that can be combined later with --reload
    #[arg(long, value_name = "FILE")]
    pub save: Option<PathBuf>,

    /// Comma separated save states to combine instead of reading traces
    #[arg(long, value_name = "A,B,...")]
    pub reload: Option<String>,

    /// Keep raw sample counts instead of normalizing to 2^20 samples / 2^30 edges
    #[arg(long)]
    pub no_normalize: bool,

    /// Multiply all saved weights by this factor
    #[arg(long, value_name = "F")]
    pub add_scale: Option<f64>,

    /// Drop functions without a symbol or whose binary was not found
    #[arg(long)]
    pub findable_only: bool,

    /// Replace existing output files
    #[arg(short = 'w', long)]
    pub overwrite: bool,

    /// Log the mapping tables after the info pass (visible with -v)
    #[arg(long)]
    pub dump: bool,

    /// More logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Only report errors
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,
}

impl Args {
    /// Cross-argument checks clap cannot express
    pub fn validate(&self) -> Result<()> {
        if self.out.is_none() && self.dot.is_none() && self.save.is_none() {
            bail!("Missing required argument: at least one of --out, --dot or --save");
        }
        if self.reload.is_none() && self.perf.is_none() && self.root.is_none() {
            bail!("Missing required argument: --perf, --root or --reload");
        }
        if let Some(root) = &self.root {
            if self.reload.is_none() && !root.is_dir() {
                bail!("Root directory {} does not exist", root.display());
            }
        }
        Ok(())
    }

    /// Default log filter for the `-v`/`-q` flags
    #[must_use]
    pub fn log_level(&self) -> log::LevelFilter {
        if self.quiet {
            return log::LevelFilter::Error;
        }
        match self.verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            2 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("lbrgraph").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_requires_an_output() {
        let args = parse(&["-p", "profile.txt"]);
        let err = args.validate().unwrap_err();
        assert!(err.to_string().contains("Missing required argument"));
        assert!(parse(&["-p", "profile.txt", "--save", "s.json"]).validate().is_ok());
    }

    #[test]
    fn test_requires_an_input() {
        assert!(parse(&["-o", "g.json"]).validate().is_err());
        assert!(parse(&["--reload", "a.json,b.json", "-o", "g.json"]).validate().is_ok());
    }

    #[test]
    fn test_root_must_exist() {
        let err = parse(&["-r", "/nonexistent/run", "-o", "g.json"]).validate().unwrap_err();
        assert!(err.to_string().contains("/nonexistent/run"));
    }

    #[test]
    fn test_verbosity_levels() {
        assert_eq!(parse(&["-o", "g"]).log_level(), log::LevelFilter::Warn);
        assert_eq!(parse(&["-vv", "-o", "g"]).log_level(), log::LevelFilter::Debug);
        assert_eq!(parse(&["-q", "-o", "g"]).log_level(), log::LevelFilter::Error);
        assert!(Args::try_parse_from(["lbrgraph", "-q", "-v"]).is_err());
    }

    #[test]
    fn test_dot_dso_requires_dot() {
        assert!(Args::try_parse_from(["lbrgraph", "--dot-dso", "/bin/app"]).is_err());
        let args = parse(&["--dot", "g.dot", "--dot-dso", "/bin/app", "-w"]);
        assert!(args.overwrite);
        assert_eq!(args.dot_dso.as_deref(), Some("/bin/app"));
    }
}

//! Line sources for the two collection passes
//!
//! A trace input is one of:
//!
//! - a plain `perf script` text dump
//! - the same, gzip-compressed (`.gz`)
//! - a raw `perf.data` file, piped through a `perf script` child process
//!
//! Lines are delivered into a caller-owned `String` so the parser can borrow
//! from it without a per-line allocation.

use crate::domain::errors::IngestError;
use flate2::read::MultiGzDecoder;
use log::{debug, warn};
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

/// Default file names looked up under `--root`
pub const EVENT_DEFAULTS: &[&str] = &["profile.txt.gz", "profile.txt", "perf.data"];
pub const INFO_DEFAULTS: &[&str] = &["info-events.txt.gz", "info-events.txt"];

const READ_BUFFER_SIZE: usize = 1 << 20;

/// Which `perf script` view a `perf.data` input is rendered as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceKind {
    /// mmap, fork and comm records
    Info,
    /// IP samples with branch stacks
    Events,
}

/// `perf script` invocation producing `kind` lines from `data`
#[must_use]
pub fn perf_script_command(data: &Path, kind: TraceKind) -> Command {
    let mut cmd = Command::new("perf");
    cmd.arg("script");
    match kind {
        TraceKind::Info => {
            cmd.args(["-F", "comm,pid,tid,time", "--show-mmap-events", "--show-task-events"]);
        }
        TraceKind::Events => {
            cmd.args(["-F", "comm,pid,tid,time,ip,dso,brstack"]);
        }
    }
    cmd.arg("-i").arg(data);
    cmd
}

fn describe(cmd: &Command) -> String {
    let args: Vec<_> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
    format!("{} {}", cmd.get_program().to_string_lossy(), args.join(" "))
}

#[must_use]
pub fn is_perf_data(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "data")
}

fn is_gzip(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "gz")
}

/// `explicit` if given, otherwise the first of `defaults` present under `root`
#[must_use]
pub fn resolve_input(explicit: Option<&Path>, root: Option<&Path>, defaults: &[&str]) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    let root = root?;
    defaults.iter().map(|name| root.join(name)).find(|candidate| candidate.is_file())
}

/// Line-oriented trace reader
pub struct TraceInput {
    name: String,
    reader: Box<dyn BufRead>,
    child: Option<(String, Child)>,
    bytes: Vec<u8>,
}

impl TraceInput {
    /// Open `path`, choosing the decoder from its extension
    pub fn open(path: &Path, kind: TraceKind) -> Result<Self, IngestError> {
        let name = path.display().to_string();
        if is_perf_data(path) {
            return Self::spawn(name, perf_script_command(path, kind));
        }

        let file = File::open(path).map_err(|source| IngestError::OpenFailed { path: path.to_path_buf(), source })?;
        let reader: Box<dyn BufRead> = if is_gzip(path) {
            Box::new(BufReader::with_capacity(READ_BUFFER_SIZE, MultiGzDecoder::new(file)))
        } else {
            Box::new(BufReader::with_capacity(READ_BUFFER_SIZE, file))
        };
        debug!("Reading {name}");
        Ok(Self::from_reader(name, reader))
    }

    /// Read lines from the stdout of `cmd`
    pub fn spawn(name: String, mut cmd: Command) -> Result<Self, IngestError> {
        let command = describe(&cmd);
        debug!("Running {command}");
        let mut child = cmd
            .stdout(Stdio::piped())
            .stdin(Stdio::null())
            .spawn()
            .map_err(|source| IngestError::SpawnFailed { command: command.clone(), source })?;
        let stdout = child.stdout.take().ok_or_else(|| IngestError::SpawnFailed {
            command: command.clone(),
            source: io::Error::new(io::ErrorKind::BrokenPipe, "no stdout"),
        })?;
        Ok(Self {
            name,
            reader: Box::new(BufReader::with_capacity(READ_BUFFER_SIZE, stdout)),
            child: Some((command, child)),
            bytes: Vec::new(),
        })
    }

    pub fn from_reader(name: impl Into<String>, reader: impl BufRead + 'static) -> Self {
        Self { name: name.into(), reader: Box::new(reader), child: None, bytes: Vec::new() }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replace `buf` with the next line; `false` at end of input
    ///
    /// Invalid UTF-8 is replaced rather than rejected so one odd symbol name
    /// cannot end the pass.
    pub fn read_line(&mut self, buf: &mut String) -> Result<bool, IngestError> {
        buf.clear();
        self.bytes.clear();
        if self.reader.read_until(b'\n', &mut self.bytes)? == 0 {
            return Ok(false);
        }
        buf.push_str(&String::from_utf8_lossy(&self.bytes));
        Ok(true)
    }

    /// Close the input; for a child process, wait and check its exit status
    pub fn finish(mut self) -> Result<(), IngestError> {
        self.reader = Box::new(io::empty());
        if let Some((command, mut child)) = self.child.take() {
            let status = child.wait()?;
            if !status.success() {
                return Err(IngestError::CommandFailed { command, status });
            }
        }
        Ok(())
    }
}

impl Drop for TraceInput {
    fn drop(&mut self) {
        if let Some((command, mut child)) = self.child.take() {
            if let Err(e) = child.kill().and_then(|()| child.wait().map(|_| ())) {
                warn!("Failed to stop `{command}`: {e}");
            }
        }
    }
}

impl std::fmt::Debug for TraceInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceInput").field("name", &self.name).field("child", &self.child.is_some()).finish()
    }
}

//! `perf script` line parser
//!
//! Two line shapes are understood, one per collection pass:
//!
//! ```text
//! info:   <comm> <pid>/<tid> <sec>.<usec>: PERF_RECORD_MMAP2 <pid>/<tid>: [<base>(<size>) @ <off> ...]: <perms> <dso>
//!         <comm> <pid>/<tid> <sec>.<usec>: PERF_RECORD_FORK(<cpid>:<ctid>):(<ppid>:<ptid>)
//!         <comm> <pid>/<tid> <sec>.<usec>: PERF_RECORD_COMM [exec]: <comm>:<pid>/<tid>
//! events: <comm> <pid>/<tid> <sec>.<usec>: <ip> (<dso>) [<from>(<dso>)/<to>(<dso>)/<P|M|->/<X|->/<A|->/<cycles>[/...] ...]
//! ```
//!
//! Parsing never allocates: every string in the output records borrows from
//! the input line. A line is only scanned up to its first `\n`.

use super::sample::{
    CommRecord, ForkRecord, InfoRecord, InfoSample, LbrBranch, LbrSample, MmapRecord, Prediction,
    SampleHeader, SampleLoc, SimpleSample, MAX_LBR_ENTRIES,
};
use crate::domain::{Pid, Tid, Timestamp};
use log::debug;

/// Outcome of parsing one line (or the continuation of one)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    /// The record is complete
    Done,
    /// A header was consumed; the rest of the line starts at this byte offset
    Continue(usize),
    /// A branch chain was expected but none was present
    Incomplete,
    /// Malformed line; count it and move on
    Error,
}

/// Suffix perf appends to paths of unlinked files
pub const DELETED_SUFFIX: &str = " (deleted)";

const MMAP2_TAG: &str = "PERF_RECORD_MMAP2";
const FORK_TAG: &str = "PERF_RECORD_FORK";
const COMM_TAG: &str = "PERF_RECORD_COMM";

// ============================================================================
// Cursor
// ============================================================================

struct Cursor<'a> {
    line: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(line: &'a str, pos: usize) -> Self {
        let line = line.split('\n').next().unwrap_or_default();
        let line = line.strip_suffix('\r').unwrap_or(line);
        Self { line, pos: pos.min(line.len()) }
    }

    fn bytes(&self) -> &'a [u8] {
        self.line.as_bytes()
    }

    fn peek(&self) -> Option<u8> {
        self.bytes().get(self.pos).copied()
    }

    fn at_end(&self) -> bool {
        self.pos >= self.line.len()
    }

    fn at(&self, c: u8) -> bool {
        self.peek() == Some(c)
    }

    fn at_ws(&self) -> bool {
        self.peek().is_some_and(is_ws)
    }

    fn at_str(&self, s: &str) -> bool {
        self.line[self.pos..].starts_with(s)
    }

    fn skip_ws(&mut self) {
        while self.at_ws() {
            self.pos += 1;
        }
    }

    fn eat(&mut self, c: u8) -> Option<()> {
        if self.at(c) {
            self.pos += 1;
            Some(())
        } else {
            None
        }
    }

    fn eat_str(&mut self, s: &str) -> Option<()> {
        if self.at_str(s) {
            self.pos += s.len();
            Some(())
        } else {
            None
        }
    }

    fn skip_to(&mut self, c: u8) -> Option<()> {
        let off = self.bytes()[self.pos..].iter().position(|&b| b == c)?;
        self.pos += off;
        Some(())
    }

    fn skip_to_ws(&mut self) {
        while self.peek().is_some_and(|b| !is_ws(b)) {
            self.pos += 1;
        }
    }

    fn dec(&mut self) -> Option<u64> {
        let start = self.pos;
        while self.peek().is_some_and(|b| b.is_ascii_digit()) {
            self.pos += 1;
        }
        self.line[start..self.pos].parse().ok()
    }

    fn dec_u32(&mut self) -> Option<u32> {
        u32::try_from(self.dec()?).ok()
    }

    fn hex(&mut self) -> Option<u64> {
        if self.at_str("0x") || self.at_str("0X") {
            self.pos += 2;
        }
        let start = self.pos;
        while self.peek().is_some_and(|b| b.is_ascii_hexdigit()) {
            self.pos += 1;
        }
        u64::from_str_radix(&self.line[start..self.pos], 16).ok()
    }
}

fn is_ws(b: u8) -> bool {
    b == b' ' || b == b'\t'
}

// ============================================================================
// Shared Pieces
// ============================================================================

/// `<comm> <pid>/<tid> <sec>.<usec>:`
///
/// The command name may contain spaces and slashes. Skip the first token,
/// find the next `/` (the pid/tid separator), then back up over the pid
/// digits and the whitespace before them.
fn parse_header<'a>(cur: &mut Cursor<'a>) -> Option<SampleHeader<'a>> {
    cur.skip_ws();
    let start = cur.pos;
    cur.skip_to_ws();
    cur.skip_to(b'/')?;

    let bytes = cur.bytes();
    let mut end = cur.pos;
    while end > start && bytes[end - 1].is_ascii_digit() {
        end -= 1;
    }
    let pid_start = end;
    while end > start && is_ws(bytes[end - 1]) {
        end -= 1;
    }
    if end == start || end == pid_start {
        return None;
    }
    let comm = &cur.line[start..end];

    cur.pos = pid_start;
    let pid = cur.dec_u32()?;
    cur.eat(b'/')?;
    let tid = cur.dec_u32()?;
    if !cur.at_ws() {
        return None;
    }
    cur.skip_ws();

    let secs = cur.dec()?;
    cur.eat(b'.')?;
    let usecs = cur.dec()?;
    cur.eat(b':')?;
    cur.skip_ws();

    Some(SampleHeader { pid: Pid(pid), tid: Tid(tid), timestamp: Timestamp::from_parts(secs, usecs), comm })
}

/// `(<dso>)`, dropping a trailing ` (deleted)`
fn parse_dso<'a>(cur: &mut Cursor<'a>) -> Option<&'a str> {
    cur.eat(b'(')?;
    cur.skip_ws();
    let start = cur.pos;
    let rest = &cur.line[start..];

    // The first ')' closes either the path or the "(deleted" marker
    let close = rest.find(')')?;
    let head = &rest[..close];
    let (dso, consumed) = match head.strip_suffix(&DELETED_SUFFIX[..DELETED_SUFFIX.len() - 1]) {
        Some(path) => (path, close + 1),
        None => (head, close),
    };
    cur.pos = start + consumed;
    cur.eat(b')')?;

    let dso = dso.trim_end();
    if dso.is_empty() {
        None
    } else {
        Some(dso)
    }
}

/// Strip the ` (deleted)` marker from a path printed outside parentheses
#[must_use]
pub fn strip_deleted(dso: &str) -> &str {
    dso.strip_suffix(DELETED_SUFFIX).unwrap_or(dso)
}

// ============================================================================
// Info Lines
// ============================================================================

fn parse_mmap<'a>(cur: &mut Cursor<'a>) -> Option<MmapRecord<'a>> {
    cur.eat_str(MMAP2_TAG)?;
    if !cur.at_ws() {
        return None;
    }
    cur.skip_ws();

    let pid = cur.dec_u32()?;
    cur.eat(b'/')?;
    let tid = cur.dec_u32()?;
    cur.eat(b':')?;
    cur.skip_ws();

    cur.eat(b'[')?;
    let base = cur.hex()?;
    cur.eat(b'(')?;
    let size = cur.hex()?;
    cur.eat(b')')?;
    cur.skip_to(b'@')?;
    cur.eat(b'@')?;
    cur.skip_ws();
    let off = cur.hex()?;
    cur.skip_to(b']')?;
    cur.eat(b']')?;
    cur.eat(b':')?;
    cur.skip_ws();

    let mut rec = MmapRecord { base, size, off, pid: Pid(pid), tid: Tid(tid), ..Default::default() };
    while let Some(b) = cur.peek().filter(|b| !is_ws(*b)) {
        match b {
            b'r' => rec.read = true,
            b'w' => rec.write = true,
            b'x' => rec.exec = true,
            b's' => rec.shared = true,
            b'p' => rec.private = true,
            _ => {}
        }
        cur.pos += 1;
    }
    if !cur.at_ws() {
        return None;
    }
    cur.skip_ws();

    let start = cur.pos;
    let dso = strip_deleted(cur.line[start..].trim_end());
    if dso.is_empty() {
        return None;
    }
    rec.dso = dso;
    cur.pos = cur.line.len();
    Some(rec)
}

fn parse_fork(cur: &mut Cursor<'_>) -> Option<ForkRecord> {
    cur.eat_str(FORK_TAG)?;
    cur.skip_ws();

    cur.eat(b'(')?;
    let cpid = cur.dec_u32()?;
    cur.eat(b':')?;
    let ctid = cur.dec_u32()?;
    cur.eat(b')')?;
    cur.eat(b':')?;
    cur.skip_ws();

    cur.eat(b'(')?;
    let ppid = cur.dec_u32()?;
    cur.eat(b':')?;
    let ptid = cur.dec_u32()?;
    cur.eat(b')')?;

    Some(ForkRecord { ppid: Pid(ppid), ptid: Tid(ptid), cpid: Pid(cpid), ctid: Tid(ctid) })
}

fn parse_comm<'a>(cur: &mut Cursor<'a>) -> Option<CommRecord<'a>> {
    cur.eat_str(COMM_TAG)?;
    cur.skip_ws();

    let exec = cur.at_str("exec");
    cur.skip_to(b':')?;
    cur.eat(b':')?;
    cur.skip_ws();

    // The new name may itself contain ':'; the last one separates the ids.
    let start = cur.pos;
    let rest = &cur.line[start..];
    let colon = rest.rfind(':')?;
    if colon == 0 {
        return None;
    }
    let comm = &rest[..colon];
    cur.pos = start + colon + 1;
    cur.skip_ws();

    let pid = cur.dec_u32()?;
    cur.eat(b'/')?;
    let tid = cur.dec_u32()?;

    Some(CommRecord { pid: Pid(pid), tid: Tid(tid), exec, comm })
}

/// Parse one info line
///
/// Returns [`ParseStatus::Done`] for mmap/fork/comm records. Other event kinds
/// leave the record [`InfoRecord::Unused`] and return
/// [`ParseStatus::Continue`] at the event name.
pub fn parse_info_line<'a>(line: &'a str, out: &mut InfoSample<'a>) -> ParseStatus {
    out.reset();
    let mut cur = Cursor::new(line, 0);
    let Some(header) = parse_header(&mut cur) else {
        debug!("bad info header: {line:?}");
        return ParseStatus::Error;
    };
    out.header = header;

    let record = if cur.at_str(MMAP2_TAG) {
        parse_mmap(&mut cur).map(InfoRecord::Mmap)
    } else if cur.at_str(FORK_TAG) {
        parse_fork(&mut cur).map(InfoRecord::Fork)
    } else if cur.at_str(COMM_TAG) {
        parse_comm(&mut cur).map(InfoRecord::Comm)
    } else {
        return ParseStatus::Continue(cur.pos);
    };

    match record {
        Some(record) => {
            out.record = record;
            ParseStatus::Done
        }
        None => {
            debug!("bad info record: {line:?}");
            ParseStatus::Error
        }
    }
}

// ============================================================================
// Event Lines
// ============================================================================

/// Parse the header and IP of a sample line
///
/// Returns [`ParseStatus::Done`] when the line ends after the IP location, or
/// [`ParseStatus::Continue`] with the offset of the branch chain.
pub fn parse_sample_line<'a>(line: &'a str, out: &mut SimpleSample<'a>) -> ParseStatus {
    let mut cur = Cursor::new(line, 0);
    let parsed = parse_header(&mut cur).and_then(|header| {
        let ip = cur.hex()?;
        cur.skip_ws();
        let dso = parse_dso(&mut cur)?;
        Some((header, ip, dso))
    });
    let Some((header, ip, dso)) = parsed else {
        debug!("bad sample line: {line:?}");
        return ParseStatus::Error;
    };

    *out = SimpleSample { header, loc: SampleLoc::new(ip, dso) };
    cur.skip_ws();
    if cur.at_end() {
        ParseStatus::Done
    } else {
        ParseStatus::Continue(cur.pos)
    }
}

/// `<addr>(<dso>)/`
fn parse_branch_loc<'a>(cur: &mut Cursor<'a>) -> Option<SampleLoc<'a>> {
    let addr = cur.hex()?;
    cur.skip_ws();
    let dso = parse_dso(cur)?;
    cur.skip_to(b'/')?;
    cur.eat(b'/')?;
    Some(SampleLoc::new(addr, dso))
}

/// `<P|M|->/<X|->/<A|->/<cycles>[/<type>[/<desc>]]`
fn parse_branch_flags(cur: &mut Cursor<'_>, out: &mut LbrBranch<'_>) -> Option<()> {
    out.prediction = match cur.peek()? {
        b'P' => Prediction::Predicted,
        b'M' => Prediction::Mispredicted,
        b'-' => Prediction::Unknown,
        _ => return None,
    };
    cur.pos += 1;
    cur.eat(b'/')?;

    out.in_tx = match cur.peek()? {
        b'X' => true,
        b'-' => false,
        _ => return None,
    };
    cur.pos += 1;
    cur.eat(b'/')?;

    out.aborted = match cur.peek()? {
        b'A' => true,
        b'-' => false,
        _ => return None,
    };
    cur.pos += 1;
    cur.eat(b'/')?;

    out.cycles = cur.dec_u32()?;
    if cur.at(b'/') {
        cur.skip_to_ws();
    }
    Some(())
}

fn parse_branch<'a>(cur: &mut Cursor<'a>) -> Option<LbrBranch<'a>> {
    let from = parse_branch_loc(cur)?;
    let to = parse_branch_loc(cur)?;
    let mut branch = LbrBranch { from, to, ..Default::default() };
    parse_branch_flags(cur, &mut branch)?;
    Some(branch)
}

/// Parse the branch chain starting at `offset` into `out`
///
/// `perf` prints the newest branch first; entries are stored oldest first.
pub fn parse_lbr_line<'a>(line: &'a str, offset: usize, out: &mut LbrSample<'a>) -> ParseStatus {
    let mut cur = Cursor::new(line, offset);
    let mut entries = [LbrBranch::default(); MAX_LBR_ENTRIES];
    let mut n = 0;

    while n < MAX_LBR_ENTRIES {
        cur.skip_ws();
        if cur.at_end() {
            break;
        }
        let Some(branch) = parse_branch(&mut cur) else {
            debug!("bad branch entry {n}: {line:?}");
            return ParseStatus::Error;
        };
        entries[MAX_LBR_ENTRIES - n - 1] = branch;
        n += 1;
    }

    if n == 0 {
        return ParseStatus::Incomplete;
    }
    out.set_branches(&entries[MAX_LBR_ENTRIES - n..]);
    ParseStatus::Done
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIBC: &str = "/usr/lib/x86_64-linux-gnu/libc.so.6";

    #[test]
    fn test_header_with_spaces_and_slashes_in_comm() {
        let line = format!("abc/123 t 3412366/3412367 1114875.029688:             7f996cd1aaff ({LIBC})\nABCDEF");
        let mut sample = SimpleSample::default();
        assert_eq!(parse_sample_line(&line, &mut sample), ParseStatus::Done);
        assert_eq!(sample.header.comm, "abc/123 t");
        assert_eq!(sample.header.pid, Pid(3_412_366));
        assert_eq!(sample.header.tid, Tid(3_412_367));
        assert_eq!(sample.header.timestamp, Timestamp((1_114_875 << 32) + 29_688));
        assert_eq!(sample.loc.mapped_addr, 0x7f99_6cd1_aaff);
        assert_eq!(sample.loc.unmapped_addr, 0);
        assert_eq!(sample.loc.dso, LIBC);
    }

    #[test]
    fn test_sample_line_trailing_whitespace_is_done() {
        let line = "123 3412/3412 1114875.029688:             7f996cd1aaff ([unknown])          ";
        let mut sample = SimpleSample::default();
        assert_eq!(parse_sample_line(line, &mut sample), ParseStatus::Done);
        assert_eq!(sample.header.comm, "123");
        assert_eq!(sample.loc.dso, "[unknown]");
    }

    #[test]
    fn test_sample_line_errors() {
        let mut sample = SimpleSample::default();
        for line in [
            "",
            "no header here",
            "comm 12/12 1.2 7f00 (/lib/x.so)",
            "comm 12/12 1.2: 7f00 ()",
            "comm 12/12 1.2: 7f00 /lib/x.so",
        ] {
            assert_eq!(parse_sample_line(line, &mut sample), ParseStatus::Error, "{line}");
        }
    }

    #[test]
    fn test_lbr_chain_is_reversed_and_deleted_stripped() {
        let line = format!(
            "perf 10/11 5.000001: 401000 (/bin/app) \
             0x401010(/bin/app)/0x402000(/bin/app)/P/-/-/3/  \
             0x7f00 ({LIBC} (deleted))/0x401008 (/bin/app)/M/X/A/17//-"
        );
        let mut lbr = LbrSample::default();
        let ParseStatus::Continue(off) = parse_sample_line(&line, &mut lbr.sample) else {
            panic!("expected branch chain");
        };
        assert_eq!(parse_lbr_line(&line, off, &mut lbr), ParseStatus::Done);
        assert_eq!(lbr.len(), 2);

        let oldest = &lbr.branches()[0];
        assert_eq!(oldest.from.mapped_addr, 0x7f00);
        assert_eq!(oldest.from.dso, LIBC);
        assert_eq!(oldest.to.dso, "/bin/app");
        assert_eq!(oldest.prediction, Prediction::Mispredicted);
        assert!(oldest.in_tx);
        assert!(oldest.aborted);
        assert_eq!(oldest.cycles, 17);

        let newest = &lbr.branches()[1];
        assert_eq!(newest.from.mapped_addr, 0x401010);
        assert_eq!(newest.to.mapped_addr, 0x402000);
        assert_eq!(newest.prediction, Prediction::Predicted);
        assert_eq!(newest.cycles, 3);
        assert!(lbr.valid());
    }

    #[test]
    fn test_lbr_bad_flag_is_error() {
        let line = "perf 10/11 5.000001: 401000 (/bin/app) 0x1(/bin/app)/0x2(/bin/app)/Q/-/-/3/";
        let mut lbr = LbrSample::default();
        let ParseStatus::Continue(off) = parse_sample_line(line, &mut lbr.sample) else {
            panic!("expected branch chain");
        };
        assert_eq!(parse_lbr_line(line, off, &mut lbr), ParseStatus::Error);
    }

    #[test]
    fn test_lbr_empty_chain_is_incomplete() {
        let line = "perf 10/11 5.000001: 401000 (/bin/app)";
        let mut lbr = LbrSample::default();
        assert_eq!(parse_lbr_line(line, line.len(), &mut lbr), ParseStatus::Incomplete);
    }

    #[test]
    fn test_mmap_line() {
        let line = "app 100/100 7.000050: PERF_RECORD_MMAP2 100/100: [0x7f0000001000(0x2000) @ 0 fd:01 1234 0]: r-xp /usr/lib/libfoo.so";
        let mut info = InfoSample::default();
        assert_eq!(parse_info_line(line, &mut info), ParseStatus::Done);
        let mmap = info.as_mmap().copied().unwrap_or_default();
        assert_eq!(mmap.base, 0x7f00_0000_1000);
        assert_eq!(mmap.size, 0x2000);
        assert_eq!(mmap.off, 0);
        assert_eq!(mmap.pid, Pid(100));
        assert!(mmap.read && mmap.exec && mmap.private);
        assert!(!mmap.write && !mmap.shared);
        assert_eq!(mmap.dso, "/usr/lib/libfoo.so");
        assert_eq!(info.header.timestamp, Timestamp::from_parts(7, 50));
    }

    #[test]
    fn test_mmap_line_deleted_path() {
        let line = "app 1/1 1.000000: PERF_RECORD_MMAP2 1/1: [0x1000(0x1000) @ 0x2000 00:00 0 0]: r-xp /tmp/jit.so (deleted)";
        let mut info = InfoSample::default();
        assert_eq!(parse_info_line(line, &mut info), ParseStatus::Done);
        assert_eq!(info.as_mmap().map(|m| m.dso), Some("/tmp/jit.so"));
        assert_eq!(info.as_mmap().map(|m| m.off), Some(0x2000));
    }

    #[test]
    fn test_fork_line() {
        let line = "bash 200/200 3.000001: PERF_RECORD_FORK(201:201):(200:200)";
        let mut info = InfoSample::default();
        assert_eq!(parse_info_line(line, &mut info), ParseStatus::Done);
        let fork = info.as_fork().copied().unwrap_or_default();
        assert_eq!(fork.cpid, Pid(201));
        assert_eq!(fork.ctid, Tid(201));
        assert_eq!(fork.ppid, Pid(200));
        assert_eq!(fork.ptid, Tid(200));
    }

    #[test]
    fn test_comm_line() {
        let line = "bash 201/201 3.000002: PERF_RECORD_COMM exec: my:app:201/201";
        let mut info = InfoSample::default();
        assert_eq!(parse_info_line(line, &mut info), ParseStatus::Done);
        let comm = info.as_comm().copied().unwrap_or_default();
        assert!(comm.exec);
        assert_eq!(comm.comm, "my:app");
        assert_eq!(comm.pid, Pid(201));
    }

    #[test]
    fn test_other_info_event_is_unused() {
        let line = "bash 201/201 3.000002: PERF_RECORD_EXIT(201:201):(200:200)";
        let mut info = InfoSample::default();
        assert!(matches!(parse_info_line(line, &mut info), ParseStatus::Continue(_)));
        assert!(!info.is_active());
    }

    #[test]
    fn test_strip_deleted() {
        assert_eq!(strip_deleted("/a/b.so (deleted)"), "/a/b.so");
        assert_eq!(strip_deleted("/a/b.so"), "/a/b.so");
    }
}

use crate::collectors::classify::classify_command_line;
use crate::collectors::filter::ProcessFilter;
use crate::collectors::{CollectError, Collector, Interrupt};
use crate::state::{now_unix, ProcessRecord, ProcessStatus, TextReport, TickSnapshot};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::pty::openpty;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use regex::bytes::Regex;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::ops::Range;
use std::os::fd::AsRawFd;
use std::process::{Child, Command, Stdio};
use std::time::Duration;
use tracing::{debug, info, warn};

const BANNER_PATTERN: &str = r"(?-u)top - .*load average:";
const READ_CHUNK: usize = 8192;
const OUTPUT_WIDTH: &str = "512";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Incomplete,
    Report(String),
}

pub struct ReportFramer {
    banner: Regex,
    buffer: Vec<u8>,
    pending_banner: Vec<u8>,
}

impl Default for ReportFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl ReportFramer {
    pub fn new() -> Self {
        Self {
            banner: Regex::new(BANNER_PATTERN).expect("banner pattern is valid"),
            buffer: Vec::new(),
            pending_banner: Vec::new(),
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn next_frame(&mut self) -> Option<Frame> {
        let (start, end) = {
            let m = self.banner.find(&self.buffer)?;
            (m.start(), m.end())
        };

        let body: Vec<u8> = self.buffer.drain(..end).collect();
        let (before, banner) = body.split_at(start);
        let previous = std::mem::replace(&mut self.pending_banner, banner.to_vec());

        if before.is_empty() || previous.is_empty() {
            return Some(Frame::Incomplete);
        }
        let mut report = previous;
        report.extend_from_slice(before);
        Some(Frame::Report(String::from_utf8_lossy(&report).into_owned()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnLayout {
    pid: Range<usize>,
    cpu: Range<usize>,
    mem: Range<usize>,
    command_start: usize,
    compact: Vec<Range<usize>>,
    fields: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ParsedRow {
    pub record: ProcessRecord,
    pub command: String,
    pub prefix: String,
    pub compact_prefix: String,
}

impl ColumnLayout {
    pub fn from_header(header: &str) -> Option<Self> {
        let column = |name: &str| header.find(name).map(|b| header[..b].chars().count());
        let chars: Vec<char> = header.chars().collect();

        let pid_end = column("PID")? + "PID".len();
        let cpu_at = column("%CPU")?;
        let cpu_end = cpu_at + "%CPU".len();
        let mem_end = column("%MEM")? + "%MEM".len();
        let command_start = column("COMMAND")?;
        let ni_end = column("NI").map(|i| i + "NI".len()).unwrap_or(pid_end);
        // %CPU is right-aligned: its values may start anywhere after the
        // previous column's text.
        let cpu_start = preceding_token_end(&chars, cpu_at);

        if !(pid_end <= cpu_start && cpu_end <= mem_end && mem_end <= command_start) {
            return None;
        }

        let fields = slice_chars(&chars, &(0..command_start))
            .split_whitespace()
            .map(str::to_string)
            .collect();

        Some(Self {
            pid: 0..pid_end,
            cpu: cpu_start..cpu_end,
            mem: cpu_end..mem_end,
            command_start,
            compact: vec![
                0..pid_end,
                ni_end..mem_end,
                command_start.saturating_sub(1)..chars.len(),
            ],
            fields,
        })
    }

    pub fn compact_header(&self, header: &str) -> String {
        let chars: Vec<char> = header.chars().collect();
        self.compact.iter().map(|r| slice_chars(&chars, r)).collect()
    }

    pub fn parse_row(&self, line: &str) -> Option<ParsedRow> {
        let chars: Vec<char> = line.chars().collect();
        if chars.len() <= self.command_start {
            return None;
        }
        let prefix_chars = &chars[..self.command_start];

        let pid = slice_chars(prefix_chars, &self.pid).trim().parse::<u32>().ok()?;
        let cpu_percent = parse_decimal(&slice_chars(prefix_chars, &self.cpu))?;
        let memory_percent = parse_decimal(&slice_chars(prefix_chars, &self.mem))?;

        let prefix: String = prefix_chars.iter().collect();
        let mut record = ProcessRecord {
            cpu_percent,
            memory_percent,
            ..ProcessRecord::new(pid, String::new())
        };
        self.fill_optional_fields(&prefix, &mut record);

        Some(ParsedRow {
            record,
            command: chars[self.command_start..].iter().collect(),
            compact_prefix: self.compact.iter().map(|r| slice_chars(prefix_chars, r)).collect(),
            prefix,
        })
    }

    fn fill_optional_fields(&self, prefix: &str, record: &mut ProcessRecord) {
        let cells: Vec<&str> = prefix.split_whitespace().collect();
        if cells.len() != self.fields.len() {
            return;
        }
        for (field, cell) in self.fields.iter().zip(cells) {
            match field.as_str() {
                "USER" => record.username = cell.to_string(),
                "VIRT" => record.virtual_memory_kib = parse_kib(cell).unwrap_or(0),
                "RES" => record.resident_memory_kib = parse_kib(cell).unwrap_or(0),
                "SHR" => record.shared_memory_kib = parse_kib(cell).unwrap_or(0),
                "S" => {
                    if let Some(c) = cell.chars().next() {
                        record.status = ProcessStatus::from_state_char(c);
                    }
                }
                "TIME+" | "TIME" => record.cpu_time_secs = parse_cpu_time(cell).unwrap_or(0.0),
                _ => {}
            }
        }
    }
}

pub struct ReportParser {
    filter: ProcessFilter,
    max_rows: usize,
    layout: Option<ColumnLayout>,
}

impl ReportParser {
    pub fn new(filter: ProcessFilter, max_rows: usize) -> Self {
        Self {
            filter,
            max_rows,
            layout: None,
        }
    }

    pub fn invalidate_layout(&mut self) {
        self.layout = None;
    }

    pub fn parse(&mut self, report: &str, timestamp: i64) -> TickSnapshot {
        let lines: Vec<&str> = report.lines().collect();
        let mut text = TextReport::default();
        let mut processes = Vec::new();

        let header_at = lines.iter().position(|l| l.contains("PID"));
        let summary_end = header_at.unwrap_or(lines.len());
        for line in &lines[..summary_end] {
            text.compact.push(line.to_string());
            text.full.push(line.to_string());
        }

        if let Some(header_at) = header_at {
            let header = lines[header_at];
            if self.layout.is_none() {
                self.layout = ColumnLayout::from_header(header);
                match &self.layout {
                    Some(_) => debug!(header, "column layout derived"),
                    None => warn!(header, "cannot derive column layout from header"),
                }
            }

            match self.layout.as_ref() {
                Some(layout) => {
                    text.compact.push(layout.compact_header(header));
                    text.full.push(header.to_string());
                    let rows = self.parse_rows(layout, &lines[header_at + 1..]);
                    for (record, compact, full) in rows {
                        text.compact.push(compact);
                        text.full.push(full);
                        processes.push(record);
                    }
                }
                None => {
                    text.compact.push(header.to_string());
                    text.full.push(header.to_string());
                }
            }
        }

        TickSnapshot {
            timestamp,
            system: None,
            processes,
            text: Some(text),
        }
    }

    fn parse_rows(&self, layout: &ColumnLayout, lines: &[&str]) -> Vec<(ProcessRecord, String, String)> {
        let mut rows = Vec::new();
        for line in lines {
            if rows.len() >= self.max_rows {
                break;
            }
            let Some(row) = layout.parse_row(line) else {
                if !line.trim().is_empty() {
                    debug!(line, "skipping malformed process row");
                }
                continue;
            };
            if !self.filter.accepts(&row.command) {
                continue;
            }

            let label = classify_command_line(&row.command);
            let compact = format!("{}{}", row.compact_prefix, label);
            let full = format!("{}{}", row.prefix, label);
            let record = ProcessRecord {
                display_name: label,
                ..row.record
            };
            rows.push((record, compact, full));
        }
        rows.sort_by(|a, b| b.0.cpu_percent.total_cmp(&a.0.cpu_percent));
        rows
    }
}

pub struct TopCollector {
    command: String,
    child: Child,
    stream: File,
    framer: ReportFramer,
    parser: ReportParser,
    stopped: bool,
}

impl TopCollector {
    pub fn spawn(
        command: &str,
        interval: Duration,
        filter: ProcessFilter,
        max_rows: usize,
    ) -> Result<Self, CollectError> {
        let pty = openpty(None, None)?;
        for fd in [&pty.master, &pty.slave] {
            fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
        }
        let stream = File::from(pty.master);
        let terminal = File::from(pty.slave);

        // Parent copies of the terminal end close when `Command` drops.
        let child = Command::new(command)
            .args(top_args(interval))
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(terminal.try_clone()?)
            .stderr(terminal)
            .spawn()
            .map_err(|source| CollectError::Spawn {
                command: command.to_string(),
                source,
            })?;
        info!(command, pid = child.id(), "text-stream collector started");

        Ok(Self {
            command: command.to_string(),
            child,
            stream,
            framer: ReportFramer::new(),
            parser: ReportParser::new(filter, max_rows),
            stopped: false,
        })
    }

    // Never called automatically; a changed header keeps the old slices.
    #[allow(dead_code)]
    pub fn invalidate_layout(&mut self) {
        self.parser.invalidate_layout();
    }

    fn fill(&mut self) -> Result<(), CollectError> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Err(self.closed()),
                Ok(n) => {
                    self.framer.push(&chunk[..n]);
                    return Ok(());
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                // Linux reports a hung-up pty master as EIO rather than EOF.
                Err(err) if err.raw_os_error() == Some(Errno::EIO as i32) => return Err(self.closed()),
                Err(err) => return Err(CollectError::Io(err)),
            }
        }
    }

    fn closed(&self) -> CollectError {
        CollectError::StreamClosed {
            command: self.command.clone(),
        }
    }
}

impl Collector for TopCollector {
    fn sample(&mut self) -> Result<Option<TickSnapshot>, CollectError> {
        let report = loop {
            match self.framer.next_frame() {
                Some(Frame::Report(report)) => break report,
                Some(Frame::Incomplete) => return Ok(None),
                None => self.fill()?,
            }
        };
        Ok(Some(self.parser.parse(&report, now_unix())))
    }

    fn name(&self) -> &'static str {
        "top"
    }

    fn interrupt(&self) -> Option<Interrupt> {
        let pid = Pid::from_raw(self.child.id() as i32);
        Some(Interrupt::new(move || {
            if let Err(err) = signal::kill(pid, Signal::SIGTERM) {
                debug!(%pid, error = %err, "interrupt signal not delivered");
            }
        }))
    }

    fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        if let Ok(Some(_)) = self.child.try_wait() {
            return;
        }
        let pid = Pid::from_raw(self.child.id() as i32);
        if let Err(err) = signal::kill(pid, Signal::SIGTERM) {
            warn!(pid = self.child.id(), error = %err, "SIGTERM failed, killing");
            let _ = self.child.kill();
        }
        match self.child.wait() {
            Ok(status) => debug!(%status, "text-stream collector exited"),
            Err(err) => warn!(error = %err, "failed to reap text-stream collector"),
        }
    }
}

impl Drop for TopCollector {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn top_args(interval: Duration) -> Vec<String> {
    vec![
        "-c".to_string(),
        "-b".to_string(),
        "-d".to_string(),
        interval.as_secs_f64().to_string(),
        "-o".to_string(),
        "%CPU".to_string(),
        "-w".to_string(),
        OUTPUT_WIDTH.to_string(),
    ]
}

fn preceding_token_end(chars: &[char], idx: usize) -> usize {
    let mut i = idx.min(chars.len());
    while i > 0 && chars[i - 1].is_whitespace() {
        i -= 1;
    }
    i
}

fn slice_chars(chars: &[char], range: &Range<usize>) -> String {
    let end = range.end.min(chars.len());
    let start = range.start.min(end);
    chars[start..end].iter().collect()
}

fn parse_decimal(input: &str) -> Option<f64> {
    let trimmed = input.trim();
    if let Ok(v) = trimmed.parse::<f64>() {
        return Some(v);
    }
    trimmed.replace(',', ".").parse::<f64>().ok()
}

fn parse_kib(cell: &str) -> Option<u64> {
    let scale = match cell.chars().last()? {
        'k' | 'K' => 1.0,
        'm' | 'M' => 1024.0,
        'g' | 'G' => 1024.0 * 1024.0,
        't' | 'T' => 1024.0 * 1024.0 * 1024.0,
        'p' | 'P' => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return parse_decimal(cell).map(|v| v.round() as u64),
    };
    let number = &cell[..cell.len() - 1];
    parse_decimal(number).map(|v| (v * scale).round() as u64)
}

fn parse_cpu_time(cell: &str) -> Option<f64> {
    cell.split(':')
        .try_fold(0.0, |acc, part| parse_decimal(part).map(|v| acc * 60.0 + v))
}

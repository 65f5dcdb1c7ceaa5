//! Append-only changelog. One entry per line, UTF-8, local-zone timestamps.
//!
//! ```text
//! [<YYYY-MM-DD HH:MM:SS>] CLONE [<from>] [<to>]
//! [<YYYY-MM-DD HH:MM:SS>] PULL  [<since>] [<from>] [<to>]
//! [<YYYY-MM-DD HH:MM:SS>] PUSH  [<from>] [<to>]
//! [<YYYY-MM-DD HH:MM:SS>] UPDATE <txn-id> <field> <old> → <new>
//! [<YYYY-MM-DD HH:MM:SS>] APPLY  <txn-id> RULE <rule-id> <field> <old> → <new>
//! ```
//!
//! `DIFF` lines share the record grammar but go to stdout only, never to the
//! file. Workflow entries are buffered and appended in one batch so the
//! header always precedes its records and is only written once the workflow's
//! mutations have succeeded.

use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDate, NaiveDateTime};
use regex::Regex;
use std::sync::OnceLock;

use crate::dates::DateWindow;
use crate::error::{FinchError, Result};

const TIMESTAMP_FMT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    Clone {
        window: DateWindow,
    },
    Pull {
        since: Option<NaiveDateTime>,
        window: DateWindow,
    },
    Push {
        window: DateWindow,
    },
    Update {
        txn_id: i64,
        field: String,
        /// None when the entry records a creation; the arrow is omitted.
        old: Option<String>,
        new: String,
    },
    Apply {
        txn_id: i64,
        rule_id: i64,
        field: String,
        old: String,
        new: String,
    },
}

fn bracket(date: Option<NaiveDate>) -> String {
    match date {
        Some(d) => format!("[{}]", d.format("%Y-%m-%d")),
        None => "[]".to_string(),
    }
}

impl Entry {
    fn render(&self, timestamp: NaiveDateTime) -> String {
        let ts = timestamp.format(TIMESTAMP_FMT);
        let mut line = format!("[{ts}] ");
        match self {
            Entry::Clone { window } => {
                let _ = write!(
                    line,
                    "CLONE {} {}",
                    bracket(window.from),
                    bracket(window.to)
                );
            }
            Entry::Pull { since, window } => {
                let since_str = match since {
                    Some(t) => format!("[{}]", t.format(TIMESTAMP_FMT)),
                    None => "[]".to_string(),
                };
                let _ = write!(
                    line,
                    "PULL  {since_str} {} {}",
                    bracket(window.from),
                    bracket(window.to)
                );
            }
            Entry::Push { window } => {
                let _ = write!(line, "PUSH  {} {}", bracket(window.from), bracket(window.to));
            }
            Entry::Update {
                txn_id,
                field,
                old,
                new,
            } => match old {
                Some(old) => {
                    let _ = write!(line, "UPDATE {txn_id} {field} {old} → {new}");
                }
                None => {
                    let _ = write!(line, "UPDATE {txn_id} {field} {new}");
                }
            },
            Entry::Apply {
                txn_id,
                rule_id,
                field,
                old,
                new,
            } => {
                let _ = write!(line, "APPLY  {txn_id} RULE {rule_id} {field} {old} → {new}");
            }
        }
        line
    }
}

/// Render a `DIFF` line for stdout. Deliberately not an `Entry`: the grammar
/// forbids it in the file.
pub fn render_diff_line(txn_id: i64, field: &str, local: &str, remote: &str) -> String {
    let ts = Local::now().format(TIMESTAMP_FMT);
    format!("[{ts}] DIFF   {txn_id} {field} {local} <> {remote}")
}

fn entry_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\[(\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2})\]\s+(\w+)\s*(.*)$").unwrap()
    })
}

#[derive(Debug, Clone)]
pub struct ParsedEntry {
    pub timestamp: NaiveDateTime,
    pub operation: String,
    pub details: Vec<String>,
}

/// Watermark for the next delta fetch: the most recent CLONE or PULL.
#[derive(Debug, Clone)]
pub struct SyncInfo {
    pub timestamp: NaiveDateTime,
    pub window: DateWindow,
}

pub struct Changelog {
    path: PathBuf,
}

impl Changelog {
    pub fn new(path: PathBuf) -> Changelog {
        Changelog { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Append a workflow batch: header first, then its records, one write.
    pub fn append_batch(&self, header: &Entry, records: &[Entry]) -> Result<()> {
        let now = Local::now().naive_local();
        let mut block = String::new();
        block.push_str(&header.render(now));
        block.push('\n');
        for record in records {
            block.push_str(&record.render(now));
            block.push('\n');
        }
        self.append_raw(&block)
    }

    /// Append standalone records (rule apply, transfer marking).
    pub fn append_records(&self, records: &[Entry]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let now = Local::now().naive_local();
        let mut block = String::new();
        for record in records {
            block.push_str(&record.render(now));
            block.push('\n');
        }
        self.append_raw(&block)
    }

    fn append_raw(&self, block: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(block.as_bytes())?;
        Ok(())
    }

    pub fn read_entries(&self) -> Result<Vec<ParsedEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.path)?;
        let mut entries = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Some(caps) = entry_re().captures(line) else {
                continue;
            };
            let timestamp = NaiveDateTime::parse_from_str(&caps[1], TIMESTAMP_FMT)
                .map_err(|e| FinchError::Store(format!("bad changelog timestamp: {e}")))?;
            let details = caps[3]
                .split_whitespace()
                .map(str::to_string)
                .collect::<Vec<_>>();
            entries.push(ParsedEntry {
                timestamp,
                operation: caps[2].to_string(),
                details,
            });
        }
        Ok(entries)
    }

    /// Latest CLONE or PULL entry, if any. The stored window becomes the
    /// default scope of the next pull.
    pub fn last_sync_info(&self) -> Result<Option<SyncInfo>> {
        let entries = self.read_entries()?;
        for entry in entries.iter().rev() {
            let window_details: &[String] = match entry.operation.as_str() {
                "CLONE" => &entry.details,
                // PULL details are [since] [from] [to]; skip the since token.
                "PULL" => entry.details.get(1..).unwrap_or(&[]),
                _ => continue,
            };
            let window = DateWindow {
                from: parse_bracketed_date(window_details.first()),
                to: parse_bracketed_date(window_details.get(1)),
            };
            return Ok(Some(SyncInfo {
                timestamp: entry.timestamp,
                window,
            }));
        }
        Ok(None)
    }
}

fn parse_bracketed_date(token: Option<&String>) -> Option<NaiveDate> {
    let token = token?;
    let inner = token.strip_prefix('[')?.strip_suffix(']')?;
    NaiveDate::parse_from_str(inner, "%Y-%m-%d").ok()
}

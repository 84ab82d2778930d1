//! LIST response parser.
//!
//! Supports three formats:
//! 1. **Unix-style** (`ls -l`): `-rw-r--r-- 1 owner group 1234 Jan  1 12:00 file.txt`
//! 2. **DOS/IIS-style**: `01-01-26  12:00AM       1234 file.txt`
//! 3. **VMS-style**: `README.TXT;1  2/4  12-JAN-2024 10:20:30  [USER]  (RWED,RWED,,)`
//!
//! VMS servers put a long file name alone on one line and its details on
//! the next, so [`ListingTokenizer`] keeps state between lines.

use crate::ftp::types::{DirectoryEntry, EntryKind};
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use std::cmp::Ordering;

lazy_static! {
    static ref UNIX_RE: Regex = Regex::new(
        r"(?x)
        ^([dlcbps-])[rwxsStT-]{9}[+@.]?\s+      # type + permissions
        \d+\s+                                  # link count
        \S+\s+                                  # owner
        (?:\S+\s+)?                             # group (optional)
        (\d+)\s+                                # size
        ([A-Za-z]{3}\s+\d{1,2}\s+(?:\d{1,2}:\d{2}|\d{4}))\s+  # date
        (.+)$                                   # name, possibly with -> target
        "
    )
    .expect("valid unix listing regex");
    static ref DOS_RE: Regex = Regex::new(
        r"(?x)
        ^(\d{2}-\d{2}-\d{2,4})\s+               # date
        (\d{1,2}:\d{2}\s*(?:[AaPp][Mm])?)\s+    # time
        (<DIR>|\d+)\s+                          # size or <DIR>
        (.+)$                                   # name
        "
    )
    .expect("valid dos listing regex");
    static ref VMS_NAME_RE: Regex =
        Regex::new(r"^([^\s;]+);\d+$").expect("valid vms name regex");
    static ref VMS_RE: Regex = Regex::new(
        r"(?x)
        ^([^\s;]+);\d+\s+                       # name;version
        (\d+)(?:/\d+)?\s+                       # used/allocated blocks
        (\d{1,2}-[A-Za-z]{3}-\d{4})\s+          # date
        (\d{1,2}:\d{2}(?::\d{2})?)              # time
        "
    )
    .expect("valid vms listing regex");
    static ref VMS_DETAILS_RE: Regex = Regex::new(
        r"^\s+(\d+)(?:/\d+)?\s+(\d{1,2}-[A-Za-z]{3}-\d{4})\s+(\d{1,2}:\d{2}(?::\d{2})?)"
    )
    .expect("valid vms continuation regex");
}

const VMS_BLOCK_SIZE: u64 = 512;

/// Per-listing tokenizer. Feed it every line of one LIST response in order.
#[derive(Debug)]
pub struct ListingTokenizer {
    now: DateTime<Utc>,
    pending_vms_name: Option<String>,
}

impl Default for ListingTokenizer {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl ListingTokenizer {
    /// `now` anchors year inference for Unix dates that carry a time
    /// instead of a year.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now,
            pending_vms_name: None,
        }
    }

    /// Tokenize one line. Returns `None` for headers, blank lines, `.`/`..`,
    /// the first half of a VMS two-line record, and anything unrecognised.
    pub fn tokenize(&mut self, line: &str) -> Option<DirectoryEntry> {
        let line = line.trim_end_matches(['\r', '\n']);

        if let Some(name) = self.pending_vms_name.take() {
            if let Some(caps) = VMS_DETAILS_RE.captures(line) {
                return vms_entry(&name, &caps[1], &caps[2], &caps[3]);
            }
        }

        if line.trim().is_empty() || line.starts_with("total ") {
            return None;
        }

        let entry = self
            .tokenize_unix(line)
            .or_else(|| tokenize_dos(line))
            .or_else(|| self.tokenize_vms(line))?;

        if entry.name == "." || entry.name == ".." {
            return None;
        }
        Some(entry)
    }

    fn tokenize_unix(&self, line: &str) -> Option<DirectoryEntry> {
        let caps = UNIX_RE.captures(line)?;
        let size = caps[2].parse::<u64>().unwrap_or(0);
        let modified = self.parse_unix_date(&caps[3]);
        let name_raw = &caps[4];

        let (name, kind) = match &caps[1] {
            "d" => (name_raw.to_string(), EntryKind::Directory),
            "-" => (name_raw.to_string(), EntryKind::File),
            "l" => match name_raw.split_once(" -> ") {
                Some((name, target)) => (
                    name.to_string(),
                    EntryKind::Symlink {
                        target: target.to_string(),
                    },
                ),
                None => (
                    name_raw.to_string(),
                    EntryKind::Symlink {
                        target: String::new(),
                    },
                ),
            },
            _ => return None,
        };

        Some(DirectoryEntry {
            name,
            kind,
            size,
            modified,
        })
    }

    /// "Jan  1 12:00" (year inferred) or "Jan  1  2025".
    fn parse_unix_date(&self, s: &str) -> Option<DateTime<Utc>> {
        let normalised = s.split_whitespace().collect::<Vec<_>>().join(" ");

        if normalised.contains(':') {
            let in_year = |year: i32| {
                NaiveDateTime::parse_from_str(&format!("{} {}", year, normalised), "%Y %b %d %H:%M")
                    .ok()
                    .map(|dt| Utc.from_utc_datetime(&dt))
            };
            let year = self.now.year();
            // A time instead of a year means "within the last six months".
            // Feb 29 only exists in some years, so a failed parse falls back too.
            return match in_year(year) {
                Some(dt) if dt <= self.now + Duration::days(1) => Some(dt),
                _ => in_year(year - 1),
            };
        }

        let date = NaiveDate::parse_from_str(&normalised, "%b %d %Y").ok()?;
        Some(Utc.from_utc_datetime(&date.and_time(NaiveTime::from_hms_opt(0, 0, 0)?)))
    }

    fn tokenize_vms(&mut self, line: &str) -> Option<DirectoryEntry> {
        if let Some(caps) = VMS_RE.captures(line) {
            return vms_entry(&caps[1], &caps[2], &caps[3], &caps[4]);
        }
        if let Some(caps) = VMS_NAME_RE.captures(line.trim()) {
            self.pending_vms_name = Some(caps[1].to_string());
        }
        None
    }
}

fn tokenize_dos(line: &str) -> Option<DirectoryEntry> {
    let caps = DOS_RE.captures(line)?;
    let (kind, size) = match &caps[3] {
        "<DIR>" => (EntryKind::Directory, 0),
        n => (EntryKind::File, n.parse::<u64>().unwrap_or(0)),
    };
    Some(DirectoryEntry {
        name: caps[4].to_string(),
        kind,
        size,
        modified: parse_dos_date(&caps[1], &caps[2]),
    })
}

fn parse_dos_date(date: &str, time: &str) -> Option<DateTime<Utc>> {
    let time: String = time.split_whitespace().collect::<String>().to_uppercase();
    let combined = format!("{} {}", date, time);
    let year_fmt = if date.len() > 8 { "%m-%d-%Y" } else { "%m-%d-%y" };
    [format!("{} %I:%M%p", year_fmt), format!("{} %H:%M", year_fmt)]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(&combined, fmt).ok())
        .map(|dt| Utc.from_utc_datetime(&dt))
}

fn vms_entry(name: &str, blocks: &str, date: &str, time: &str) -> Option<DirectoryEntry> {
    let (name, kind) = match name.strip_suffix(".DIR").or_else(|| name.strip_suffix(".dir")) {
        Some(dir) => (dir.to_string(), EntryKind::Directory),
        None => (name.to_string(), EntryKind::File),
    };
    let size = blocks.parse::<u64>().unwrap_or(0) * VMS_BLOCK_SIZE;
    Some(DirectoryEntry {
        name,
        kind,
        size,
        modified: parse_vms_date(date, time),
    })
}

/// "12-JAN-2024" + "10:20" or "10:20:30".
fn parse_vms_date(date: &str, time: &str) -> Option<DateTime<Utc>> {
    let mut parts = date.splitn(3, '-');
    let (day, month, year) = (parts.next()?, parts.next()?, parts.next()?);
    let month = format!("{}{}", &month[..1].to_uppercase(), &month[1..].to_lowercase());
    let time_fmt = if time.matches(':').count() == 2 { "%H:%M:%S" } else { "%H:%M" };
    NaiveDateTime::parse_from_str(
        &format!("{}-{}-{} {}", day, month, year, time),
        &format!("%d-%b-%Y {}", time_fmt),
    )
    .ok()
    .map(|dt| Utc.from_utc_datetime(&dt))
}

/// Directories first, then case-insensitive name, raw name as tiebreak.
pub fn compare_entries(a: &DirectoryEntry, b: &DirectoryEntry) -> Ordering {
    b.is_dir()
        .cmp(&a.is_dir())
        .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
        .then_with(|| a.name.cmp(&b.name))
}

pub fn sort_entries(entries: &mut [DirectoryEntry]) {
    entries.sort_by(compare_entries);
}

/// Parse and sort a full LIST response body.
pub fn parse_listing(raw: &str) -> Vec<DirectoryEntry> {
    parse_listing_at(raw, Utc::now())
}

pub fn parse_listing_at(raw: &str, now: DateTime<Utc>) -> Vec<DirectoryEntry> {
    let mut tokenizer = ListingTokenizer::new(now);
    let mut entries: Vec<DirectoryEntry> = raw
        .split('\n')
        .filter_map(|line| tokenizer.tokenize(line))
        .collect();
    sort_entries(&mut entries);
    entries
}

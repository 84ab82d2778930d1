//! FTP replies (RFC 959 §4.2): the reply value, the line-fed parser shared
//! by the blocking and async codecs, and the code taxonomy.
//!
//! A reply is one or more physical lines:
//! ```text
//! 220 Welcome
//!
//! 211-Features:
//!  MDTM
//!  SIZE
//! 211 End
//! ```
//! A multi-line reply is opened by `DDD-` and only closed by a line that
//! starts with the same three digits followed by a space.

use crate::ftp::error::{FtpError, FtpResult};
use serde::Serialize;

/// One logical server response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    /// Message text; the lines of a multi-line reply are joined with `\n`.
    pub message: String,
    pub is_multi_line: bool,
}

impl Reply {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            is_multi_line: false,
        }
    }

    pub fn category(&self) -> ReplyCategory {
        classify(self.code).0
    }

    pub fn subject(&self) -> ReplySubject {
        classify(self.code).1
    }

    /// Message lines, in server order.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.message.split('\n')
    }

    pub fn is_preliminary(&self) -> bool {
        self.category() == ReplyCategory::Preliminary
    }

    pub fn is_completion(&self) -> bool {
        self.category() == ReplyCategory::Completion
    }
}

// ─── Taxonomy ────────────────────────────────────────────────────────

/// First digit of a reply code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ReplyCategory {
    /// 1yz
    Preliminary,
    /// 2yz
    Completion,
    /// 3yz
    Intermediate,
    /// 4yz
    TransientNegative,
    /// 5yz
    PermanentNegative,
}

/// Second digit of a reply code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ReplySubject {
    /// x0z
    Syntax,
    /// x1z
    Information,
    /// x2z
    Connection,
    /// x3z
    Authentication,
    /// x4z and anything the RFC leaves unassigned
    Unspecified,
    /// x5z
    FileSystem,
}

impl ReplySubject {
    pub(crate) fn transient_label(&self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::FileSystem => "filesystem",
            _ => "other",
        }
    }

    pub(crate) fn permanent_label(&self) -> &'static str {
        match self {
            Self::Syntax => "syntax failed",
            Self::Authentication => "authentication failed",
            Self::FileSystem => "file action failed",
            _ => "fatal error",
        }
    }
}

/// Map a reply code to its completion category and subject.
///
/// Codes reaching this function have been validated by the parser
/// (first digit 1–5); anything above 5yz is folded into
/// `PermanentNegative`.
pub fn classify(code: u16) -> (ReplyCategory, ReplySubject) {
    let category = match code / 100 {
        0 | 1 => ReplyCategory::Preliminary,
        2 => ReplyCategory::Completion,
        3 => ReplyCategory::Intermediate,
        4 => ReplyCategory::TransientNegative,
        _ => ReplyCategory::PermanentNegative,
    };
    let subject = match (code / 10) % 10 {
        0 => ReplySubject::Syntax,
        1 => ReplySubject::Information,
        2 => ReplySubject::Connection,
        3 => ReplySubject::Authentication,
        5 => ReplySubject::FileSystem,
        _ => ReplySubject::Unspecified,
    };
    (category, subject)
}

/// Accept `reply` if its code is in `acceptable`, otherwise turn it into
/// the error its category calls for.
pub fn check(reply: &Reply, acceptable: &[u16]) -> FtpResult<()> {
    if acceptable.contains(&reply.code) {
        return Ok(());
    }
    let (category, subject) = classify(reply.code);
    Err(match category {
        ReplyCategory::TransientNegative => FtpError::TransientNegative {
            subject,
            code: reply.code,
            message: reply.message.clone(),
        },
        ReplyCategory::PermanentNegative => FtpError::PermanentNegative {
            subject,
            code: reply.code,
            message: reply.message.clone(),
        },
        _ => FtpError::unexpected(reply.code, reply.message.clone()),
    })
}

// ─── Parser ──────────────────────────────────────────────────────────

/// Outcome of feeding the first line of a reply.
#[derive(Debug)]
pub(crate) enum ReplyStart {
    Complete(Reply),
    Continue(ReplyParser),
}

/// Accumulator for a multi-line reply. Both codecs drive the same parser,
/// one physical line at a time.
#[derive(Debug)]
pub(crate) struct ReplyParser {
    code: u16,
    end_prefix: [u8; 4],
    dash_prefix: [u8; 4],
    message: String,
    lines: usize,
    max_lines: usize,
}

fn strip_eol(line: &str) -> &str {
    line.strip_suffix('\n')
        .map(|l| l.strip_suffix('\r').unwrap_or(l))
        .unwrap_or(line)
}

fn parse_code(line: &[u8]) -> Option<u16> {
    match line {
        [a @ b'1'..=b'5', b @ b'0'..=b'9', c @ b'0'..=b'9', ..] => Some(
            (*a - b'0') as u16 * 100 + (*b - b'0') as u16 * 10 + (*c - b'0') as u16,
        ),
        _ => None,
    }
}

impl ReplyParser {
    /// Parse the first physical line of a reply.
    pub(crate) fn start(line: &str, max_lines: usize) -> FtpResult<ReplyStart> {
        let line = strip_eol(line);
        let bytes = line.as_bytes();
        if bytes.len() < 4 {
            return Err(FtpError::bad_answer(format!("reply too short: '{}'", line)));
        }
        let code = parse_code(bytes)
            .ok_or_else(|| FtpError::bad_answer(format!("invalid reply code in '{}'", line)))?;
        let text = line.get(4..).unwrap_or_default();

        if bytes[3] != b'-' {
            return Ok(ReplyStart::Complete(Reply::new(code, text)));
        }

        Ok(ReplyStart::Continue(ReplyParser {
            code,
            end_prefix: [bytes[0], bytes[1], bytes[2], b' '],
            dash_prefix: [bytes[0], bytes[1], bytes[2], b'-'],
            message: text.to_string(),
            lines: 1,
            max_lines,
        }))
    }

    /// Feed one continuation line. Returns the finished reply once the
    /// closing `DDD ` line has been seen.
    pub(crate) fn feed(&mut self, line: &str) -> FtpResult<Option<Reply>> {
        let line = strip_eol(line);
        let bytes = line.as_bytes();

        self.lines += 1;
        if self.lines > self.max_lines {
            return Err(FtpError::bad_answer(format!(
                "reply {} exceeds {} lines",
                self.code, self.max_lines
            )));
        }

        self.message.push('\n');
        if bytes.starts_with(&self.end_prefix) {
            self.message.push_str(&line[4..]);
            return Ok(Some(Reply {
                code: self.code,
                message: std::mem::take(&mut self.message),
                is_multi_line: true,
            }));
        }
        if bytes.starts_with(&self.dash_prefix) {
            self.message.push_str(&line[4..]);
        } else {
            self.message.push_str(line);
        }
        Ok(None)
    }
}

/// Parse a complete, already-buffered reply.
pub fn parse_reply(raw: &str) -> FtpResult<Reply> {
    parse_reply_with_limit(raw, usize::MAX)
}

pub(crate) fn parse_reply_with_limit(raw: &str, max_lines: usize) -> FtpResult<Reply> {
    let mut lines = raw.split_inclusive('\n');
    let first = lines
        .next()
        .ok_or_else(|| FtpError::bad_answer("empty reply"))?;
    let mut parser = match ReplyParser::start(first, max_lines)? {
        ReplyStart::Complete(reply) => return Ok(reply),
        ReplyStart::Continue(parser) => parser,
    };
    for line in lines {
        if let Some(reply) = parser.feed(line)? {
            return Ok(reply);
        }
    }
    Err(FtpError::bad_answer(format!(
        "multi-line reply {} is not terminated",
        parser.code
    )))
}

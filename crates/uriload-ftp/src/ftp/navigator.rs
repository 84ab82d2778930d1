//! Working-directory cache.
//!
//! A session only trusts its cached directory after a successful `PWD` or
//! `CWD`. `CWD` is sent only when the wanted directory differs from the
//! cached one; a failed `CWD` clears the cache.

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::protocol::Command;
use crate::ftp::reply::{check, Reply};

/// Next control-channel action needed to reach a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavStep {
    Pwd,
    Cwd(String),
    Done,
}

impl NavStep {
    pub fn command(&self) -> Option<Command> {
        match self {
            Self::Pwd => Some(Command::Pwd),
            Self::Cwd(dir) => Some(Command::Cwd(dir.clone())),
            Self::Done => None,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct WorkingDirectory {
    cached: Option<String>,
}

impl WorkingDirectory {
    pub fn current(&self) -> Option<&str> {
        self.cached.as_deref()
    }

    pub fn invalidate(&mut self) {
        if let Some(dir) = self.cached.take() {
            log::debug!("working directory cache {} invalidated", dir);
        }
    }

    /// `target` must already be normalised with [`normalize_dir`].
    pub fn next_step(&self, target: &str) -> NavStep {
        match self.cached.as_deref() {
            None => NavStep::Pwd,
            Some(cwd) if cwd == target => NavStep::Done,
            Some(_) => NavStep::Cwd(target.to_string()),
        }
    }

    /// Apply the reply to the step returned by [`next_step`](Self::next_step).
    pub fn apply(&mut self, step: &NavStep, reply: &Reply) -> FtpResult<()> {
        match step {
            NavStep::Pwd => {
                let dir = parse_pwd(reply)?;
                log::debug!("server working directory is {}", dir);
                self.cached = Some(dir);
                Ok(())
            }
            NavStep::Cwd(dir) => match check(reply, &[250]) {
                Ok(()) => {
                    self.cached = Some(dir.clone());
                    Ok(())
                }
                Err(e) => {
                    self.cached = None;
                    Err(e)
                }
            },
            NavStep::Done => Ok(()),
        }
    }
}

/// Extract the directory from a `257 "<dir>" ...` reply.
pub fn parse_pwd(reply: &Reply) -> FtpResult<String> {
    check(reply, &[257])?;
    let text = &reply.message;
    match (text.find('"'), text.rfind('"')) {
        (Some(first), Some(last)) if last > first => {
            Ok(normalize_dir(&text[first + 1..last].replace("\"\"", "\"")))
        }
        _ => Err(FtpError::bad_answer(format!("no quoted path in PWD reply: {}", text))),
    }
}

/// Absolute form with exactly one trailing `/`.
pub fn normalize_dir(dir: &str) -> String {
    let trimmed = dir.trim_end_matches('/');
    let mut out = String::with_capacity(trimmed.len() + 2);
    if !trimmed.starts_with('/') {
        out.push('/');
    }
    out.push_str(trimmed);
    out.push('/');
    out
}

/// Directory containing `path`. A path that already ends in `/` is its own
/// directory.
pub fn parent_dir(path: &str) -> String {
    if path.ends_with('/') {
        return normalize_dir(path);
    }
    match path.rfind('/') {
        Some(idx) => normalize_dir(&path[..idx]),
        None => "/".to_string(),
    }
}

/// Final path segment, empty for directory paths.
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or_default()
}

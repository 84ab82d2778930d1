//! Low-level FTP command/reply codec (RFC 959 §4).
//!
//! Handles:
//! - Formatting commands and sending them terminated with `\r\n`
//! - Reading single-line and multi-line replies with bounded line length
//! - Logging the control dialogue (`>>>` / `<<<`), with PASS masked
//!
//! [`FtpCodec`] runs on tokio, [`BlockingCodec`] on `std::io`. Both feed
//! the same [`ReplyParser`].

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::reply::{Reply, ReplyParser, ReplyStart};
use crate::ftp::types::{FtpLoaderConfig, TransferType};
use std::fmt;
use std::io::{self, BufRead, Read, Write};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

// ─── Commands ────────────────────────────────────────────────────────

/// Every command the engine sends on the control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    User(String),
    Pass(String),
    Feat,
    Pwd,
    Cwd(String),
    Pasv,
    List(String),
    Retr(String),
    Type(TransferType),
    Quit,
}

impl Command {
    pub fn verb(&self) -> &'static str {
        match self {
            Self::User(_) => "USER",
            Self::Pass(_) => "PASS",
            Self::Feat => "FEAT",
            Self::Pwd => "PWD",
            Self::Cwd(_) => "CWD",
            Self::Pasv => "PASV",
            Self::List(_) => "LIST",
            Self::Retr(_) => "RETR",
            Self::Type(_) => "TYPE",
            Self::Quit => "QUIT",
        }
    }

    /// Wire form with the CRLF terminator. An argument carrying a line
    /// break would reach the server as two commands, so it is refused.
    pub fn to_line(&self) -> FtpResult<String> {
        match self {
            Self::User(arg) | Self::Pass(arg) | Self::Cwd(arg) | Self::List(arg) | Self::Retr(arg)
                if arg.contains(['\r', '\n']) =>
            {
                Err(FtpError::InvalidUri(format!(
                    "line break in {} argument",
                    self.verb()
                )))
            }
            _ => Ok(format!("{}\r\n", self)),
        }
    }

    /// Text safe to put in a log line.
    pub fn log_text(&self) -> String {
        match self {
            Self::Pass(_) => "PASS ****".to_string(),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(arg)
            | Self::Pass(arg)
            | Self::Cwd(arg)
            | Self::List(arg)
            | Self::Retr(arg) => write!(f, "{} {}", self.verb(), arg),
            Self::Type(TransferType::Ascii) => f.write_str("TYPE A"),
            Self::Type(TransferType::Binary) => f.write_str("TYPE I"),
            other => f.write_str(other.verb()),
        }
    }
}

/// Bounds applied while reading replies.
#[derive(Debug, Clone, Copy)]
pub struct ReplyLimits {
    pub max_line_len: usize,
    pub max_lines: usize,
}

impl ReplyLimits {
    pub fn from_config(config: &FtpLoaderConfig) -> Self {
        Self {
            max_line_len: config.max_line_len,
            max_lines: config.max_multi_lines,
        }
    }
}

impl Default for ReplyLimits {
    fn default() -> Self {
        Self::from_config(&FtpLoaderConfig::default())
    }
}

/// Turn one raw, possibly unterminated line into text, or fail.
fn finish_line(buf: Vec<u8>, limits: &ReplyLimits) -> FtpResult<String> {
    if buf.is_empty() {
        return Err(FtpError::connection_closed());
    }
    if buf.last() != Some(&b'\n') {
        if buf.len() > limits.max_line_len {
            return Err(FtpError::bad_answer(format!(
                "reply line exceeds {} bytes",
                limits.max_line_len
            )));
        }
        return Err(FtpError::connection_closed());
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn log_reply(reply: &Reply) {
    log::trace!(
        "<<< {} {}",
        reply.code,
        reply.lines().last().unwrap_or_default()
    );
}

// ─── Async codec ─────────────────────────────────────────────────────

/// The async command/reply codec over any duplex byte stream.
pub struct FtpCodec<S> {
    stream: BufReader<S>,
    limits: ReplyLimits,
}

impl<S> FtpCodec<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, limits: ReplyLimits) -> Self {
        Self {
            stream: BufReader::new(stream),
            limits,
        }
    }

    /// Send a command, appending the CRLF terminator.
    pub async fn send(&mut self, cmd: &Command) -> FtpResult<()> {
        let line = cmd.to_line()?;
        self.stream.write_all(line.as_bytes()).await?;
        self.stream.flush().await?;
        log::trace!(">>> {}", cmd.log_text());
        Ok(())
    }

    async fn read_line(&mut self) -> FtpResult<String> {
        let mut buf = Vec::new();
        let cap = self.limits.max_line_len as u64 + 1;
        (&mut self.stream).take(cap).read_until(b'\n', &mut buf).await?;
        finish_line(buf, &self.limits)
    }

    /// Read one complete reply, single- or multi-line.
    pub async fn read_reply(&mut self) -> FtpResult<Reply> {
        let first = self.read_line().await?;
        let reply = match ReplyParser::start(&first, self.limits.max_lines)? {
            ReplyStart::Complete(reply) => reply,
            ReplyStart::Continue(mut parser) => loop {
                let line = self.read_line().await?;
                if let Some(reply) = parser.feed(&line)? {
                    break reply;
                }
            },
        };
        log_reply(&reply);
        Ok(reply)
    }

    /// Send a command and return its reply.
    pub async fn execute(&mut self, cmd: &Command) -> FtpResult<Reply> {
        self.send(cmd).await?;
        self.read_reply().await
    }

    pub fn get_ref(&self) -> &S {
        self.stream.get_ref()
    }
}

// ─── Blocking codec ──────────────────────────────────────────────────

/// The same codec over a blocking `std::io` stream.
pub struct BlockingCodec<S> {
    stream: io::BufReader<S>,
    limits: ReplyLimits,
}

fn map_blocking_io(e: io::Error) -> FtpError {
    match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
            FtpError::TimedOut("waiting for a reply")
        }
        _ => FtpError::Io(e),
    }
}

impl<S> BlockingCodec<S>
where
    S: Read + Write,
{
    pub fn new(stream: S, limits: ReplyLimits) -> Self {
        Self {
            stream: io::BufReader::new(stream),
            limits,
        }
    }

    /// Send a command in a single write. A short write is an error: the
    /// command must never be split across writes.
    pub fn send(&mut self, cmd: &Command) -> FtpResult<()> {
        let line = cmd.to_line()?;
        let sock = self.stream.get_mut();
        let n = sock.write(line.as_bytes()).map_err(map_blocking_io)?;
        if n != line.len() {
            return Err(FtpError::Io(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short write: {} of {} bytes", n, line.len()),
            )));
        }
        sock.flush().map_err(map_blocking_io)?;
        log::trace!(">>> {}", cmd.log_text());
        Ok(())
    }

    fn read_line(&mut self) -> FtpResult<String> {
        let mut buf = Vec::new();
        let cap = self.limits.max_line_len as u64 + 1;
        (&mut self.stream)
            .take(cap)
            .read_until(b'\n', &mut buf)
            .map_err(map_blocking_io)?;
        finish_line(buf, &self.limits)
    }

    pub fn read_reply(&mut self) -> FtpResult<Reply> {
        let first = self.read_line()?;
        let reply = match ReplyParser::start(&first, self.limits.max_lines)? {
            ReplyStart::Complete(reply) => reply,
            ReplyStart::Continue(mut parser) => loop {
                let line = self.read_line()?;
                if let Some(reply) = parser.feed(&line)? {
                    break reply;
                }
            },
        };
        log_reply(&reply);
        Ok(reply)
    }

    pub fn execute(&mut self, cmd: &Command) -> FtpResult<Reply> {
        self.send(cmd)?;
        self.read_reply()
    }

    pub fn get_ref(&self) -> &S {
        self.stream.get_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// In-memory duplex for the blocking codec: reads from a script,
    /// records writes.
    struct Script {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
        max_write: usize,
    }

    impl Script {
        fn new(input: &str) -> Self {
            Self {
                input: Cursor::new(input.as_bytes().to_vec()),
                output: Vec::new(),
                max_write: usize::MAX,
            }
        }
    }

    impl Read for Script {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            Read::read(&mut self.input, buf)
        }
    }

    impl Write for Script {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = buf.len().min(self.max_write);
            self.output.extend_from_slice(&buf[..n]);
            Ok(n)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn command_wire_text() {
        assert_eq!(Command::User("bob".into()).to_string(), "USER bob");
        assert_eq!(Command::Cwd("/pub/".into()).to_string(), "CWD /pub/");
        assert_eq!(Command::Type(TransferType::Binary).to_string(), "TYPE I");
        assert_eq!(Command::Pasv.to_string(), "PASV");
    }

    #[test]
    fn pass_is_masked_in_logs() {
        let cmd = Command::Pass("hunter2".into());
        assert_eq!(cmd.to_string(), "PASS hunter2");
        assert!(!cmd.log_text().contains("hunter2"));
    }

    #[test]
    fn line_break_in_argument_is_refused() {
        assert_eq!(Command::Retr("/a b".into()).to_line().unwrap(), "RETR /a b\r\n");
        for cmd in [
            Command::Cwd("/pub\r\nFEAT/".into()),
            Command::List("/x\n".into()),
            Command::Pass("pw\rQUIT".into()),
        ] {
            assert!(matches!(cmd.to_line(), Err(FtpError::InvalidUri(_))));
        }
    }

    #[tokio::test]
    async fn async_send_writes_nothing_for_a_split_command() {
        // The mock fails the test on any unexpected write.
        let mock = tokio_test::io::Builder::new().build();
        let mut codec = FtpCodec::new(mock, ReplyLimits::default());
        let err = codec.send(&Command::Cwd("/pub\r\nFEAT/".into())).await.unwrap_err();
        assert!(matches!(err, FtpError::InvalidUri(_)));
    }

    #[test]
    fn blocking_send_writes_nothing_for_a_split_command() {
        let mut codec = BlockingCodec::new(Script::new(""), ReplyLimits::default());
        assert!(codec.send(&Command::Retr("a\r\nDELE b".into())).is_err());
        assert!(codec.get_ref().output.is_empty());
    }

    #[tokio::test]
    async fn async_execute_reads_multi_line() {
        let mock = tokio_test::io::Builder::new()
            .write(b"FEAT\r\n")
            .read(b"211-Features:\r\n SIZE\r\n211 End\r\n")
            .build();
        let mut codec = FtpCodec::new(mock, ReplyLimits::default());
        let reply = codec.execute(&Command::Feat).await.unwrap();
        assert_eq!(reply.code, 211);
        assert_eq!(reply.message, "Features:\n SIZE\nEnd");
    }

    #[tokio::test]
    async fn async_reply_split_across_reads() {
        let mock = tokio_test::io::Builder::new()
            .read(b"22")
            .read(b"0 Wel")
            .read(b"come\r\n")
            .build();
        let mut codec = FtpCodec::new(mock, ReplyLimits::default());
        let reply = codec.read_reply().await.unwrap();
        assert_eq!((reply.code, reply.message.as_str()), (220, "Welcome"));
    }

    #[tokio::test]
    async fn async_eof_is_unexpected_eof() {
        let mock = tokio_test::io::Builder::new().read(b"220-hello\r\n").build();
        let mut codec = FtpCodec::new(mock, ReplyLimits::default());
        match codec.read_reply().await {
            Err(FtpError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn async_overlong_line_is_bad_answer() {
        let long = format!("220 {}\r\n", "x".repeat(64));
        let mock = tokio_test::io::Builder::new().read(long.as_bytes()).build();
        let limits = ReplyLimits {
            max_line_len: 16,
            max_lines: 8,
        };
        let mut codec = FtpCodec::new(mock, limits);
        assert!(matches!(
            codec.read_reply().await,
            Err(FtpError::BadAnswer(_))
        ));
    }

    #[test]
    fn blocking_execute() {
        let mut codec = BlockingCodec::new(Script::new("257 \"/home\"\r\n"), ReplyLimits::default());
        let reply = codec.execute(&Command::Pwd).unwrap();
        assert_eq!(reply.code, 257);
        assert_eq!(codec.get_ref().output, b"PWD\r\n");
    }

    #[test]
    fn blocking_short_write_is_error() {
        let mut script = Script::new("");
        script.max_write = 3;
        let mut codec = BlockingCodec::new(script, ReplyLimits::default());
        match codec.send(&Command::Pasv) {
            Err(FtpError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::WriteZero),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn blocking_eof_before_reply() {
        let mut codec = BlockingCodec::new(Script::new(""), ReplyLimits::default());
        assert!(codec.read_reply().unwrap_err().is_io());
    }
}

//! Async control session: one logged-in control connection.
//!
//! Every command/reply pair goes through [`AsyncSession::exchange`], which
//! races the caller's cancellation token and the command timeout. The
//! bookkeeping that keeps the control channel paired (busy flag, pending
//! reply, dead detection) lives in [`SessionState`] and is shared with the
//! blocking session.

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::login::{LoginMachine, LoginStep};
use crate::ftp::navigator::WorkingDirectory;
use crate::ftp::parser;
use crate::ftp::protocol::{Command, FtpCodec, ReplyLimits};
use crate::ftp::reply::{check, Reply};
use crate::ftp::transfer;
use crate::ftp::types::{DirectoryEntry, FeatureSet, FtpLoaderConfig, FtpTarget};
use std::fmt;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

// ─── Session key ─────────────────────────────────────────────────────

/// Identity of a control connection in the session table.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

impl SessionKey {
    pub fn from_target(target: &FtpTarget) -> Self {
        Self {
            host: target.host.clone(),
            port: target.port,
            user: target.user.clone(),
            password: target.password.clone(),
        }
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKey")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"****")
            .finish()
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

// ─── Shared bookkeeping ──────────────────────────────────────────────

/// State shared by the blocking and async sessions.
///
/// `busy` is set from the moment a command starts being written until its
/// reply has been read. `reply_pending` is set once the command is fully
/// written, and again while a transfer's final reply is outstanding.
#[derive(Debug)]
pub struct SessionState {
    key: SessionKey,
    features: FeatureSet,
    pub(crate) cwd: WorkingDirectory,
    busy: bool,
    reply_pending: bool,
    dead: bool,
    last_used: Instant,
}

impl SessionState {
    pub(crate) fn new(key: SessionKey) -> Self {
        Self {
            key,
            features: FeatureSet::empty(),
            cwd: WorkingDirectory::default(),
            busy: false,
            reply_pending: false,
            dead: false,
            last_used: Instant::now(),
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn features(&self) -> FeatureSet {
        self.features
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn is_dead(&self) -> bool {
        self.dead
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    pub fn working_directory(&self) -> Option<&str> {
        self.cwd.current()
    }

    pub(crate) fn set_features(&mut self, features: FeatureSet) {
        self.features = features;
    }

    pub(crate) fn mark_dead(&mut self) {
        self.dead = true;
    }

    /// Called before a new command. Returns `true` when a reply left over
    /// from an abandoned exchange must be drained first.
    pub(crate) fn begin(&mut self) -> FtpResult<bool> {
        if self.dead {
            return Err(FtpError::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("control connection to {} is closed", self.key),
            )));
        }
        if self.busy && !self.reply_pending {
            // A write was interrupted; the server may have seen half a command.
            self.dead = true;
            return Err(FtpError::Io(io::Error::new(
                io::ErrorKind::Other,
                "previous command was interrupted while being sent",
            )));
        }
        self.busy = false;
        self.last_used = Instant::now();
        Ok(self.reply_pending)
    }

    pub(crate) fn command_started(&mut self) {
        self.busy = true;
    }

    pub(crate) fn command_sent(&mut self) {
        self.reply_pending = true;
    }

    /// Nothing to write, but the server owes a reply (greeting, transfer end).
    pub(crate) fn awaiting_reply(&mut self) {
        self.busy = true;
        self.reply_pending = true;
    }

    /// A 125/150 was accepted: the final transfer reply is still to come.
    pub(crate) fn transfer_started(&mut self) {
        self.reply_pending = true;
    }

    pub(crate) fn drained(&mut self) {
        self.reply_pending = false;
        self.cwd.invalidate();
    }

    /// Record the outcome of one reply read.
    pub(crate) fn finish(&mut self, result: FtpResult<Reply>) -> FtpResult<Reply> {
        let mid_write = self.busy && !self.reply_pending;
        self.busy = false;
        self.last_used = Instant::now();
        match result {
            Ok(reply) => {
                self.reply_pending = false;
                if reply.code == 421 {
                    log::warn!("FTP: {} is closing the connection: {}", self.key, reply.message);
                    self.dead = true;
                }
                Ok(reply)
            }
            Err(FtpError::Cancelled) => {
                if mid_write {
                    self.dead = true;
                }
                self.cwd.invalidate();
                Err(FtpError::Cancelled)
            }
            Err(e) => {
                if mid_write || e.kills_session() {
                    log::debug!("FTP: session {} is dead: {}", self.key, e);
                    self.dead = true;
                }
                Err(e)
            }
        }
    }
}

// ─── Cancellation & deadlines ────────────────────────────────────────

pub(crate) async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = FtpResult<T>>,
) -> FtpResult<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(FtpError::Cancelled),
        res = fut => res,
    }
}

pub(crate) async fn deadline<T>(
    cancel: &CancellationToken,
    limit: Duration,
    what: &'static str,
    fut: impl Future<Output = FtpResult<T>>,
) -> FtpResult<T> {
    cancellable(cancel, async move {
        timeout(limit, fut)
            .await
            .map_err(|_| FtpError::TimedOut(what))?
    })
    .await
}

/// Read a data connection to EOF. `idle` bounds each individual read.
pub(crate) async fn read_data_to_end(
    data: &mut TcpStream,
    idle: Duration,
    cancel: &CancellationToken,
) -> FtpResult<Vec<u8>> {
    let mut out = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = deadline(cancel, idle, "reading the data connection", async {
            Ok(data.read(&mut buf).await?)
        })
        .await?;
        if n == 0 {
            return Ok(out);
        }
        out.extend_from_slice(&buf[..n]);
    }
}

// ─── Async session ───────────────────────────────────────────────────

/// A logged-in control connection driven on tokio.
pub struct AsyncSession {
    codec: FtpCodec<TcpStream>,
    state: SessionState,
    config: Arc<FtpLoaderConfig>,
}

impl AsyncSession {
    /// Connect and run the login sequence.
    pub async fn connect(
        key: SessionKey,
        config: Arc<FtpLoaderConfig>,
        cancel: &CancellationToken,
    ) -> FtpResult<Self> {
        log::info!("FTP: connecting to {}", key);
        let tcp = deadline(cancel, config.connect_timeout(), "connecting to the server", async {
            Ok(TcpStream::connect((key.host.as_str(), key.port)).await?)
        })
        .await?;
        tcp.set_nodelay(true).ok();

        let mut session = Self {
            codec: FtpCodec::new(tcp, ReplyLimits::from_config(&config)),
            state: SessionState::new(key),
            config,
        };
        session.login(cancel).await?;
        Ok(session)
    }

    async fn login(&mut self, cancel: &CancellationToken) -> FtpResult<()> {
        let key = self.state.key();
        let mut machine = LoginMachine::new(
            key.user.clone(),
            key.password.clone(),
            self.config.transfer_type,
        );
        let mut step = machine.start();
        loop {
            let reply = match step {
                LoginStep::ReadReply => self.read_reply(cancel).await?,
                LoginStep::Send(cmd) => self.exchange(&cmd, cancel).await?,
                LoginStep::Done(features) => {
                    log::info!("FTP: logged in to {} (features: {:?})", self.state.key(), features);
                    self.state.set_features(features);
                    return Ok(());
                }
            };
            step = machine.on_reply(&reply)?;
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn features(&self) -> FeatureSet {
        self.state.features()
    }

    pub fn is_dead(&self) -> bool {
        self.state.is_dead()
    }

    /// Read one reply without sending a command.
    async fn read_reply(&mut self, cancel: &CancellationToken) -> FtpResult<Reply> {
        self.state.awaiting_reply();
        let limit = self.config.command_timeout();
        let result = deadline(cancel, limit, "waiting for a reply", self.codec.read_reply()).await;
        self.state.finish(result)
    }

    async fn drain(&mut self, cancel: &CancellationToken) -> FtpResult<()> {
        log::debug!("FTP: draining stale reply on {}", self.state.key());
        loop {
            let reply = self.read_reply(cancel).await?;
            if !reply.is_preliminary() {
                break;
            }
            self.state.transfer_started();
        }
        self.state.drained();
        Ok(())
    }

    /// Send one command and read its reply as a single step.
    pub async fn exchange(&mut self, cmd: &Command, cancel: &CancellationToken) -> FtpResult<Reply> {
        if self.state.begin()? {
            self.drain(cancel).await?;
        }
        self.state.command_started();
        let limit = self.config.command_timeout();
        let codec = &mut self.codec;
        let state = &mut self.state;
        let result = deadline(cancel, limit, "waiting for a reply", async move {
            codec.send(cmd).await?;
            state.command_sent();
            codec.read_reply().await
        })
        .await;
        self.state.finish(result)
    }

    /// Make `dir` (absolute, slash-terminated) the working directory.
    pub async fn ensure_directory(&mut self, dir: &str, cancel: &CancellationToken) -> FtpResult<()> {
        loop {
            let step = self.state.cwd.next_step(dir);
            let cmd = match step.command() {
                Some(cmd) => cmd,
                None => return Ok(()),
            };
            let reply = self.exchange(&cmd, cancel).await?;
            self.state.cwd.apply(&step, &reply)?;
        }
    }

    /// PASV, then connect to the announced address.
    pub async fn open_passive(&mut self, cancel: &CancellationToken) -> FtpResult<TcpStream> {
        transfer::ensure_supported(self.config.data_channel_mode)?;
        let reply = self.exchange(&Command::Pasv, cancel).await?;
        let addr = transfer::parse_pasv_reply(&reply)?;
        cancellable(cancel, transfer::connect(&addr, self.config.connect_timeout())).await
    }

    /// LIST `dir` and parse the result.
    pub async fn list(&mut self, dir: &str, cancel: &CancellationToken) -> FtpResult<Vec<DirectoryEntry>> {
        let mut data = self.open_passive(cancel).await?;
        let reply = self.exchange(&Command::List(dir.to_string()), cancel).await?;
        check(&reply, &[125, 150])?;
        self.state.transfer_started();

        let raw = read_data_to_end(&mut data, self.config.data_timeout(), cancel).await?;
        drop(data);
        self.finish_transfer(&[226, 250], cancel).await?;

        let entries = parser::parse_listing(&String::from_utf8_lossy(&raw));
        log::debug!("FTP: listed {} ({} entries)", dir, entries.len());
        Ok(entries)
    }

    /// RETR `path` and hand back the open data connection. The final reply
    /// must be read with [`finish_transfer`](Self::finish_transfer).
    pub async fn retrieve(&mut self, path: &str, cancel: &CancellationToken) -> FtpResult<TcpStream> {
        let data = self.open_passive(cancel).await?;
        let reply = self.exchange(&Command::Retr(path.to_string()), cancel).await?;
        check(&reply, &[125, 150])?;
        self.state.transfer_started();
        log::debug!("FTP: retrieving {} from {}", path, self.state.key());
        Ok(data)
    }

    /// Read the reply that closes a transfer.
    pub async fn finish_transfer(
        &mut self,
        acceptable: &[u16],
        cancel: &CancellationToken,
    ) -> FtpResult<Reply> {
        let reply = self.read_reply(cancel).await?;
        check(&reply, acceptable)?;
        Ok(reply)
    }

    /// Send QUIT and close the connection. Failures are only logged.
    pub async fn quit(mut self) {
        if self.state.is_dead() {
            return;
        }
        let cancel = CancellationToken::new();
        match self.exchange(&Command::Quit, &cancel).await {
            Ok(reply) if reply.code == 221 => log::debug!("FTP: closed {}", self.state.key()),
            Ok(reply) => log::warn!(
                "FTP: QUIT on {} answered {} {}",
                self.state.key(),
                reply.code,
                reply.message
            ),
            Err(e) => log::warn!("FTP: QUIT on {} failed: {}", self.state.key(), e),
        }
    }
}

//! Blocking control session on `std::net`.
//!
//! Same login machine, directory cache and bookkeeping as the async
//! session. Cancellation is cooperative: the token is checked before every
//! blocking call, and socket timeouts bound each call.

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::login::{LoginMachine, LoginStep};
use crate::ftp::parser;
use crate::ftp::protocol::{BlockingCodec, Command, ReplyLimits};
use crate::ftp::reply::{check, Reply};
use crate::ftp::session::{SessionKey, SessionState};
use crate::ftp::transfer;
use crate::ftp::types::{DirectoryEntry, FeatureSet, FtpLoaderConfig};
use std::io::{self, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub(crate) fn check_cancel(cancel: &CancellationToken) -> FtpResult<()> {
    if cancel.is_cancelled() {
        Err(FtpError::Cancelled)
    } else {
        Ok(())
    }
}

/// One read from a data connection.
pub(crate) fn read_data(
    data: &mut TcpStream,
    buf: &mut [u8],
    cancel: &CancellationToken,
) -> FtpResult<usize> {
    check_cancel(cancel)?;
    data.read(buf).map_err(|e| match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
            FtpError::TimedOut("reading the data connection")
        }
        _ => FtpError::Io(e),
    })
}

fn connect_control(key: &SessionKey, config: &FtpLoaderConfig) -> FtpResult<TcpStream> {
    let mut last_err = None;
    for addr in (key.host.as_str(), key.port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, config.connect_timeout()) {
            Ok(tcp) => return Ok(tcp),
            Err(e) => last_err = Some(e),
        }
    }
    Err(match last_err {
        Some(e) if e.kind() == io::ErrorKind::TimedOut => FtpError::TimedOut("connecting to the server"),
        Some(e) => FtpError::Io(e),
        None => FtpError::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} did not resolve", key.host),
        )),
    })
}

/// A logged-in control connection driven by blocking I/O.
pub struct BlockingSession {
    codec: BlockingCodec<TcpStream>,
    state: SessionState,
    config: Arc<FtpLoaderConfig>,
}

impl BlockingSession {
    pub fn connect(
        key: SessionKey,
        config: Arc<FtpLoaderConfig>,
        cancel: &CancellationToken,
    ) -> FtpResult<Self> {
        check_cancel(cancel)?;
        log::info!("FTP: connecting to {}", key);
        let tcp = connect_control(&key, &config)?;
        tcp.set_nodelay(true).ok();
        tcp.set_read_timeout(Some(config.command_timeout()))?;
        tcp.set_write_timeout(Some(config.command_timeout()))?;

        let mut session = Self {
            codec: BlockingCodec::new(tcp, ReplyLimits::from_config(&config)),
            state: SessionState::new(key),
            config,
        };
        session.login(cancel)?;
        Ok(session)
    }

    fn login(&mut self, cancel: &CancellationToken) -> FtpResult<()> {
        let key = self.state.key();
        let mut machine = LoginMachine::new(
            key.user.clone(),
            key.password.clone(),
            self.config.transfer_type,
        );
        let mut step = machine.start();
        loop {
            let reply = match step {
                LoginStep::ReadReply => self.read_reply(cancel)?,
                LoginStep::Send(cmd) => self.exchange(&cmd, cancel)?,
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

    fn read_reply(&mut self, cancel: &CancellationToken) -> FtpResult<Reply> {
        self.state.awaiting_reply();
        let result = check_cancel(cancel).and_then(|_| self.codec.read_reply());
        self.state.finish(result)
    }

    fn drain(&mut self, cancel: &CancellationToken) -> FtpResult<()> {
        log::debug!("FTP: draining stale reply on {}", self.state.key());
        loop {
            let reply = self.read_reply(cancel)?;
            if !reply.is_preliminary() {
                break;
            }
            self.state.transfer_started();
        }
        self.state.drained();
        Ok(())
    }

    /// Send one command and read its reply as a single step.
    pub fn exchange(&mut self, cmd: &Command, cancel: &CancellationToken) -> FtpResult<Reply> {
        if self.state.begin()? {
            self.drain(cancel)?;
        }
        check_cancel(cancel)?;
        self.state.command_started();
        let result = match self.codec.send(cmd) {
            Ok(()) => {
                self.state.command_sent();
                check_cancel(cancel).and_then(|_| self.codec.read_reply())
            }
            Err(e) => Err(e),
        };
        self.state.finish(result)
    }

    pub fn ensure_directory(&mut self, dir: &str, cancel: &CancellationToken) -> FtpResult<()> {
        loop {
            let step = self.state.cwd.next_step(dir);
            let cmd = match step.command() {
                Some(cmd) => cmd,
                None => return Ok(()),
            };
            let reply = self.exchange(&cmd, cancel)?;
            self.state.cwd.apply(&step, &reply)?;
        }
    }

    pub fn open_passive(&mut self, cancel: &CancellationToken) -> FtpResult<TcpStream> {
        transfer::ensure_supported(self.config.data_channel_mode)?;
        let reply = self.exchange(&Command::Pasv, cancel)?;
        let addr = transfer::parse_pasv_reply(&reply)?;
        check_cancel(cancel)?;
        transfer::connect_blocking(&addr, self.config.connect_timeout(), self.config.data_timeout())
    }

    pub fn list(&mut self, dir: &str, cancel: &CancellationToken) -> FtpResult<Vec<DirectoryEntry>> {
        let mut data = self.open_passive(cancel)?;
        let reply = self.exchange(&Command::List(dir.to_string()), cancel)?;
        check(&reply, &[125, 150])?;
        self.state.transfer_started();

        let mut raw = Vec::new();
        let mut buf = [0u8; 8192];
        loop {
            let n = read_data(&mut data, &mut buf, cancel)?;
            if n == 0 {
                break;
            }
            raw.extend_from_slice(&buf[..n]);
        }
        drop(data);
        self.finish_transfer(&[226, 250], cancel)?;

        let entries = parser::parse_listing(&String::from_utf8_lossy(&raw));
        log::debug!("FTP: listed {} ({} entries)", dir, entries.len());
        Ok(entries)
    }

    pub fn retrieve(&mut self, path: &str, cancel: &CancellationToken) -> FtpResult<TcpStream> {
        let data = self.open_passive(cancel)?;
        let reply = self.exchange(&Command::Retr(path.to_string()), cancel)?;
        check(&reply, &[125, 150])?;
        self.state.transfer_started();
        log::debug!("FTP: retrieving {} from {}", path, self.state.key());
        Ok(data)
    }

    pub fn finish_transfer(
        &mut self,
        acceptable: &[u16],
        cancel: &CancellationToken,
    ) -> FtpResult<Reply> {
        let reply = self.read_reply(cancel)?;
        check(&reply, acceptable)?;
        Ok(reply)
    }

    /// Send QUIT and close the connection. Failures are only logged.
    pub fn quit(mut self) {
        if self.state.is_dead() {
            return;
        }
        match self.exchange(&Command::Quit, &CancellationToken::new()) {
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

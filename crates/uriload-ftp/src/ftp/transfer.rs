//! Passive-mode data channel (RFC 959 PASV).
//!
//! `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)` is parsed into a
//! [`PassiveAddr`] and a fresh TCP connection is opened to it. Extended
//! passive and active modes are not implemented; selecting them fails
//! before any command is sent.

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::reply::{check, Reply};
use crate::ftp::types::DataChannelMode;
use lazy_static::lazy_static;
use regex::Regex;
use std::fmt;
use std::net::ToSocketAddrs;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

lazy_static! {
    static ref PASV_RE: Regex =
        Regex::new(r"(\d+),(\d+),(\d+),(\d+),(\d+),(\d+)").expect("valid PASV regex");
}

/// Address announced by the server for the next data connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassiveAddr {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for PassiveAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Fail early for data channel modes without an implementation.
pub fn ensure_supported(mode: DataChannelMode) -> FtpResult<()> {
    match mode {
        DataChannelMode::Passive => Ok(()),
        DataChannelMode::ExtendedPassive => Err(FtpError::not_supported("extended passive mode (EPSV)")),
        DataChannelMode::Active => Err(FtpError::not_supported("active mode (PORT)")),
    }
}

/// Validate a PASV reply and extract the data address from its text.
pub fn parse_pasv_reply(reply: &Reply) -> FtpResult<PassiveAddr> {
    check(reply, &[227])?;
    parse_pasv_text(&reply.message)
}

/// Find the six comma-separated numbers anywhere in `text`.
pub fn parse_pasv_text(text: &str) -> FtpResult<PassiveAddr> {
    let caps = PASV_RE
        .captures(text)
        .ok_or_else(|| FtpError::bad_answer(format!("cannot parse PASV reply: {}", text)))?;

    let mut nums = [0u8; 6];
    for (i, slot) in nums.iter_mut().enumerate() {
        *slot = caps[i + 1]
            .parse::<u8>()
            .map_err(|_| FtpError::bad_answer(format!("PASV value out of range: {}", &caps[i + 1])))?;
    }

    Ok(PassiveAddr {
        host: format!("{}.{}.{}.{}", nums[0], nums[1], nums[2], nums[3]),
        port: nums[4] as u16 * 256 + nums[5] as u16,
    })
}

/// Connect to the announced data address.
pub async fn connect(addr: &PassiveAddr, connect_timeout: Duration) -> FtpResult<TcpStream> {
    log::debug!("opening data connection to {}", addr);
    let tcp = timeout(connect_timeout, TcpStream::connect((addr.host.as_str(), addr.port)))
        .await
        .map_err(|_| FtpError::TimedOut("opening the data connection"))??;
    Ok(tcp)
}

/// Blocking counterpart of [`connect`]. Reads on the returned socket time
/// out after `read_timeout`.
pub fn connect_blocking(
    addr: &PassiveAddr,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> FtpResult<std::net::TcpStream> {
    log::debug!("opening data connection to {}", addr);
    let sock_addr = (addr.host.as_str(), addr.port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| FtpError::bad_answer(format!("unresolvable data address {}", addr)))?;
    let tcp = std::net::TcpStream::connect_timeout(&sock_addr, connect_timeout)?;
    tcp.set_read_timeout(Some(read_timeout))?;
    Ok(tcp)
}

//! File readers returned for RETR.
//!
//! A reader owns the data connection and holds its session exclusively
//! until the transfer's final reply has been read. That read happens
//! exactly once: at end-of-data, on `close()`, or when the reader is
//! dropped. Closing before end-of-data also accepts `426` (transfer
//! aborted) as the final reply.

use crate::ftp::blocking::{self, check_cancel};
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::pool::{AsyncLease, BlockingLease};
use crate::ftp::types::DirectoryEntry;
use std::future::Future;
use std::io::{self, Read};
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::{Instant, Sleep};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

const AT_EOF: &[u16] = &[226, 250];
const ON_CLOSE: &[u16] = &[226, 250, 426];

fn session_gone() -> FtpError {
    FtpError::Io(io::Error::new(
        io::ErrorKind::NotConnected,
        "control session released before the transfer finished",
    ))
}

// ─── Blocking reader ─────────────────────────────────────────────────

/// `std::io::Read` over a RETR data connection.
pub struct FtpFileReader {
    entry: DirectoryEntry,
    path: String,
    data: Option<std::net::TcpStream>,
    lease: BlockingLease,
    cancel: CancellationToken,
    finished: bool,
}

impl FtpFileReader {
    pub(crate) fn new(
        entry: DirectoryEntry,
        path: String,
        data: std::net::TcpStream,
        lease: BlockingLease,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            entry,
            path,
            data: Some(data),
            lease,
            cancel,
            finished: false,
        }
    }

    /// Listing entry describing the file being read.
    pub fn entry(&self) -> &DirectoryEntry {
        &self.entry
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn finish(&mut self, acceptable: &[u16]) -> FtpResult<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.data = None;
        let session = self.lease.session_mut().ok_or_else(session_gone)?;
        session.finish_transfer(acceptable, &self.cancel)?;
        log::debug!("FTP: transfer of {} complete", self.path);
        Ok(())
    }

    /// Close the data connection and read the final reply.
    pub fn close(mut self) -> FtpResult<()> {
        self.finish(ON_CLOSE)
    }
}

impl Read for FtpFileReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let data = match self.data.as_mut() {
            Some(data) => data,
            None => return Ok(0),
        };
        let n = blocking::read_data(data, buf, &self.cancel)?;
        if n == 0 && !buf.is_empty() {
            self.finish(AT_EOF)?;
        }
        Ok(n)
    }
}

impl Drop for FtpFileReader {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = check_cancel(&self.cancel).and_then(|_| self.finish(ON_CLOSE)) {
            log::warn!("FTP: closing {} failed: {}", self.path, e);
        }
    }
}

// ─── Async reader ────────────────────────────────────────────────────

type FinishFuture = Pin<Box<dyn Future<Output = FtpResult<()>> + Send>>;

enum ReadState {
    Streaming(TcpStream),
    Finishing(FinishFuture),
    Done,
}

async fn finish_async(
    lease: Option<AsyncLease>,
    acceptable: &'static [u16],
    cancel: CancellationToken,
) -> FtpResult<()> {
    let mut lease = lease.ok_or_else(session_gone)?;
    let session = lease.as_mut().ok_or_else(session_gone)?;
    session.finish_transfer(acceptable, &cancel).await?;
    Ok(())
}

/// `tokio::io::AsyncRead` over a RETR data connection.
pub struct AsyncFtpFileReader {
    entry: DirectoryEntry,
    path: String,
    state: ReadState,
    lease: Option<AsyncLease>,
    cancel: CancellationToken,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    idle_timeout: Duration,
    idle: Pin<Box<Sleep>>,
}

impl AsyncFtpFileReader {
    pub(crate) fn new(
        entry: DirectoryEntry,
        path: String,
        data: TcpStream,
        lease: AsyncLease,
        cancel: CancellationToken,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            entry,
            path,
            state: ReadState::Streaming(data),
            lease: Some(lease),
            cancelled: Box::pin(cancel.clone().cancelled_owned()),
            cancel,
            idle_timeout,
            idle: Box::pin(tokio::time::sleep(idle_timeout)),
        }
    }

    pub fn entry(&self) -> &DirectoryEntry {
        &self.entry
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn finish_future(&mut self, acceptable: &'static [u16]) -> FinishFuture {
        Box::pin(finish_async(self.lease.take(), acceptable, self.cancel.clone()))
    }

    /// Close the data connection and read the final reply.
    pub async fn close(mut self) -> FtpResult<()> {
        match std::mem::replace(&mut self.state, ReadState::Done) {
            ReadState::Streaming(data) => {
                drop(data);
                self.finish_future(ON_CLOSE).await
            }
            ReadState::Finishing(fut) => fut.await,
            ReadState::Done => Ok(()),
        }
    }
}

impl AsyncRead for AsyncFtpFileReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        loop {
            match &mut this.state {
                ReadState::Streaming(data) => {
                    if this.cancelled.as_mut().poll(cx).is_ready() {
                        return Poll::Ready(Err(FtpError::Cancelled.into()));
                    }
                    let before = buf.filled().len();
                    match Pin::new(data).poll_read(cx, buf) {
                        Poll::Ready(Ok(())) if buf.filled().len() == before => {
                            this.state = ReadState::Finishing(this.finish_future(AT_EOF));
                        }
                        Poll::Ready(Ok(())) => {
                            let next = Instant::now() + this.idle_timeout;
                            this.idle.as_mut().reset(next);
                            return Poll::Ready(Ok(()));
                        }
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => {
                            if this.idle.as_mut().poll(cx).is_ready() {
                                return Poll::Ready(Err(
                                    FtpError::TimedOut("reading the data connection").into()
                                ));
                            }
                            return Poll::Pending;
                        }
                    }
                }
                ReadState::Finishing(fut) => {
                    let res = ready!(fut.as_mut().poll(cx));
                    this.state = ReadState::Done;
                    if res.is_ok() {
                        log::debug!("FTP: transfer of {} complete", this.path);
                    }
                    return Poll::Ready(res.map_err(io::Error::from));
                }
                ReadState::Done => return Poll::Ready(Ok(())),
            }
        }
    }
}

impl Drop for AsyncFtpFileReader {
    fn drop(&mut self) {
        let fut = match std::mem::replace(&mut self.state, ReadState::Done) {
            ReadState::Streaming(data) => {
                drop(data);
                self.finish_future(ON_CLOSE)
            }
            ReadState::Finishing(fut) => fut,
            ReadState::Done => return,
        };
        let path = std::mem::take(&mut self.path);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = fut.await {
                        log::warn!("FTP: closing {} failed: {}", path, e);
                    }
                });
            }
            Err(_) => log::warn!(
                "FTP: {} dropped outside a runtime, final reply left pending",
                path
            ),
        }
    }
}

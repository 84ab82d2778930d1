//! `load_uri` orchestration.
//!
//! [`LoadMachine`] decides the sequence (navigate → list → classify →
//! retrieve or return the listing); [`FtpLoader`] drives it once on tokio
//! and once on blocking sockets, against sessions held in its tables.

use crate::ftp::blocking::{check_cancel, BlockingSession};
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::navigator::{file_name, parent_dir};
use crate::ftp::pool::{self, AsyncLease, AsyncSlot, BlockingLease, BlockingSlot, SessionTable};
use crate::ftp::session::{cancellable, AsyncSession, SessionKey};
use crate::ftp::stream::{AsyncFtpFileReader, FtpFileReader};
use crate::ftp::transfer;
use crate::ftp::types::{DirectoryEntry, DirectoryListing, EntryKind, FtpLoaderConfig};
use crate::ftp::uri;
use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use url::Url;

// ─── Result ──────────────────────────────────────────────────────────

/// What a URI resolved to.
pub enum Loaded<R> {
    Directory(DirectoryListing),
    File(R),
}

impl<R> Loaded<R> {
    pub fn into_listing(self) -> Option<DirectoryListing> {
        match self {
            Self::Directory(listing) => Some(listing),
            Self::File(_) => None,
        }
    }

    pub fn into_reader(self) -> Option<R> {
        match self {
            Self::File(reader) => Some(reader),
            Self::Directory(_) => None,
        }
    }
}

// ─── Engine trait ────────────────────────────────────────────────────

/// A loader for one URI scheme.
#[async_trait]
pub trait ProtocolEngine: Send + Sync {
    type Reader: io::Read + Send;
    type AsyncReader: AsyncRead + Unpin + Send;
    type Error: std::error::Error + Send + Sync + 'static;

    fn can_load_uri(&self, url: &Url) -> bool;

    fn load_uri(
        &self,
        url: &Url,
        cancel: &CancellationToken,
    ) -> Result<Loaded<Self::Reader>, Self::Error>;

    async fn load_uri_async(
        &self,
        url: &Url,
        cancel: &CancellationToken,
    ) -> Result<Loaded<Self::AsyncReader>, Self::Error>;
}

// ─── State machine ───────────────────────────────────────────────────

/// Next action for the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadStep {
    Navigate(String),
    List(String),
    Retrieve { path: String, entry: DirectoryEntry },
    Finish(DirectoryListing),
}

/// Outcome of the previous step.
#[derive(Debug)]
pub enum LoadEvent {
    Navigated,
    Listed(Vec<DirectoryEntry>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Navigating,
    Listing,
    Done,
}

#[derive(Debug)]
pub struct LoadMachine {
    path: String,
    dir: String,
    wanted: Option<String>,
    phase: Phase,
}

impl LoadMachine {
    /// `path` is absolute and decoded; a trailing `/` asks for a listing.
    pub fn new(path: &str) -> Self {
        let name = file_name(path);
        Self {
            path: path.to_string(),
            dir: parent_dir(path),
            wanted: (!name.is_empty()).then(|| name.to_string()),
            phase: Phase::Navigating,
        }
    }

    pub fn start(&self) -> LoadStep {
        LoadStep::Navigate(self.dir.clone())
    }

    pub fn on_event(&mut self, event: LoadEvent) -> FtpResult<LoadStep> {
        match (self.phase, event) {
            (Phase::Navigating, LoadEvent::Navigated) => {
                self.phase = Phase::Listing;
                Ok(LoadStep::List(self.dir.clone()))
            }
            (Phase::Listing, LoadEvent::Listed(entries)) => self.classify(entries),
            (phase, event) => Err(FtpError::Io(io::Error::new(
                io::ErrorKind::Other,
                format!("load of {} got {:?} while {:?}", self.path, event, phase),
            ))),
        }
    }

    fn classify(&mut self, entries: Vec<DirectoryEntry>) -> FtpResult<LoadStep> {
        let wanted = match self.wanted.take() {
            Some(name) => name,
            None => {
                self.phase = Phase::Done;
                return Ok(LoadStep::Finish(DirectoryListing {
                    path: self.dir.clone(),
                    entries,
                }));
            }
        };

        let entry = entries
            .into_iter()
            .find(|e| e.name == wanted)
            .ok_or_else(|| FtpError::file_not_found(self.path.clone()))?;

        match &entry.kind {
            EntryKind::Directory => {
                self.dir = format!("{}{}/", self.dir, entry.name);
                self.phase = Phase::Navigating;
                Ok(LoadStep::Navigate(self.dir.clone()))
            }
            EntryKind::File => {
                self.phase = Phase::Done;
                Ok(LoadStep::Retrieve {
                    path: format!("{}{}", self.dir, entry.name),
                    entry,
                })
            }
            EntryKind::Symlink { target } => Err(FtpError::not_supported(format!(
                "following symbolic link {} -> {}",
                self.path, target
            ))),
        }
    }
}

// ─── Loader ──────────────────────────────────────────────────────────

/// The FTP engine. Owns one session table per scheduling model.
pub struct FtpLoader {
    config: Arc<FtpLoaderConfig>,
    async_sessions: Arc<SessionTable<AsyncSlot>>,
    blocking_sessions: SessionTable<BlockingSlot>,
}

impl Default for FtpLoader {
    fn default() -> Self {
        Self::new(FtpLoaderConfig::default())
    }
}

impl FtpLoader {
    pub fn new(config: FtpLoaderConfig) -> Self {
        let idle = config.idle_timeout();
        Self {
            config: Arc::new(config),
            async_sessions: Arc::new(SessionTable::new(idle)),
            blocking_sessions: SessionTable::new(idle),
        }
    }

    pub fn config(&self) -> &FtpLoaderConfig {
        &self.config
    }

    pub fn async_sessions(&self) -> &SessionTable<AsyncSlot> {
        &self.async_sessions
    }

    pub fn blocking_sessions(&self) -> &SessionTable<BlockingSlot> {
        &self.blocking_sessions
    }

    /// Periodically close idle async sessions.
    pub fn spawn_reaper(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        pool::spawn_reaper(Arc::clone(&self.async_sessions), interval)
    }

    pub async fn reap_idle(&self, now: Instant) -> usize {
        self.async_sessions.reap_idle(now).await
    }

    pub fn reap_idle_blocking(&self, now: Instant) -> usize {
        self.blocking_sessions.reap_idle(now)
    }

    /// QUIT every idle async session.
    pub async fn shutdown(&self) {
        self.async_sessions.shutdown().await;
    }

    /// QUIT every idle blocking session.
    pub fn close_all(&self) {
        self.blocking_sessions.close_all();
    }

    // ── async ───────────────────────────────────────────────────

    async fn acquire_async(&self, key: SessionKey, cancel: &CancellationToken) -> FtpResult<AsyncLease> {
        let slot = self.async_sessions.slot(&key);
        let mut lease = cancellable(cancel, async move { Ok(slot.lock_owned().await) }).await?;
        match lease.as_ref().map(|s| s.is_dead()) {
            Some(false) => {
                log::debug!("FTP: reusing session {}", key);
                return Ok(lease);
            }
            Some(true) => log::debug!("FTP: replacing dead session {}", key),
            None => {}
        }
        *lease = None;
        *lease = Some(AsyncSession::connect(key, Arc::clone(&self.config), cancel).await?);
        Ok(lease)
    }

    pub async fn load_uri_async(
        &self,
        url: &Url,
        cancel: &CancellationToken,
    ) -> FtpResult<Loaded<AsyncFtpFileReader>> {
        let target = uri::target_from_url(url, &self.config)?;
        transfer::ensure_supported(self.config.data_channel_mode)?;
        log::debug!("FTP: loading {} from {}:{}", target.path, target.host, target.port);

        let key = SessionKey::from_target(&target);
        let loaded = self.drive_async(key.clone(), &target.path, cancel).await;
        if loaded.is_err() {
            self.async_sessions.discard_vacant(&key);
        }
        loaded
    }

    async fn drive_async(
        &self,
        key: SessionKey,
        path: &str,
        cancel: &CancellationToken,
    ) -> FtpResult<Loaded<AsyncFtpFileReader>> {
        let mut lease = self.acquire_async(key, cancel).await?;
        let mut machine = LoadMachine::new(path);
        let mut step = machine.start();
        loop {
            let session = lease.as_mut().ok_or_else(session_missing)?;
            step = match step {
                LoadStep::Navigate(dir) => {
                    session.ensure_directory(&dir, cancel).await?;
                    machine.on_event(LoadEvent::Navigated)?
                }
                LoadStep::List(dir) => {
                    let entries = session.list(&dir, cancel).await?;
                    machine.on_event(LoadEvent::Listed(entries))?
                }
                LoadStep::Retrieve { path, entry } => {
                    let data = session.retrieve(&path, cancel).await?;
                    return Ok(Loaded::File(AsyncFtpFileReader::new(
                        entry,
                        path,
                        data,
                        lease,
                        cancel.clone(),
                        self.config.data_timeout(),
                    )));
                }
                LoadStep::Finish(listing) => return Ok(Loaded::Directory(listing)),
            };
        }
    }

    // ── blocking ────────────────────────────────────────────────

    fn acquire_blocking(&self, key: SessionKey, cancel: &CancellationToken) -> FtpResult<BlockingLease> {
        check_cancel(cancel)?;
        let slot = self.blocking_sessions.slot(&key);
        let mut lease = slot.checkout();
        if lease.is_live() {
            log::debug!("FTP: reusing session {}", key);
            return Ok(lease);
        }
        let session = BlockingSession::connect(key, Arc::clone(&self.config), cancel)?;
        lease.install(session);
        Ok(lease)
    }

    pub fn load_uri(&self, url: &Url, cancel: &CancellationToken) -> FtpResult<Loaded<FtpFileReader>> {
        let target = uri::target_from_url(url, &self.config)?;
        transfer::ensure_supported(self.config.data_channel_mode)?;
        log::debug!("FTP: loading {} from {}:{}", target.path, target.host, target.port);

        let key = SessionKey::from_target(&target);
        let loaded = self.drive_blocking(key.clone(), &target.path, cancel);
        if loaded.is_err() {
            self.blocking_sessions.discard_vacant(&key);
        }
        loaded
    }

    fn drive_blocking(
        &self,
        key: SessionKey,
        path: &str,
        cancel: &CancellationToken,
    ) -> FtpResult<Loaded<FtpFileReader>> {
        let mut lease = self.acquire_blocking(key, cancel)?;
        let mut machine = LoadMachine::new(path);
        let mut step = machine.start();
        loop {
            let session = lease.session_mut().ok_or_else(session_missing)?;
            step = match step {
                LoadStep::Navigate(dir) => {
                    session.ensure_directory(&dir, cancel)?;
                    machine.on_event(LoadEvent::Navigated)?
                }
                LoadStep::List(dir) => {
                    let entries = session.list(&dir, cancel)?;
                    machine.on_event(LoadEvent::Listed(entries))?
                }
                LoadStep::Retrieve { path, entry } => {
                    let data = session.retrieve(&path, cancel)?;
                    return Ok(Loaded::File(FtpFileReader::new(
                        entry,
                        path,
                        data,
                        lease,
                        cancel.clone(),
                    )));
                }
                LoadStep::Finish(listing) => return Ok(Loaded::Directory(listing)),
            };
        }
    }
}

fn session_missing() -> FtpError {
    FtpError::Io(io::Error::new(io::ErrorKind::NotConnected, "no session in slot"))
}

#[async_trait]
impl ProtocolEngine for FtpLoader {
    type Reader = FtpFileReader;
    type AsyncReader = AsyncFtpFileReader;
    type Error = FtpError;

    fn can_load_uri(&self, url: &Url) -> bool {
        uri::can_load(url)
    }

    fn load_uri(&self, url: &Url, cancel: &CancellationToken) -> FtpResult<Loaded<FtpFileReader>> {
        FtpLoader::load_uri(self, url, cancel)
    }

    async fn load_uri_async(
        &self,
        url: &Url,
        cancel: &CancellationToken,
    ) -> FtpResult<Loaded<AsyncFtpFileReader>> {
        FtpLoader::load_uri_async(self, url, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, kind: EntryKind) -> DirectoryEntry {
        DirectoryEntry {
            name: name.into(),
            kind,
            size: 10,
            modified: None,
        }
    }

    fn listing() -> Vec<DirectoryEntry> {
        vec![
            entry("docs", EntryKind::Directory),
            entry("readme.txt", EntryKind::File),
            entry(
                "latest",
                EntryKind::Symlink {
                    target: "releases/1.0".into(),
                },
            ),
        ]
    }

    #[test]
    fn file_is_retrieved_by_full_path() {
        let mut m = LoadMachine::new("/pub/readme.txt");
        assert_eq!(m.start(), LoadStep::Navigate("/pub/".into()));
        assert_eq!(m.on_event(LoadEvent::Navigated).unwrap(), LoadStep::List("/pub/".into()));
        match m.on_event(LoadEvent::Listed(listing())).unwrap() {
            LoadStep::Retrieve { path, entry } => {
                assert_eq!(path, "/pub/readme.txt");
                assert_eq!(entry.kind, EntryKind::File);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn trailing_slash_returns_listing() {
        let mut m = LoadMachine::new("/pub/");
        m.on_event(LoadEvent::Navigated).unwrap();
        match m.on_event(LoadEvent::Listed(listing())).unwrap() {
            LoadStep::Finish(l) => {
                assert_eq!(l.path, "/pub/");
                assert_eq!(l.entries.len(), 3);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn directory_without_slash_is_recursed_into() {
        let mut m = LoadMachine::new("/pub/docs");
        m.on_event(LoadEvent::Navigated).unwrap();
        assert_eq!(
            m.on_event(LoadEvent::Listed(listing())).unwrap(),
            LoadStep::Navigate("/pub/docs/".into())
        );
        assert_eq!(m.on_event(LoadEvent::Navigated).unwrap(), LoadStep::List("/pub/docs/".into()));
        assert!(matches!(
            m.on_event(LoadEvent::Listed(vec![])).unwrap(),
            LoadStep::Finish(DirectoryListing { ref path, .. }) if path == "/pub/docs/"
        ));
    }

    #[test]
    fn missing_entry_is_file_not_found() {
        let mut m = LoadMachine::new("/pub/nope.txt");
        m.on_event(LoadEvent::Navigated).unwrap();
        assert!(matches!(
            m.on_event(LoadEvent::Listed(listing())),
            Err(FtpError::FileNotFound(p)) if p == "/pub/nope.txt"
        ));
    }

    #[test]
    fn symlink_is_not_followed() {
        let mut m = LoadMachine::new("/pub/latest");
        m.on_event(LoadEvent::Navigated).unwrap();
        match m.on_event(LoadEvent::Listed(listing())) {
            Err(FtpError::NotSupported(msg)) => assert!(msg.contains("releases/1.0")),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn out_of_order_event_is_an_error() {
        let mut m = LoadMachine::new("/pub/readme.txt");
        assert!(m.on_event(LoadEvent::Listed(vec![])).is_err());
    }

    #[test]
    fn root_file() {
        let m = LoadMachine::new("/readme.txt");
        assert_eq!(m.start(), LoadStep::Navigate("/".into()));
    }

    #[test]
    fn engine_claims_ftp_only() {
        let loader = FtpLoader::default();
        assert!(loader.can_load_uri(&Url::parse("ftp://host/").unwrap()));
        assert!(!loader.can_load_uri(&Url::parse("file:///tmp/x").unwrap()));
    }
}

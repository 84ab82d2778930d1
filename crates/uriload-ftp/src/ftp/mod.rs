//! # FTP client engine (RFC 959)
//!
//! Loads `ftp://` URIs: directory URIs come back as sorted listings, file
//! URIs as readers over a passive data connection.
//!
//! Architecture:
//! - `types`: config, listing entries, feature bitset
//! - `error`: FTP-specific error type
//! - `reply`: reply value, multi-line parser, code taxonomy
//! - `protocol`: command vocabulary and the async/blocking codecs
//! - `login`: welcome/USER/PASS/FEAT state machine
//! - `navigator`: working-directory cache (PWD/CWD)
//! - `transfer`: PASV negotiation and data connections
//! - `parser`: LIST tokenizer and sort order
//! - `session`: async control session and shared session bookkeeping
//! - `blocking`: the same session on `std::net`
//! - `stream`: RETR readers that finish the transfer on EOF/close/drop
//! - `pool`: session table keyed by host, port and credentials
//! - `uri`: `ftp://` URI → connection target
//! - `loader`: `load_uri` orchestration and the `ProtocolEngine` trait

pub mod types;
pub mod error;
pub mod reply;
pub mod protocol;
pub mod login;
pub mod navigator;
pub mod transfer;
pub mod parser;
pub mod session;
pub mod blocking;
pub mod stream;
pub mod pool;
pub mod uri;
pub mod loader;

// Re-exports for lib.rs consumers
pub use types::*;
pub use error::{FtpError, FtpResult};
pub use reply::{check, classify, parse_reply, Reply, ReplyCategory, ReplySubject};
pub use protocol::Command;
pub use session::{AsyncSession, SessionKey};
pub use blocking::BlockingSession;
pub use stream::{AsyncFtpFileReader, FtpFileReader};
pub use pool::SessionTable;
pub use loader::{FtpLoader, Loaded, ProtocolEngine};

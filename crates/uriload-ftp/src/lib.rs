//! # uriload-ftp
//!
//! FTP engine for a URI loader:
//!   • Control session with login state machine (welcome → USER → PASS → FEAT)
//!   • Multi-line reply parsing and RFC 959 reply classification
//!   • Working-directory cache (CWD only when the directory changes)
//!   • PASV data channel, LIST parsing (Unix, DOS, VMS)
//!   • `load_uri` in blocking and async flavours, returning a listing or a
//!     RETR stream that reads the transfer's final reply on EOF or close

pub mod ftp;

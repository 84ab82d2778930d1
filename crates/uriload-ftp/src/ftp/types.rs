//! Shared types for the FTP crate.

use bitflags::bitflags;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ─── Configuration ───────────────────────────────────────────────────

/// Transfer type (RFC 959 TYPE command).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TransferType {
    Ascii,
    Binary,
}

/// Transfer mode selected for the data channel. Only `Passive` is
/// implemented; the others fail with `NotSupported` before any command is
/// sent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum DataChannelMode {
    Passive,
    ExtendedPassive,
    Active,
}

impl Default for DataChannelMode {
    fn default() -> Self {
        Self::Passive
    }
}

/// Loader-wide configuration, shared by every session it opens.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FtpLoaderConfig {
    /// Control and data TCP connect timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_sec: u64,
    /// Idle timeout on data-channel reads in seconds.
    #[serde(default = "default_data_timeout")]
    pub data_timeout_sec: u64,
    /// Time allowed for one reply to arrive on the control channel.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_sec: u64,
    /// Longest accepted physical reply line, in bytes.
    #[serde(default = "default_max_line_len")]
    pub max_line_len: usize,
    /// Most physical lines accepted in one multi-line reply.
    #[serde(default = "default_max_multi_lines")]
    pub max_multi_lines: usize,
    /// Sent with USER when the URI carries no user.
    #[serde(default = "default_user")]
    pub default_user: String,
    /// Sent with PASS when the URI carries no password.
    #[serde(default = "default_password")]
    pub default_password: String,
    #[serde(default)]
    pub data_channel_mode: DataChannelMode,
    /// When set, `TYPE A`/`TYPE I` is sent once after login.
    #[serde(default)]
    pub transfer_type: Option<TransferType>,
    /// Sessions unused for longer than this are reaped.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_sec: u64,
}

fn default_connect_timeout() -> u64 {
    15
}
fn default_data_timeout() -> u64 {
    30
}
fn default_command_timeout() -> u64 {
    30
}
fn default_max_line_len() -> usize {
    2048
}
fn default_max_multi_lines() -> usize {
    128
}
fn default_user() -> String {
    "anonymous".into()
}
fn default_password() -> String {
    "anonymous@example.com".into()
}
fn default_idle_timeout() -> u64 {
    300
}

impl Default for FtpLoaderConfig {
    fn default() -> Self {
        Self {
            connect_timeout_sec: default_connect_timeout(),
            data_timeout_sec: default_data_timeout(),
            command_timeout_sec: default_command_timeout(),
            max_line_len: default_max_line_len(),
            max_multi_lines: default_max_multi_lines(),
            default_user: default_user(),
            default_password: default_password(),
            data_channel_mode: DataChannelMode::Passive,
            transfer_type: None,
            idle_timeout_sec: default_idle_timeout(),
        }
    }
}

impl FtpLoaderConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_sec)
    }

    pub fn data_timeout(&self) -> Duration {
        Duration::from_secs(self.data_timeout_sec)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_sec)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_sec)
    }
}

// ─── Target ──────────────────────────────────────────────────────────

/// Connection target and path extracted from an `ftp://` URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtpTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// Absolute, percent-decoded path. Directory URIs end in `/`.
    pub path: String,
}

// ─── Server Capabilities ─────────────────────────────────────────────

bitflags! {
    /// Optional capabilities advertised in the FEAT reply.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct FeatureSet: u16 {
        const MDTM = 1 << 0;
        const SIZE = 1 << 1;
        const REST = 1 << 2;
        const TVFS = 1 << 3;
        const MLST = 1 << 4;
        const MLSD = 1 << 5;
        const EPRT = 1 << 6;
        const EPSV = 1 << 7;
        const UTF8 = 1 << 8;
    }
}

const FEATURE_TAGS: [(&str, FeatureSet); 9] = [
    ("MDTM", FeatureSet::MDTM),
    ("SIZE", FeatureSet::SIZE),
    ("REST", FeatureSet::REST),
    ("TVFS", FeatureSet::TVFS),
    ("MLST", FeatureSet::MLST),
    ("MLSD", FeatureSet::MLSD),
    ("EPRT", FeatureSet::EPRT),
    ("EPSV", FeatureSet::EPSV),
    ("UTF8", FeatureSet::UTF8),
];

impl FeatureSet {
    /// Match one FEAT line (e.g. ` REST STREAM`) against the tag table.
    pub fn from_feat_line(line: &str) -> FeatureSet {
        let tag = line.split_whitespace().next().unwrap_or_default();
        FEATURE_TAGS
            .iter()
            .find(|(name, _)| tag.eq_ignore_ascii_case(name))
            .map(|(_, flag)| *flag)
            .unwrap_or_else(FeatureSet::empty)
    }

    /// Fold every line of a 211 FEAT message into one set.
    pub fn from_feat_message(message: &str) -> FeatureSet {
        message
            .split('\n')
            .map(|line| FeatureSet::from_feat_line(line.trim()))
            .fold(FeatureSet::empty(), |acc, f| acc | f)
    }
}

// ─── Directory Listing ───────────────────────────────────────────────

/// Type of a remote filesystem entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum EntryKind {
    File,
    Directory,
    Symlink { target: String },
}

/// One entry from a directory listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryEntry {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

impl DirectoryEntry {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// A fully listed directory, as returned for directory URIs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryListing {
    /// Absolute directory path, slash-terminated.
    pub path: String,
    pub entries: Vec<DirectoryEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feat_tags_are_matched_on_first_word() {
        let msg = "Features:\n MDTM\n REST STREAM\n UTF8\n AUTH TLS\nEnd";
        let f = FeatureSet::from_feat_message(msg);
        assert_eq!(f, FeatureSet::MDTM | FeatureSet::REST | FeatureSet::UTF8);
    }

    #[test]
    fn feat_mlst_with_facts() {
        let f = FeatureSet::from_feat_line("MLST type*;size*;modify*;");
        assert_eq!(f, FeatureSet::MLST);
        assert!(FeatureSet::from_feat_line("SIZEX").is_empty());
    }

    #[test]
    fn config_defaults_from_empty_json() {
        let cfg: FtpLoaderConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.default_user, "anonymous");
        assert_eq!(cfg.connect_timeout_sec, 15);
        assert_eq!(cfg.data_channel_mode, DataChannelMode::Passive);
        assert!(cfg.transfer_type.is_none());
    }

    #[test]
    fn entry_serialises_camel_case() {
        let e = DirectoryEntry {
            name: "link".into(),
            kind: EntryKind::Symlink { target: "/srv".into() },
            size: 3,
            modified: None,
        };
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["kind"]["symlink"]["target"], "/srv");
    }
}

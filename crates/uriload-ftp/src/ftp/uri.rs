//! `ftp://` URI → [`FtpTarget`].

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::types::{FtpLoaderConfig, FtpTarget};
use percent_encoding::percent_decode_str;
use url::{Host, Url};

pub const DEFAULT_PORT: u16 = 21;

/// Whether `url` is something this engine can load.
pub fn can_load(url: &Url) -> bool {
    url.scheme().eq_ignore_ascii_case("ftp") && url.host().is_some()
}

pub fn parse_uri(uri: &str) -> FtpResult<Url> {
    Url::parse(uri).map_err(|e| FtpError::InvalidUri(format!("{}: {}", uri, e)))
}

fn decode(raw: &str) -> FtpResult<String> {
    percent_decode_str(raw)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|_| FtpError::PathDecodeFailed(raw.to_string()))
}

fn has_line_break(s: &str) -> bool {
    s.contains(['\r', '\n'])
}

/// Resolve host, port, credentials and decoded path. Missing credentials
/// fall back to the configured anonymous login.
pub fn target_from_url(url: &Url, config: &FtpLoaderConfig) -> FtpResult<FtpTarget> {
    if !url.scheme().eq_ignore_ascii_case("ftp") {
        return Err(FtpError::InvalidUri(format!("not an ftp URI: {}", url)));
    }
    let host = match url.host() {
        Some(Host::Ipv6(addr)) => addr.to_string(),
        Some(host) => host.to_string(),
        None => return Err(FtpError::InvalidUri(format!("no host in {}", url))),
    };

    let user = match url.username() {
        "" => config.default_user.clone(),
        raw => decode(raw)?,
    };
    let password = match url.password() {
        Some(raw) => decode(raw)?,
        None => config.default_password.clone(),
    };

    if has_line_break(&user) || has_line_break(&password) {
        return Err(FtpError::InvalidUri(format!(
            "line break in credentials for {}",
            host
        )));
    }

    let path = match decode(url.path())? {
        p if has_line_break(&p) => return Err(FtpError::PathDecodeFailed(url.path().to_string())),
        p if p.is_empty() => "/".to_string(),
        p => p,
    };

    Ok(FtpTarget {
        host,
        port: url.port().unwrap_or(DEFAULT_PORT),
        user,
        password,
        path,
    })
}

// src/core/urls.rs

//! URL manipulation helpers used when materializing proposals and when
//! talking to the local replica.

use std::path::Path;
use tracing::warn;
use url::Url;

/// Rewrites every URL that starts with `from` so it starts with `to`
/// instead. Used to force peer and client URLs onto the scheme the TLS
/// policy demands before a proposal is broadcast.
pub fn rewrite_scheme(urls: &[String], from: &str, to: &str) -> Vec<String> {
    urls.iter()
        .map(|u| {
            if let Some(rest) = u.strip_prefix(from) {
                format!("{to}{rest}")
            } else {
                u.clone()
            }
        })
        .collect()
}

/// Replaces the host portion of each URL with `host`, preserving scheme,
/// port and path. etcd must listen on an IP rather than a DNS name, so
/// listen URLs are derived from the advertised ones with the bind address
/// substituted. Unparseable URLs are passed through untouched.
pub fn change_host(urls: &[String], host: &str) -> Vec<String> {
    urls.iter()
        .map(|s| {
            let Ok(mut u) = Url::parse(s) else {
                warn!("unable to parse url {:?}; leaving unchanged", s);
                return s.clone();
            };
            if u.set_host(Some(host)).is_err() {
                warn!("unable to set host on url {:?}; leaving unchanged", s);
                return s.clone();
            }
            u.to_string().trim_end_matches('/').to_string()
        })
        .collect()
}

/// Rewrites relative unix-socket client URLs against the process working
/// directory, since the database client resolves them against its own cwd
/// otherwise.
pub fn absolutize_unix_urls(urls: &[String], current_dir: &Path) -> Vec<String> {
    urls.iter()
        .map(|u| {
            let scheme = if u.starts_with("unix://") {
                "unix"
            } else if u.starts_with("unixs://") {
                "unixs"
            } else {
                return u.clone();
            };
            let prefix = format!("{scheme}://");
            let path = &u[prefix.len()..];
            if path.starts_with('/') {
                return u.clone();
            }
            format!("{prefix}{}", current_dir.join(path).display())
        })
        .collect()
}

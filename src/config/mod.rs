//! Manager configuration.
//!
//! Every field has a default, so a partial JSON document only needs to name
//! what it changes:
//!
//! ```
//! use rescache::config::CacheConfig;
//!
//! let config = CacheConfig::from_json_str(r#"{ "version": "v7", "runtime_max_entries": 10 }"#).unwrap();
//! assert_eq!(config.version, "v7");
//! assert_eq!(config.runtime_max_entries, 10);
//! assert_eq!(config.network_timeout_ms, 5000);
//! ```

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::{Host, Url};

use crate::error::CacheError;

const DAY_SECS: u64 = 24 * 60 * 60;

/// Settings for a [`CacheManager`](crate::CacheManager).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Application tag used as the prefix of every namespace name.
    pub app_tag: String,
    /// Build version tag. Namespaces carrying any other version are deleted on activation.
    pub version: String,
    /// The serving origin. Requests for any other origin bypass the cache.
    pub origin: String,
    /// Where same-origin requests are actually fetched from, if not the origin itself.
    pub upstream: Option<String>,
    /// Paths fetched and stored in the primary namespace at install time.
    pub precache: Vec<String>,
    /// Path of the page served when a document cannot be fetched or found in cache.
    pub offline_url: String,
    /// Network-first fetch timeout.
    pub network_timeout_ms: u64,
    /// Upper bound on any single upstream exchange, including prefetches and
    /// abandoned network-first fetches.
    pub fetch_timeout_ms: u64,
    /// How long a cache-first asset stays fresh.
    pub asset_ttl_secs: u64,
    /// Entry bound for the runtime namespace.
    pub runtime_max_entries: usize,
    /// Activate immediately after install instead of waiting for `SKIP_WAITING`.
    pub skip_waiting: bool,
    /// Whether entries stored without a timestamp count as fresh.
    pub untimestamped_entries_fresh: bool,
    /// File extensions (without the dot) routed to the cache-first strategy.
    pub asset_extensions: Vec<String>,
    /// File extensions (without the dot) routed to the network-first strategy.
    pub document_extensions: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            app_tag: "rescache".to_owned(),
            version: "v1".to_owned(),
            origin: "http://localhost:8080".to_owned(),
            upstream: None,
            precache: vec!["/".to_owned(), "/offline.html".to_owned()],
            offline_url: "/offline.html".to_owned(),
            network_timeout_ms: 5000,
            fetch_timeout_ms: 30_000,
            asset_ttl_secs: 7 * DAY_SECS,
            runtime_max_entries: 50,
            skip_waiting: true,
            untimestamped_entries_fresh: true,
            asset_extensions: [
                "js", "css", "png", "jpg", "jpeg", "gif", "svg", "webp", "avif", "woff", "woff2",
                "ttf", "otf", "eot", "ico", "json",
            ]
            .iter()
            .map(|s| (*s).to_owned())
            .collect(),
            document_extensions: vec!["html".to_owned(), "htm".to_owned()],
        }
    }
}

impl CacheConfig {
    /// Parses a JSON document, filling omitted fields with defaults, and validates it.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Config`] for malformed JSON or a failed [`validate`](Self::validate).
    pub fn from_json_str(json: &str) -> Result<Self, CacheError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| CacheError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Io`] if the file cannot be read, otherwise as
    /// [`from_json_str`](Self::from_json_str).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Checks the invariants the manager relies on.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Config`] describing the first violated rule.
    pub fn validate(&self) -> Result<(), CacheError> {
        self.origin_url()?;
        if let Some(upstream) = &self.upstream {
            Url::parse(upstream)
                .map_err(|e| CacheError::Config(format!("upstream {upstream:?}: {e}")))?;
        }
        if self.app_tag.is_empty() || self.version.is_empty() {
            return Err(CacheError::Config(
                "app_tag and version must be non-empty".to_owned(),
            ));
        }
        if let Some(bad) = self
            .precache
            .iter()
            .chain(std::iter::once(&self.offline_url))
            .find(|p| !p.starts_with('/'))
        {
            return Err(CacheError::Config(format!(
                "precache path {bad:?} must start with '/'"
            )));
        }
        if self.fetch_timeout_ms == 0 {
            return Err(CacheError::Config(
                "fetch_timeout_ms must be at least 1".to_owned(),
            ));
        }
        if self.runtime_max_entries == 0 {
            return Err(CacheError::Config(
                "runtime_max_entries must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }

    /// Returns the parsed serving origin.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Config`] if `origin` is not an absolute URL.
    pub fn origin_url(&self) -> Result<Url, CacheError> {
        Url::parse(&self.origin).map_err(|e| CacheError::Config(format!("origin {:?}: {e}", self.origin)))
    }

    /// Network-first fetch timeout as a [`Duration`].
    pub fn network_timeout(&self) -> Duration {
        Duration::from_millis(self.network_timeout_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    /// Rejects serving on `listen` when same-origin fetches would come back
    /// to that same socket.
    ///
    /// Without an `upstream`, same-origin requests are fetched from the
    /// origin itself. If the origin is this listener, every cache miss would
    /// be proxied to ourselves.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Config`] if the origin resolves to `listen` and
    /// no upstream is set.
    pub fn check_listener(&self, listen: SocketAddr) -> Result<(), CacheError> {
        if self.upstream.is_some() {
            return Ok(());
        }
        let origin = self.origin_url()?;
        if origin.port_or_known_default() != Some(listen.port()) {
            return Ok(());
        }
        let local = |ip: IpAddr| ip.is_loopback() || ip.is_unspecified();
        let same_host = match origin.host() {
            Some(Host::Domain(domain)) => {
                domain.eq_ignore_ascii_case("localhost") && local(listen.ip())
            }
            Some(Host::Ipv4(ip)) => {
                IpAddr::V4(ip) == listen.ip() || (ip.is_loopback() && local(listen.ip()))
            }
            Some(Host::Ipv6(ip)) => {
                IpAddr::V6(ip) == listen.ip() || (ip.is_loopback() && local(listen.ip()))
            }
            None => false,
        };
        if same_host {
            return Err(CacheError::Config(format!(
                "origin {} is this server ({listen}); set `upstream` to where the site is served from",
                self.origin
            )));
        }
        Ok(())
    }

    /// Asset freshness window as a [`Duration`].
    pub fn asset_ttl(&self) -> Duration {
        Duration::from_secs(self.asset_ttl_secs)
    }
}

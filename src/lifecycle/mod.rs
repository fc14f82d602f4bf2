//! Install and activation lifecycle for one version of the cache.
//!
//! ```text
//! New ──install──▶ Installing ──▶ Installed ──activate──▶ Activating ──▶ Active
//!                      │
//!                      └── any precache fetch fails ──▶ Redundant
//! ```
//!
//! Installing fetches the whole precache manifest before writing anything, so
//! an install either populates the primary namespace completely or not at
//! all. Activating deletes every namespace outside the current [`VersionSet`]
//! and then claims control, after which the manager serves requests.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::try_join_all;
use tokio::sync::watch;
use tracing::{info, warn};
use url::Url;

use crate::cache::{CacheEntry, CacheStore, RequestKey};
use crate::error::CacheError;
use crate::fetch::Fetcher;
use crate::http::{Request, Response};

/// Where a lifecycle currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    New,
    Installing,
    /// Installed and waiting to be activated.
    Installed,
    Activating,
    Active,
    /// Install failed; this version will never serve requests.
    Redundant,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Installing => "installing",
            Self::Installed => "installed",
            Self::Activating => "activating",
            Self::Active => "active",
            Self::Redundant => "redundant",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The namespace names that belong to one build version.
///
/// Any namespace not named here is stale once this version activates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionSet {
    version: String,
    primary: String,
    runtime: String,
    offline: String,
}

impl VersionSet {
    pub fn new(app_tag: &str, version: &str) -> Self {
        Self {
            version: version.to_owned(),
            primary: format!("{app_tag}-precache-{version}"),
            runtime: format!("{app_tag}-runtime-{version}"),
            offline: format!("{app_tag}-offline-{version}"),
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Precached pages and cache-first assets.
    pub fn primary(&self) -> &str {
        &self.primary
    }

    /// Bounded namespace for stale-while-revalidate responses.
    pub fn runtime(&self) -> &str {
        &self.runtime
    }

    /// Holds the offline placeholder page.
    pub fn offline(&self) -> &str {
        &self.offline
    }

    pub fn names(&self) -> [&str; 3] {
        [&self.primary, &self.runtime, &self.offline]
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names().contains(&name)
    }
}

/// Drives install and activation for one [`VersionSet`].
pub struct LifecycleManager {
    versions: VersionSet,
    manifest: Vec<Url>,
    offline_url: Url,
    store: Arc<CacheStore>,
    fetcher: Arc<dyn Fetcher>,
    state: watch::Sender<LifecycleState>,
    claimed: AtomicBool,
}

impl LifecycleManager {
    /// Creates a lifecycle that precaches `manifest` and `offline_path`,
    /// both resolved against `origin`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Config`] if a path cannot be resolved.
    pub fn new(
        versions: VersionSet,
        origin: &Url,
        manifest: &[String],
        offline_path: &str,
        store: Arc<CacheStore>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Self, CacheError> {
        let resolve = |path: &str| {
            origin
                .join(path)
                .map_err(|e| CacheError::Config(format!("precache path {path:?}: {e}")))
        };
        let manifest = manifest
            .iter()
            .map(|p| resolve(p))
            .collect::<Result<Vec<_>, _>>()?;
        let offline_url = resolve(offline_path)?;
        let (state, _) = watch::channel(LifecycleState::New);
        Ok(Self {
            versions,
            manifest,
            offline_url,
            store,
            fetcher,
            state,
            claimed: AtomicBool::new(false),
        })
    }

    pub fn versions(&self) -> &VersionSet {
        &self.versions
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Watches state transitions.
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Key of the offline placeholder page.
    pub fn offline_key(&self) -> RequestKey {
        RequestKey::get(&self.offline_url)
    }

    /// Returns `true` once activation has claimed control of request handling.
    pub fn is_controlling(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    /// Moves from `from` to `to`, failing if the current state is not `from`.
    fn transition(&self, from: &[LifecycleState], to: LifecycleState) -> Result<(), CacheError> {
        let mut current = None;
        let moved = self.state.send_if_modified(|state| {
            if from.contains(state) {
                *state = to;
                true
            } else {
                current = Some(*state);
                false
            }
        });
        if moved {
            info!(version = self.versions.version(), state = %to, "lifecycle transition");
            Ok(())
        } else {
            Err(CacheError::InvalidState {
                state: current.unwrap_or(to).as_str(),
            })
        }
    }

    /// Fetches the precache manifest and the offline page, then writes them.
    ///
    /// Nothing is written unless every fetch succeeds with a `2xx` status. A
    /// failed install leaves this lifecycle [`Redundant`](LifecycleState::Redundant).
    ///
    /// # Errors
    ///
    /// - [`CacheError::InstallFailed`] — a fetch failed or returned a non-success status.
    /// - [`CacheError::InvalidState`] — install was already attempted.
    pub async fn install(&self) -> Result<(), CacheError> {
        self.transition(&[LifecycleState::New], LifecycleState::Installing)?;

        let mut targets = self.manifest.clone();
        if !targets.contains(&self.offline_url) {
            targets.push(self.offline_url.clone());
        }

        let fetched = match try_join_all(targets.iter().map(|url| self.precache_fetch(url))).await
        {
            Ok(responses) => responses,
            Err(e) => {
                warn!(version = self.versions.version(), error = %e, "install failed");
                self.state.send_replace(LifecycleState::Redundant);
                return Err(e);
            }
        };

        for (url, response) in targets.iter().zip(fetched) {
            let key = RequestKey::get(url);
            let entry = CacheEntry::from_response(&response, None);
            if *url == self.offline_url {
                self.store
                    .put(self.versions.offline(), key.clone(), entry.clone());
            }
            if self.manifest.contains(url) {
                self.store.put(self.versions.primary(), key, entry);
            }
        }

        info!(
            version = self.versions.version(),
            entries = self.manifest.len(),
            "precache complete"
        );
        self.transition(&[LifecycleState::Installing], LifecycleState::Installed)
    }

    async fn precache_fetch(&self, url: &Url) -> Result<Response, CacheError> {
        let failed = |reason: String| CacheError::InstallFailed {
            url: url.to_string(),
            reason,
        };
        let response = self
            .fetcher
            .fetch(Request::new(crate::http::Method::Get, url.clone()))
            .await
            .map_err(|e| failed(e.to_string()))?;
        if !response.is_success() {
            return Err(failed(format!("status {}", response.status())));
        }
        Ok(response)
    }

    /// Deletes stale namespaces and claims control.
    ///
    /// Returns the names of the deleted namespaces. Activating an already
    /// active lifecycle is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidState`] unless the lifecycle is installed or active.
    pub fn activate(&self) -> Result<Vec<String>, CacheError> {
        if self.state() == LifecycleState::Active {
            return Ok(Vec::new());
        }
        self.transition(&[LifecycleState::Installed], LifecycleState::Activating)?;

        let mut deleted = Vec::new();
        for name in self.store.names() {
            if self.versions.contains(&name) {
                continue;
            }
            if self.store.delete_namespace(&name) {
                info!(namespace = %name, "deleted stale namespace");
                deleted.push(name);
            } else {
                warn!(namespace = %name, "stale namespace already gone");
            }
        }

        self.claimed.store(true, Ordering::Release);
        self.transition(&[LifecycleState::Activating], LifecycleState::Active)?;
        Ok(deleted)
    }
}

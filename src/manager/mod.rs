//! The cache manager — one explicit object holding all per-process state.
//!
//! ```text
//! CacheManager::new ──start()──▶ install ──▶ activate ──▶ handle(request) …
//!                                   │            ▲
//!                                   └ waiting ───┘ SKIP_WAITING
//!                                                                 shutdown()
//! ```
//!
//! Construct it once, share it behind an [`Arc`], and hand out
//! [`ControlHandle`]s to anything that needs to steer it.
//!
//! An upgrade runs a second manager for the new version over the same
//! [`CacheStore`] (see [`CacheManager::with_store`]). The old manager keeps
//! serving until the new one activates, which deletes the old version's
//! namespaces; the host then routes requests to the new manager.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::background::BackgroundTasks;
use crate::cache::{CacheEntry, CacheStore, Freshness, RequestKey, Trimmer};
use crate::config::CacheConfig;
use crate::control::{
    self, CacheStatus, ControlCommand, ControlHandle, ControlMessage, ControlReply,
    NamespaceStatus,
};
use crate::error::{CacheError, FetchError};
use crate::events::{EventBus, ManagerEvent, MonitoredFetcher, NetworkMonitor};
use crate::fetch::{Fetcher, HttpFetcher};
use crate::http::{Method, Request, Response};
use crate::lifecycle::{LifecycleManager, LifecycleState, VersionSet};
use crate::router::{Route, StrategyRouter};
use crate::strategy::StrategyContext;

/// Routes requests to caching strategies and owns the cache's lifecycle.
pub struct CacheManager {
    config: CacheConfig,
    router: StrategyRouter,
    strategies: StrategyContext,
    lifecycle: LifecycleManager,
    events: EventBus,
    monitor: Arc<NetworkMonitor>,
    announced_install: AtomicBool,
}

impl CacheManager {
    /// Builds a manager over `fetcher` with an empty store. Nothing is
    /// fetched until [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Config`] if `config` does not validate.
    pub fn new(config: CacheConfig, fetcher: Arc<dyn Fetcher>) -> Result<Self, CacheError> {
        Self::with_store(config, fetcher, Arc::new(CacheStore::new()))
    }

    /// Builds a manager over an existing `store`, typically one a manager
    /// for the previous version is still serving from.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Config`] if `config` does not validate.
    pub fn with_store(
        config: CacheConfig,
        fetcher: Arc<dyn Fetcher>,
        store: Arc<CacheStore>,
    ) -> Result<Self, CacheError> {
        config.validate()?;
        let origin = config.origin_url()?;
        let router = StrategyRouter::from_config(&config)?;
        let versions = VersionSet::new(&config.app_tag, &config.version);

        let events = EventBus::default();
        let monitor = Arc::new(NetworkMonitor::new(events.clone()));
        let fetcher: Arc<dyn Fetcher> = Arc::new(MonitoredFetcher::new(fetcher, Arc::clone(&monitor)));

        let lifecycle = LifecycleManager::new(
            versions.clone(),
            &origin,
            &config.precache,
            &config.offline_url,
            Arc::clone(&store),
            Arc::clone(&fetcher),
        )?;

        let strategies = StrategyContext {
            store,
            fetcher,
            versions,
            freshness: Freshness::new(config.asset_ttl(), config.untimestamped_entries_fresh),
            trimmer: Trimmer::new(config.runtime_max_entries),
            network_timeout: config.network_timeout(),
            offline_key: lifecycle.offline_key(),
            tasks: BackgroundTasks::new(),
        };

        Ok(Self {
            config,
            router,
            strategies,
            lifecycle,
            events,
            monitor,
            announced_install: AtomicBool::new(false),
        })
    }

    /// Builds a manager that fetches over HTTP.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Config`] if `config` does not validate or the
    /// HTTP client cannot be built.
    pub fn with_http(config: CacheConfig) -> Result<Self, CacheError> {
        let fetcher = HttpFetcher::new(&config)?;
        Self::new(config, Arc::new(fetcher))
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.strategies.store
    }

    pub fn versions(&self) -> &VersionSet {
        &self.strategies.versions
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    /// Returns `true` once this manager serves requests from cache.
    pub fn is_controlling(&self) -> bool {
        self.lifecycle.is_controlling()
    }

    pub fn is_online(&self) -> bool {
        self.monitor.is_online()
    }

    /// The bus [`ManagerEvent`]s are published on. Host glue may publish too.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.events.subscribe()
    }

    /// Installs this version, then activates it or waits for `SKIP_WAITING`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InstallFailed`] if precaching failed.
    pub async fn start(&self) -> Result<(), CacheError> {
        self.install().await?;
        if self.config.skip_waiting {
            self.activate()?;
        } else {
            info!(version = self.versions().version(), "installed, waiting to activate");
            self.events.publish(ManagerEvent::UpdateAvailable);
        }
        Ok(())
    }

    /// Precaches the install manifest. See [`LifecycleManager::install`].
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InstallFailed`] if any precache fetch failed.
    pub async fn install(&self) -> Result<(), CacheError> {
        self.lifecycle.install().await
    }

    /// Deletes stale namespaces and starts serving from cache.
    ///
    /// Returns the names of the deleted namespaces.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidState`] unless this version is installed.
    pub fn activate(&self) -> Result<Vec<String>, CacheError> {
        let deleted = self.lifecycle.activate()?;
        if !self.announced_install.swap(true, Ordering::AcqRel) {
            self.events.publish(ManagerEvent::AppInstalled);
        }
        Ok(deleted)
    }

    /// Answers `request` from the network, the cache, or both.
    ///
    /// Non-`GET` and cross-origin requests, and every request before
    /// activation, go straight to the network without touching the cache.
    ///
    /// # Errors
    ///
    /// Fails when neither the network nor the cache could produce a response.
    pub async fn handle(&self, request: Request) -> Result<Response, CacheError> {
        if !self.lifecycle.is_controlling() {
            debug!(url = %request.url(), "not controlling, passing through");
            return self.pass_through(request).await;
        }
        let class = match self.router.route(&request) {
            Route::PassThrough => return self.pass_through(request).await,
            Route::Cached(class) => class,
        };
        let Some(key) = RequestKey::for_request(&request) else {
            return self.pass_through(request).await;
        };
        debug!(%key, class = class.as_str(), "routing");
        self.strategies.execute(class, request, key).await
    }

    async fn pass_through(&self, request: Request) -> Result<Response, CacheError> {
        Ok(self.strategies.fetcher.fetch(request).await?)
    }

    /// Executes one control command, returning the reply to send back, if any.
    ///
    /// `SKIP_WAITING` and `PREFETCH` reply only when they fail. Unknown tags
    /// are logged and never answered.
    pub async fn control(&self, command: ControlCommand) -> Option<ControlReply> {
        match command {
            ControlCommand::ClearCache => {
                let names = self.store().names();
                for name in &names {
                    self.store().delete_namespace(name);
                }
                info!(count = names.len(), "cleared all namespaces");
                Some(ControlReply::ok(ControlReply::CACHE_CLEARED))
            }
            ControlCommand::SkipWaiting => match self.activate() {
                Ok(_) => None,
                Err(e) => {
                    warn!(error = %e, "skip waiting failed");
                    Some(ControlReply::failed(ControlCommand::SKIP_WAITING, e.to_string()))
                }
            },
            ControlCommand::GetCacheStatus => {
                let status = self.status();
                match serde_json::to_value(&status) {
                    Ok(payload) => {
                        Some(ControlReply::ok(ControlReply::CACHE_STATUS).with_payload(payload))
                    }
                    Err(e) => Some(ControlReply::failed(
                        ControlCommand::GET_CACHE_STATUS,
                        e.to_string(),
                    )),
                }
            }
            ControlCommand::Prefetch { url } => match self.prefetch(&url).await {
                Ok(()) => None,
                Err(e) => {
                    warn!(%url, error = %e, "prefetch failed");
                    Some(ControlReply::failed(ControlCommand::PREFETCH, e.to_string()))
                }
            },
            ControlCommand::Malformed { tag, reason } => {
                warn!(%tag, %reason, "malformed control message");
                Some(ControlReply::failed(tag, reason))
            }
            ControlCommand::Unknown(tag) => {
                warn!(%tag, "unrecognized control message");
                None
            }
        }
    }

    /// A snapshot of every namespace and its URLs.
    pub fn status(&self) -> CacheStatus {
        let caches = self
            .store()
            .names()
            .into_iter()
            .map(|name| {
                let urls: Vec<String> = self
                    .store()
                    .keys(&name)
                    .iter()
                    .map(|k| k.url().to_owned())
                    .collect();
                let status = NamespaceStatus {
                    entries: urls.len(),
                    urls,
                };
                (name, status)
            })
            .collect::<BTreeMap<_, _>>();
        CacheStatus {
            version: self.versions().version().to_owned(),
            caches,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// Fetches `url` (absolute, or a path on the origin) into the primary namespace.
    ///
    /// # Errors
    ///
    /// Fails if the URL does not resolve, the fetch fails or outlasts
    /// `fetch_timeout_ms`, or the status is not `2xx`.
    pub async fn prefetch(&self, url: &str) -> Result<(), CacheError> {
        let url = self
            .config
            .origin_url()?
            .join(url)
            .map_err(|e| CacheError::Config(format!("prefetch url {url:?}: {e}")))?;
        let key = RequestKey::get(&url);
        let limit = self.config.fetch_timeout();
        let fetch = self.strategies.fetcher.fetch(Request::new(Method::Get, url));
        let response = tokio::time::timeout(limit, fetch)
            .await
            .map_err(|_| FetchError::Timeout {
                url: key.url().to_owned(),
                after_ms: limit.as_millis() as u64,
            })??;
        if !response.is_success() {
            return Err(CacheError::Status {
                url: key.url().to_owned(),
                status: response.status().as_u16(),
            });
        }
        debug!(%key, "prefetched");
        self.store().put(
            self.versions().primary(),
            key,
            CacheEntry::from_response(&response, Some(Utc::now())),
        );
        Ok(())
    }

    /// Starts the control loop and returns a handle to it.
    ///
    /// Messages are handled one at a time, in arrival order, except
    /// `PREFETCH`: it runs as a background task that answers on its own, so a
    /// slow origin never holds up the commands behind it. The loop ends once
    /// every handle has been dropped.
    pub fn spawn_control_loop(self: &Arc<Self>) -> ControlHandle {
        let (handle, mut rx) = control::channel();
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                manager.dispatch(message).await;
            }
            debug!("control loop stopped");
        });
        handle
    }

    async fn dispatch(self: &Arc<Self>, message: ControlMessage) {
        debug!(tag = message.command.tag(), "control message");
        if let ControlCommand::Prefetch { .. } = message.command {
            let manager = Arc::clone(self);
            let prefetch = async move { manager.answer(message).await };
            if let Err(prefetch) = self.strategies.tasks.spawn(prefetch) {
                prefetch.await;
            }
            return;
        }
        self.answer(message).await;
    }

    async fn answer(&self, message: ControlMessage) {
        if let Some(answer) = self.control(message.command.clone()).await {
            message.respond(answer);
        }
    }

    /// Refuses new background work, then waits for in-flight revalidations,
    /// fetches, trims, and prefetches.
    ///
    /// Requests handled afterwards still get answers, but nothing is
    /// detached for them: stale-while-revalidate skips its refresh on a hit
    /// and fetches inline on a miss.
    pub async fn shutdown(&self) {
        info!("shutting down");
        self.strategies.tasks.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::http::StatusCode;
    use crate::testing::StubFetcher;

    const ORIGIN: &str = "http://localhost:8080";

    fn url(path: &str) -> String {
        format!("{ORIGIN}{path}")
    }

    fn config() -> CacheConfig {
        CacheConfig {
            app_tag: "app".into(),
            version: "v2".into(),
            origin: ORIGIN.into(),
            precache: vec!["/".into(), "/offline.html".into()],
            offline_url: "/offline.html".into(),
            runtime_max_entries: 2,
            ..CacheConfig::default()
        }
    }

    fn stub() -> Arc<StubFetcher> {
        let fetcher = Arc::new(StubFetcher::new());
        fetcher.respond(&url("/"), 200, "home");
        fetcher.respond(&url("/offline.html"), 200, "offline");
        fetcher
    }

    async fn started(fetcher: Arc<StubFetcher>) -> Arc<CacheManager> {
        let manager = Arc::new(CacheManager::new(config(), fetcher).unwrap());
        manager.start().await.unwrap();
        manager
    }

    #[tokio::test]
    async fn start_installs_and_activates() {
        let manager = started(stub()).await;
        assert_eq!(manager.state(), LifecycleState::Active);
        assert!(manager.is_controlling());
        assert_eq!(manager.store().keys("app-precache-v2").len(), 2);
        assert_eq!(manager.store().keys("app-offline-v2").len(), 1);
    }

    #[tokio::test]
    async fn waiting_version_announces_update() {
        let manager = CacheManager::new(
            CacheConfig {
                skip_waiting: false,
                ..config()
            },
            stub(),
        )
        .unwrap();
        let mut events = manager.subscribe();

        manager.start().await.unwrap();
        assert_eq!(manager.state(), LifecycleState::Installed);
        assert_eq!(events.recv().await.unwrap(), ManagerEvent::UpdateAvailable);

        assert!(manager.control(ControlCommand::SkipWaiting).await.is_none());
        assert_eq!(manager.state(), LifecycleState::Active);
        assert_eq!(events.recv().await.unwrap(), ManagerEvent::AppInstalled);
    }

    #[tokio::test]
    async fn passes_through_before_activation() {
        let fetcher = stub();
        fetcher.respond(&url("/app.js"), 200, "js");
        let manager = CacheManager::new(config(), Arc::clone(&fetcher) as Arc<dyn Fetcher>).unwrap();

        let res = manager.handle(Request::get(&url("/app.js")).unwrap()).await.unwrap();
        assert_eq!(res.content().as_ref(), b"js");
        assert!(manager.store().names().is_empty());
    }

    #[tokio::test]
    async fn non_get_and_cross_origin_bypass_cache() {
        let fetcher = stub();
        fetcher.respond("https://cdn.example.com/lib.js", 200, "cdn");
        fetcher.respond(&url("/api/submit"), 201, "created");
        let manager = started(Arc::clone(&fetcher)).await;

        let cross = Request::get("https://cdn.example.com/lib.js").unwrap();
        assert_eq!(manager.handle(cross).await.unwrap().content().as_ref(), b"cdn");

        let post = Request::new(Method::Post, url::Url::parse(&url("/api/submit")).unwrap());
        let res = manager.handle(post).await.unwrap();
        assert_eq!(res.status(), StatusCode::from_u16(201));

        manager.shutdown().await;
        assert!(manager.store().keys("app-runtime-v2").is_empty());
        assert_eq!(manager.store().keys("app-precache-v2").len(), 2);
    }

    #[tokio::test]
    async fn document_falls_back_to_precache_when_offline() {
        let fetcher = stub();
        let manager = started(Arc::clone(&fetcher)).await;
        let mut events = manager.subscribe();
        fetcher.fail(&url("/"));

        let res = manager.handle(Request::get(&url("/")).unwrap()).await.unwrap();
        assert_eq!(res.content().as_ref(), b"home");
        assert!(!manager.is_online());
        assert_eq!(events.recv().await.unwrap(), ManagerEvent::NetworkOffline);
    }

    #[tokio::test]
    async fn clear_cache_twice_leaves_nothing() {
        let manager = started(stub()).await;

        for _ in 0..2 {
            let reply = manager.control(ControlCommand::ClearCache).await.unwrap();
            assert!(reply.success);
            assert_eq!(reply.tag, "CACHE_CLEARED");
            assert!(manager.store().names().is_empty());
        }
    }

    #[tokio::test]
    async fn cache_status_lists_every_namespace() {
        let manager = started(stub()).await;

        let reply = manager.control(ControlCommand::GetCacheStatus).await.unwrap();
        assert!(reply.success);
        assert_eq!(reply.tag, "CACHE_STATUS");

        let payload = reply.payload.unwrap();
        assert_eq!(payload["version"], json!("v2"));
        assert_eq!(payload["caches"]["app-precache-v2"]["entries"], json!(2));
        assert_eq!(
            payload["caches"]["app-offline-v2"]["urls"],
            json!([url("/offline.html")])
        );
        assert!(payload["timestamp"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn prefetch_writes_primary() {
        let fetcher = stub();
        fetcher.respond(&url("/about.html"), 200, "about");
        let manager = started(fetcher).await;

        let reply = manager
            .control(ControlCommand::Prefetch {
                url: "/about.html".into(),
            })
            .await;
        assert!(reply.is_none());

        let key = RequestKey::get(&url::Url::parse(&url("/about.html")).unwrap());
        assert!(manager.store().get("app-precache-v2", &key).is_some());
    }

    #[tokio::test]
    async fn prefetch_failure_is_reported() {
        let manager = started(stub()).await;
        let reply = manager
            .control(ControlCommand::Prefetch {
                url: "/missing.html".into(),
            })
            .await
            .unwrap();
        assert!(!reply.success);
        assert_eq!(reply.tag, "PREFETCH");
    }

    #[tokio::test]
    async fn unknown_command_gets_no_reply() {
        let manager = started(stub()).await;
        let handle = manager.spawn_control_loop();

        let err = handle
            .request(ControlCommand::Unknown("REBOOT".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, control::ChannelError::NoReply { .. }));

        // The loop survives and keeps answering.
        let reply = handle.request(ControlCommand::ClearCache).await.unwrap();
        assert_eq!(reply.tag, "CACHE_CLEARED");
    }

    #[tokio::test]
    async fn failed_install_leaves_no_primary() {
        let fetcher = Arc::new(StubFetcher::new());
        fetcher.respond(&url("/"), 200, "home");
        let manager = CacheManager::new(config(), fetcher).unwrap();

        let err = manager.start().await.unwrap_err();
        assert!(matches!(err, CacheError::InstallFailed { .. }));
        assert_eq!(manager.state(), LifecycleState::Redundant);
        assert!(!manager.store().has("app-precache-v2"));
        assert!(!manager.is_controlling());
    }

    #[tokio::test]
    async fn skip_waiting_before_install_fails() {
        let manager = Arc::new(CacheManager::new(config(), stub()).unwrap());
        let handle = manager.spawn_control_loop();

        let reply = handle.request(ControlCommand::SkipWaiting).await.unwrap();
        assert!(!reply.success);
        assert_eq!(reply.tag, "SKIP_WAITING");
        assert!(reply.payload.unwrap()["error"].as_str().is_some());
        assert!(!manager.is_controlling());
    }

    #[tokio::test]
    async fn malformed_prefetch_is_answered_over_the_loop() {
        let manager = started(stub()).await;
        let handle = manager.spawn_control_loop();

        let wire = control::ControlRequest::new(ControlCommand::PREFETCH).with_payload(json!({}));
        let reply = handle.request(wire.into()).await.unwrap();
        assert!(!reply.success);
        assert_eq!(reply.tag, "PREFETCH");
        assert_eq!(reply.payload.unwrap()["error"], json!("payload.url is required"));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_prefetch_does_not_hold_up_the_loop() {
        let fetcher = stub();
        fetcher.delay(&url("/huge.bin"), Duration::from_secs(3600), "huge");
        let manager = started(fetcher).await;
        let handle = manager.spawn_control_loop();

        handle
            .post(ControlCommand::Prefetch {
                url: "/huge.bin".into(),
            })
            .await
            .unwrap();
        let cleared = tokio::time::timeout(
            Duration::from_secs(60),
            handle.request(ControlCommand::ClearCache),
        )
        .await
        .expect("clear cache answered while the prefetch is stalled")
        .unwrap();
        assert_eq!(cleared.tag, "CACHE_CLEARED");

        let started = tokio::time::Instant::now();
        let failed = handle
            .request(ControlCommand::Prefetch {
                url: "/huge.bin".into(),
            })
            .await
            .unwrap();
        assert!(!failed.success);
        let limit = manager.config().fetch_timeout();
        assert!(started.elapsed() >= limit && started.elapsed() < limit + Duration::from_secs(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn control_commands_interleave_with_requests() {
        let fetcher = stub();
        for i in 0..24 {
            fetcher.respond(&url(&format!("/api/item/{i}")), 200, "item");
        }
        let manager = started(fetcher).await;
        let handle = manager.spawn_control_loop();

        let requests = (0..24).map(|i| {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                let request = Request::get(&url(&format!("/api/item/{i}"))).unwrap();
                manager.handle(request).await
            })
        });
        let commands = (0..8).map(|i| {
            let handle = handle.clone();
            tokio::spawn(async move {
                let command = if i % 2 == 0 {
                    ControlCommand::ClearCache
                } else {
                    ControlCommand::GetCacheStatus
                };
                handle.request(command).await
            })
        });

        for response in futures::future::join_all(requests).await {
            assert_eq!(response.unwrap().unwrap().content().as_ref(), b"item");
        }
        for reply in futures::future::join_all(commands).await {
            assert!(reply.unwrap().unwrap().success);
        }

        manager.shutdown().await;
        let status = manager.status();
        for namespace in status.caches.values() {
            assert_eq!(namespace.entries, namespace.urls.len());
        }
        assert!(manager.store().keys("app-runtime-v2").len() <= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_document_fetch_still_reports_offline() {
        let fetcher = stub();
        fetcher.stall(&url("/checkout.html"), Duration::from_secs(60));
        let manager = started(Arc::clone(&fetcher)).await;
        let mut events = manager.subscribe();

        let res = manager
            .handle(Request::get(&url("/checkout.html")).unwrap())
            .await
            .unwrap();
        assert_eq!(res.content().as_ref(), b"offline");
        assert!(manager.is_online());

        manager.shutdown().await;
        assert!(!manager.is_online());
        assert_eq!(events.recv().await.unwrap(), ManagerEvent::NetworkOffline);
    }

    #[tokio::test]
    async fn no_background_work_after_shutdown() {
        let fetcher = stub();
        fetcher.respond(&url("/api/feed"), 200, "feed");
        let manager = started(Arc::clone(&fetcher)).await;
        manager.handle(Request::get(&url("/api/feed")).unwrap()).await.unwrap();
        manager.shutdown().await;
        let calls = fetcher.calls(&url("/api/feed"));

        let res = manager.handle(Request::get(&url("/api/feed")).unwrap()).await.unwrap();
        assert_eq!(res.content().as_ref(), b"feed");
        assert!(manager.strategies.tasks.is_empty());
        assert_eq!(fetcher.calls(&url("/api/feed")), calls);
    }

    #[tokio::test]
    async fn shutdown_waits_for_revalidation() {
        let fetcher = stub();
        fetcher.respond(&url("/api/feed"), 200, "feed");
        let manager = started(fetcher).await;

        manager.handle(Request::get(&url("/api/feed")).unwrap()).await.unwrap();
        manager.shutdown().await;

        let key = RequestKey::get(&url::Url::parse(&url("/api/feed")).unwrap());
        assert!(manager.store().get("app-runtime-v2", &key).is_some());
    }
}

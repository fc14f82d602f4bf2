//! End-to-end scenarios against the public API, with closure fetchers
//! standing in for the network.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use rescache::cache::CacheEntry;
use rescache::{
    CacheConfig, CacheError, CacheManager, CacheStore, ControlCommand, FetchError, Fetcher,
    LifecycleState, Method, Request, RequestKey, Response, StatusCode,
};

const ORIGIN: &str = "http://localhost:8080";

fn url(path: &str) -> String {
    format!("{ORIGIN}{path}")
}

fn config() -> CacheConfig {
    CacheConfig {
        app_tag: "shop".into(),
        version: "v3".into(),
        origin: ORIGIN.into(),
        precache: vec!["/".into(), "/offline.html".into()],
        offline_url: "/offline.html".into(),
        ..CacheConfig::default()
    }
}

/// A network that knows a fixed set of paths and is unreachable for the rest.
fn site(pages: &[(&str, &str)]) -> Arc<dyn Fetcher> {
    let pages: HashMap<String, String> = pages
        .iter()
        .map(|(path, body)| ((*path).to_owned(), (*body).to_owned()))
        .collect();
    Arc::new(move |request: Request| {
        let page = pages.get(request.path()).cloned();
        let url = request.url().to_string();
        async move {
            match page {
                Some(body) => Ok(Response::new(StatusCode::OK).body(body)),
                None => Err(FetchError::Transport {
                    url,
                    message: "unreachable".into(),
                }),
            }
        }
    })
}

fn basic_site() -> Arc<dyn Fetcher> {
    site(&[("/", "home"), ("/offline.html", "you are offline")])
}

#[tokio::test]
async fn install_precaches_manifest() {
    let manager = CacheManager::new(config(), basic_site()).unwrap();
    manager.install().await.unwrap();

    assert_eq!(manager.state(), LifecycleState::Installed);
    assert_eq!(manager.store().keys("shop-precache-v3").len(), 2);
}

#[tokio::test]
async fn install_is_all_or_nothing() {
    let manager = CacheManager::new(config(), site(&[("/", "home")])).unwrap();

    let err = manager.install().await.unwrap_err();
    assert!(matches!(err, CacheError::InstallFailed { .. }));
    assert!(manager.store().keys("shop-precache-v3").is_empty());
    assert_eq!(manager.state(), LifecycleState::Redundant);
}

#[tokio::test]
async fn activation_removes_other_versions() {
    let manager = CacheManager::new(config(), basic_site()).unwrap();
    let stale = Response::new(StatusCode::OK).body("old");
    let key = RequestKey::get(&url::Url::parse(&url("/")).unwrap());
    for name in ["shop-precache-v2", "shop-runtime-v2", "other-app-v9"] {
        manager
            .store()
            .put(name, key.clone(), CacheEntry::from_response(&stale, None));
    }

    manager.start().await.unwrap();

    let mut names = manager.store().names();
    names.sort();
    assert_eq!(names, vec!["shop-offline-v3", "shop-precache-v3"]);
}

#[tokio::test(start_paused = true)]
async fn slow_document_serves_offline_page() {
    let fetcher: Arc<dyn Fetcher> = Arc::new(|request: Request| async move {
        match request.path() {
            "/" => Ok(Response::new(StatusCode::OK).body("home")),
            "/offline.html" => Ok(Response::new(StatusCode::OK).body("you are offline")),
            _ => {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, FetchError>(Response::new(StatusCode::OK).body("too late"))
            }
        }
    });
    let manager = CacheManager::new(config(), fetcher).unwrap();
    manager.start().await.unwrap();

    let started = tokio::time::Instant::now();
    let response = manager
        .handle(Request::get(&url("/checkout.html")).unwrap())
        .await
        .unwrap();

    assert_eq!(response.content().as_ref(), b"you are offline");
    assert!(started.elapsed() < Duration::from_secs(6));
}

#[tokio::test]
async fn revalidated_content_shows_up_on_next_request() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let fetcher: Arc<dyn Fetcher> = Arc::new(move |request: Request| {
        let body = match request.path() {
            "/api/feed" => format!("feed #{}", counter.fetch_add(1, Ordering::SeqCst) + 1),
            "/" => "home".to_owned(),
            _ => "you are offline".to_owned(),
        };
        async move { Ok::<_, FetchError>(Response::new(StatusCode::OK).body(body)) }
    });
    let manager = CacheManager::new(config(), fetcher).unwrap();
    manager.start().await.unwrap();

    let feed = || Request::get(&url("/api/feed")).unwrap();

    // Miss: waits for the network.
    let first = manager.handle(feed()).await.unwrap();
    assert_eq!(first.content().as_ref(), b"feed #1");

    // Hit: the cached copy comes back while a refresh runs.
    let second = manager.handle(feed()).await.unwrap();
    assert_eq!(second.content().as_ref(), b"feed #1");

    manager.shutdown().await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // After shutdown the cached copy is served without another refresh.
    let third = manager.handle(feed()).await.unwrap();
    assert_eq!(third.content().as_ref(), b"feed #2");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

fn sorted_names(store: &CacheStore) -> Vec<String> {
    let mut names = store.names();
    names.sort();
    names
}

#[tokio::test]
async fn upgrade_runs_beside_the_serving_version() {
    let store = Arc::new(CacheStore::new());
    let serving = CacheManager::with_store(
        CacheConfig {
            version: "v2".into(),
            ..config()
        },
        basic_site(),
        Arc::clone(&store),
    )
    .unwrap();
    serving.start().await.unwrap();

    // The new build's offline page is missing: its install must not disturb v2.
    let broken = CacheManager::with_store(config(), site(&[("/", "home")]), Arc::clone(&store)).unwrap();
    assert!(matches!(
        broken.start().await.unwrap_err(),
        CacheError::InstallFailed { .. }
    ));
    assert_eq!(sorted_names(&store), vec!["shop-offline-v2", "shop-precache-v2"]);
    assert!(serving.is_controlling());
    let page = serving.handle(Request::get(&url("/")).unwrap()).await.unwrap();
    assert_eq!(page.content().as_ref(), b"home");

    // A good build activates and removes everything v2 left behind.
    let upgraded = CacheManager::with_store(config(), basic_site(), Arc::clone(&store)).unwrap();
    upgraded.start().await.unwrap();
    assert_eq!(sorted_names(&store), vec!["shop-offline-v3", "shop-precache-v3"]);
    assert!(Arc::ptr_eq(upgraded.store(), serving.store()));
}

#[tokio::test]
async fn control_loop_round_trip() {
    let manager = Arc::new(CacheManager::new(config(), basic_site()).unwrap());
    manager.start().await.unwrap();
    let control = manager.spawn_control_loop();

    let status = control.request(ControlCommand::GetCacheStatus).await.unwrap();
    assert!(status.success);
    assert_eq!(status.tag, "CACHE_STATUS");
    let payload = status.payload.unwrap();
    assert_eq!(payload["version"], "v3");
    assert_eq!(payload["caches"]["shop-precache-v3"]["entries"], 2);

    for _ in 0..2 {
        let cleared = control.request(ControlCommand::ClearCache).await.unwrap();
        assert!(cleared.success);
        assert_eq!(cleared.tag, "CACHE_CLEARED");
        assert!(manager.store().names().is_empty());
    }

    // No reply for a successful prefetch.
    let prefetched = control
        .send(ControlCommand::Prefetch { url: "/".into() })
        .await
        .unwrap();
    assert!(prefetched.is_none());
    assert_eq!(manager.store().keys("shop-precache-v3").len(), 1);
}

#[tokio::test]
async fn writes_bypass_the_cache() {
    let manager = CacheManager::new(config(), basic_site()).unwrap();
    manager.start().await.unwrap();

    let post = Request::new(Method::Post, url::Url::parse(&url("/")).unwrap());
    let response = manager.handle(post).await.unwrap();
    assert_eq!(response.content().as_ref(), b"home");
    assert!(manager.store().keys("shop-runtime-v3").is_empty());
}

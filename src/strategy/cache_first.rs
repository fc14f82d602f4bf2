//! Cache-first: static assets.

use chrono::Utc;
use tracing::debug;

use super::StrategyContext;
use crate::cache::{CacheEntry, RequestKey};
use crate::error::CacheError;
use crate::http::{Request, Response};

/// Serves a fresh cached copy without touching the network; otherwise fetches,
/// stores the result stamped with the current time, and returns it.
///
/// Staleness is soft: when the refresh fails, or comes back with a
/// non-success status, the stale copy is served instead.
///
/// # Errors
///
/// Returns [`CacheError::Network`] when the fetch fails and nothing is cached.
pub async fn cache_first(
    ctx: &StrategyContext,
    request: Request,
    key: RequestKey,
) -> Result<Response, CacheError> {
    let cached = ctx.store.get(ctx.versions.primary(), &key);
    if let Some(entry) = &cached {
        if ctx.freshness.is_fresh(entry, Utc::now()) {
            debug!(%key, "cache-first: fresh hit");
            return Ok(entry.to_response());
        }
        debug!(%key, "cache-first: stale hit, refreshing");
    }

    match ctx.fetcher.fetch(request).await {
        Ok(response) if response.is_success() => {
            ctx.store.put(
                ctx.versions.primary(),
                key,
                CacheEntry::from_response(&response, Some(Utc::now())),
            );
            Ok(response)
        }
        Ok(response) => match cached {
            Some(entry) => {
                debug!(%key, status = %response.status(), "cache-first: serving stale over error status");
                Ok(entry.to_response())
            }
            None => Ok(response),
        },
        Err(e) => match cached {
            Some(entry) => {
                debug!(%key, error = %e, "cache-first: serving stale copy");
                Ok(entry.to_response())
            }
            None => Err(e.into()),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{DateTime, TimeDelta};

    use super::*;
    use crate::http::StatusCode;
    use crate::strategy::test_support::{context, request, url};
    use crate::testing::StubFetcher;

    fn seed(ctx: &StrategyContext, path: &str, body: &'static str, stored_at: Option<DateTime<Utc>>) {
        let (_, key) = request(path);
        let response = Response::new(StatusCode::OK).body(body);
        ctx.store.put(
            ctx.versions.primary(),
            key,
            CacheEntry::from_response(&response, stored_at),
        );
    }

    #[tokio::test]
    async fn fresh_entry_skips_network() {
        let fetcher = Arc::new(StubFetcher::new());
        fetcher.respond(&url("/app.js"), 200, "new");
        let ctx = context(Arc::clone(&fetcher));
        seed(&ctx, "/app.js", "old", Some(Utc::now() - TimeDelta::days(1)));

        let (req, key) = request("/app.js");
        let res = cache_first(&ctx, req, key).await.unwrap();

        assert_eq!(res.content().as_ref(), b"old");
        assert_eq!(fetcher.total_calls(), 0);
    }

    #[tokio::test]
    async fn untimestamped_entry_is_fresh() {
        let fetcher = Arc::new(StubFetcher::new());
        let ctx = context(Arc::clone(&fetcher));
        seed(&ctx, "/logo.png", "precached", None);

        let (req, key) = request("/logo.png");
        let res = cache_first(&ctx, req, key).await.unwrap();

        assert_eq!(res.content().as_ref(), b"precached");
        assert_eq!(fetcher.total_calls(), 0);
    }

    #[tokio::test]
    async fn stale_entry_is_refreshed_and_stamped() {
        let fetcher = Arc::new(StubFetcher::new());
        fetcher.respond(&url("/app.css"), 200, "new css");
        let ctx = context(Arc::clone(&fetcher));
        seed(&ctx, "/app.css", "old css", Some(Utc::now() - TimeDelta::days(8)));

        let before = Utc::now();
        let (req, key) = request("/app.css");
        let res = cache_first(&ctx, req, key.clone()).await.unwrap();

        assert_eq!(res.content().as_ref(), b"new css");
        let stored = ctx.store.get(ctx.versions.primary(), &key).unwrap();
        assert_eq!(stored.body, "new css");
        assert!(stored.stored_at.unwrap() >= before);
    }

    #[tokio::test]
    async fn stale_entry_survives_network_failure() {
        let fetcher = Arc::new(StubFetcher::new());
        fetcher.fail(&url("/font.woff2"));
        let ctx = context(Arc::clone(&fetcher));
        seed(&ctx, "/font.woff2", "stale font", Some(Utc::now() - TimeDelta::days(30)));

        let (req, key) = request("/font.woff2");
        let res = cache_first(&ctx, req, key).await.unwrap();

        assert_eq!(res.content().as_ref(), b"stale font");
        assert_eq!(fetcher.calls(&url("/font.woff2")), 1);
    }

    #[tokio::test]
    async fn stale_entry_preferred_over_error_status() {
        let fetcher = Arc::new(StubFetcher::new());
        fetcher.respond(&url("/app.js"), 500, "boom");
        let ctx = context(fetcher);
        seed(&ctx, "/app.js", "stale js", Some(Utc::now() - TimeDelta::days(30)));

        let (req, key) = request("/app.js");
        let res = cache_first(&ctx, req, key).await.unwrap();
        assert_eq!(res.content().as_ref(), b"stale js");
    }

    #[tokio::test]
    async fn miss_is_fetched_and_stored() {
        let fetcher = Arc::new(StubFetcher::new());
        fetcher.respond(&url("/icon.svg"), 200, "<svg/>");
        let ctx = context(fetcher);

        let (req, key) = request("/icon.svg");
        cache_first(&ctx, req, key.clone()).await.unwrap();
        assert!(ctx.store.get(ctx.versions.primary(), &key).is_some());
    }

    #[tokio::test]
    async fn miss_with_error_status_is_not_stored() {
        let fetcher = Arc::new(StubFetcher::new());
        fetcher.respond(&url("/gone.js"), 404, "");
        let ctx = context(fetcher);

        let (req, key) = request("/gone.js");
        let res = cache_first(&ctx, req, key.clone()).await.unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        assert!(ctx.store.get(ctx.versions.primary(), &key).is_none());
    }

    #[tokio::test]
    async fn miss_with_network_failure_propagates() {
        let ctx = context(Arc::new(StubFetcher::new()));
        let (req, key) = request("/app.js");
        let err = cache_first(&ctx, req, key).await.unwrap_err();
        assert!(matches!(err, CacheError::Network(_)));
    }
}

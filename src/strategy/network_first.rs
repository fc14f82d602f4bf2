//! Network-first: documents.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::oneshot;
use tracing::debug;

use super::StrategyContext;
use crate::cache::{CacheEntry, RequestKey};
use crate::error::CacheError;
use crate::http::{Request, Response};

/// Fetches `request` with a timeout, falling back to the cached copy and then
/// to the offline placeholder.
///
/// A successful response is written to the primary namespace before it is
/// returned. The fetch runs as a background task, so when the timeout elapses
/// it is abandoned rather than cancelled: it still completes and reports
/// reachability, but its result is discarded and not cached.
///
/// A non-success response with nothing to fall back on is returned as-is.
///
/// # Errors
///
/// Returns [`CacheError::Exhausted`] when the network produced nothing and
/// neither a cached copy nor the offline placeholder exists.
pub async fn network_first(
    ctx: &StrategyContext,
    request: Request,
    key: RequestKey,
) -> Result<Response, CacheError> {
    let (tx, rx) = oneshot::channel();
    let fetcher = Arc::clone(&ctx.fetcher);
    let fetch = async move {
        let _ = tx.send(fetcher.fetch(request).await);
    };
    let attempt = match ctx.tasks.spawn(fetch) {
        Ok(_) => tokio::time::timeout(ctx.network_timeout, rx).await,
        Err(fetch) => {
            tokio::time::timeout(ctx.network_timeout, async move {
                fetch.await;
                rx.await
            })
            .await
        }
    };

    let unusable = match attempt.map(|received| received.ok()) {
        Ok(Some(Ok(response))) if response.is_success() => {
            ctx.store.put(
                ctx.versions.primary(),
                key,
                CacheEntry::from_response(&response, Some(Utc::now())),
            );
            return Ok(response);
        }
        Ok(Some(Ok(response))) => {
            debug!(%key, status = %response.status(), "network-first: unsuccessful status");
            Some(response)
        }
        Ok(Some(Err(e))) => {
            debug!(%key, error = %e, "network-first: fetch failed");
            None
        }
        Ok(None) => {
            debug!(%key, "network-first: fetch ended without a result");
            None
        }
        Err(_) => {
            debug!(
                %key,
                timeout_ms = ctx.network_timeout.as_millis() as u64,
                "network-first: timed out"
            );
            None
        }
    };

    if let Some(entry) = ctx.store.get(ctx.versions.primary(), &key) {
        debug!(%key, "network-first: serving cached copy");
        return Ok(entry.to_response());
    }
    if let Some(entry) = ctx.store.get(ctx.versions.offline(), &ctx.offline_key) {
        debug!(%key, "network-first: serving offline placeholder");
        return Ok(entry.to_response());
    }

    unusable.ok_or_else(|| CacheError::Exhausted {
        key: key.to_string(),
    })
}

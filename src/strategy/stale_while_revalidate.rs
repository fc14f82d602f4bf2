//! Stale-while-revalidate: dynamic requests.

use chrono::Utc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::StrategyContext;
use crate::cache::{CacheEntry, RequestKey};
use crate::error::{CacheError, FetchError};
use crate::http::{Request, Response};

/// Answers from the runtime namespace when possible while always refreshing
/// it from the network.
///
/// The refresh runs as a detached background task started before the cache
/// lookup. With a cached entry the caller gets it immediately and never waits
/// on the network; without one the caller waits for the refresh. Either way,
/// the refresh stores a successful response and trims the runtime namespace.
///
/// After the manager's shutdown barrier has started, nothing is detached: a
/// cached entry is served without a refresh, and a miss is fetched inline.
///
/// # Errors
///
/// Returns [`CacheError::Network`] when nothing is cached and the fetch fails.
pub async fn stale_while_revalidate(
    ctx: &StrategyContext,
    request: Request,
    key: RequestKey,
) -> Result<Response, CacheError> {
    let (tx, rx) = oneshot::channel::<Result<Response, FetchError>>();
    let refresh = ctx.clone();
    let refresh_key = key.clone();
    let revalidate = async move {
        let result = refresh.fetcher.fetch(request).await;
        match &result {
            Ok(response) if response.is_success() => {
                let runtime = refresh.versions.runtime();
                refresh.store.put(
                    runtime,
                    refresh_key.clone(),
                    CacheEntry::from_response(response, Some(Utc::now())),
                );
                refresh.trimmer.trim(&refresh.store, runtime);
                debug!(key = %refresh_key, "revalidated");
            }
            Ok(response) => {
                debug!(key = %refresh_key, status = %response.status(), "revalidation not stored");
            }
            Err(e) => warn!(key = %refresh_key, error = %e, "revalidation failed"),
        }
        // The caller only listens when it had nothing cached.
        let _ = tx.send(result);
    };
    let refused = ctx.tasks.spawn(revalidate).err();

    if let Some(entry) = ctx.store.get(ctx.versions.runtime(), &key) {
        debug!(%key, "stale-while-revalidate: serving cached copy");
        return Ok(entry.to_response());
    }
    if let Some(revalidate) = refused {
        debug!(%key, "stale-while-revalidate: shutting down, fetching inline");
        revalidate.await;
    }

    match rx.await {
        Ok(result) => result.map_err(CacheError::from),
        Err(_) => Err(CacheError::Exhausted {
            key: key.to_string(),
        }),
    }
}

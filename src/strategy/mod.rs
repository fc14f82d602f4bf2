//! Strategy executors — turn a routed request into a response.
//!
//! | Strategy                   | Class    | Reads             | Writes            | Waits on network        |
//! |----------------------------|----------|-------------------|-------------------|-------------------------|
//! | [`network_first`]          | Document | primary, offline  | primary           | up to the timeout       |
//! | [`cache_first`]            | Asset    | primary           | primary (stamped) | only when stale/absent  |
//! | [`stale_while_revalidate`] | Dynamic  | runtime           | runtime, trimmed  | only when absent        |

use std::sync::Arc;
use std::time::Duration;

use crate::background::BackgroundTasks;
use crate::cache::{CacheStore, Freshness, RequestKey, Trimmer};
use crate::error::CacheError;
use crate::fetch::Fetcher;
use crate::http::{Request, Response};
use crate::lifecycle::VersionSet;
use crate::router::RouteClass;

pub mod cache_first;
pub mod network_first;
pub mod stale_while_revalidate;

pub use cache_first::cache_first;
pub use network_first::network_first;
pub use stale_while_revalidate::stale_while_revalidate;

/// Everything a strategy needs. Cheap to clone; background refreshes carry
/// their own copy.
#[derive(Clone)]
pub struct StrategyContext {
    pub store: Arc<CacheStore>,
    pub fetcher: Arc<dyn Fetcher>,
    pub versions: VersionSet,
    pub freshness: Freshness,
    pub trimmer: Trimmer,
    pub network_timeout: Duration,
    pub offline_key: RequestKey,
    pub tasks: BackgroundTasks,
}

impl StrategyContext {
    /// Runs the strategy for `class`.
    ///
    /// # Errors
    ///
    /// Fails only when the strategy's whole fallback chain is exhausted.
    pub async fn execute(
        &self,
        class: RouteClass,
        request: Request,
        key: RequestKey,
    ) -> Result<Response, CacheError> {
        match class {
            RouteClass::Document => network_first(self, request, key).await,
            RouteClass::Asset => cache_first(self, request, key).await,
            RouteClass::Dynamic => stale_while_revalidate(self, request, key).await,
        }
    }
}

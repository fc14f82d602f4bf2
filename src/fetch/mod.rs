//! Network access — the seam between the strategies and the outside world.
//!
//! - [`Fetcher`] — trait implemented by anything that can turn a [`Request`]
//!   into a [`Response`]. Async closures implement it automatically.
//! - [`HttpFetcher`] — the production implementation over a `reqwest` client,
//!   optionally redirecting same-origin requests to an upstream server.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::trace;
use url::Url;

use crate::config::CacheConfig;
use crate::error::{CacheError, FetchError};
use crate::http::headers::is_hop_by_hop;
use crate::http::{Headers, Request, Response, StatusCode};

/// Boxed future returned by [`Fetcher::fetch`].
pub type FetchFuture<'a> = Pin<Box<dyn Future<Output = Result<Response, FetchError>> + Send + 'a>>;

/// Performs network fetches on behalf of the strategies.
///
/// A fetch that reaches the server succeeds even when the status is not `2xx`;
/// [`FetchError`] is reserved for requests that produced no response at all.
///
/// # Examples
///
/// ```rust,no_run
/// use rescache::error::FetchError;
/// use rescache::fetch::Fetcher;
/// use rescache::http::{Request, Response, StatusCode};
///
/// let always_ok = |_req: Request| async { Ok::<_, FetchError>(Response::new(StatusCode::OK).body("hi")) };
/// # fn assert_fetcher<F: Fetcher>(_: &F) {}
/// assert_fetcher(&always_ok);
/// ```
pub trait Fetcher: Send + Sync + 'static {
    /// Fetch `request` from the network.
    fn fetch(&self, request: Request) -> FetchFuture<'_>;
}

impl<T, F> Fetcher for T
where
    T: Fn(Request) -> F + Send + Sync + 'static,
    F: Future<Output = Result<Response, FetchError>> + Send + 'static,
{
    fn fetch(&self, request: Request) -> FetchFuture<'_> {
        Box::pin((self)(request))
    }
}

/// [`Fetcher`] backed by a shared `reqwest` connection pool.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    origin: Url,
    upstream: Option<Url>,
    timeout: Duration,
}

impl HttpFetcher {
    /// Connect timeout for upstream requests.
    const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

    /// Builds a fetcher for the origin and upstream named in `config`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Config`] if the URLs are invalid or the HTTP
    /// client cannot be constructed.
    pub fn new(config: &CacheConfig) -> Result<Self, CacheError> {
        let origin = config.origin_url()?;
        let upstream = config
            .upstream
            .as_deref()
            .map(Url::parse)
            .transpose()
            .map_err(|e| CacheError::Config(format!("upstream: {e}")))?;
        let timeout = config.fetch_timeout();
        let client = reqwest::Client::builder()
            .connect_timeout(Self::CONNECT_TIMEOUT.min(timeout))
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|e| CacheError::Config(format!("http client: {e}")))?;
        Ok(Self {
            client,
            origin,
            upstream,
            timeout,
        })
    }

    /// Where a request for `url` is actually sent.
    ///
    /// Same-origin URLs are moved onto the upstream when one is configured;
    /// everything else is fetched as-is.
    pub fn target_url(&self, url: &Url) -> Url {
        match &self.upstream {
            Some(upstream) if url.origin() == self.origin.origin() => {
                let mut target = upstream.clone();
                target.set_path(url.path());
                target.set_query(url.query());
                target
            }
            _ => url.clone(),
        }
    }

    async fn send(&self, request: Request) -> Result<Response, FetchError> {
        let target = self.target_url(request.url());
        let url = request.url().to_string();
        let method = reqwest::Method::from_bytes(request.method().as_str().as_bytes()).map_err(
            |e| FetchError::InvalidUrl {
                url: url.clone(),
                reason: e.to_string(),
            },
        )?;

        let mut builder = self.client.request(method, target.clone());
        for (name, value) in request.headers().iter() {
            if name.eq_ignore_ascii_case("host") || is_hop_by_hop(name) {
                continue;
            }
            builder = builder.header(name, value);
        }
        if !request.body().is_empty() {
            builder = builder.body(request.body().clone());
        }

        trace!(%url, %target, "fetching");
        let upstream = builder
            .send()
            .await
            .map_err(|e| self.transport_error(&url, &e))?;

        let status = upstream.status();
        let mut headers = Headers::with_capacity(upstream.headers().len());
        for (name, value) in upstream.headers() {
            if is_hop_by_hop(name.as_str()) {
                continue;
            }
            if let Ok(value) = value.to_str() {
                headers.insert(name.as_str(), value);
            }
        }
        let body = upstream
            .bytes()
            .await
            .map_err(|e| self.transport_error(&url, &e))?;

        Ok(Response::from_parts(
            StatusCode::from_u16(status.as_u16()),
            status.canonical_reason().unwrap_or_default(),
            headers,
            body,
        ))
    }

    fn transport_error(&self, url: &str, e: &reqwest::Error) -> FetchError {
        if e.is_timeout() {
            return FetchError::Timeout {
                url: url.to_owned(),
                after_ms: self.timeout.as_millis() as u64,
            };
        }
        FetchError::Transport {
            url: url.to_owned(),
            message: e.to_string(),
        }
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, request: Request) -> FetchFuture<'_> {
        Box::pin(self.send(request))
    }
}

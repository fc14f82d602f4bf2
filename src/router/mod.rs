//! Strategy routing — decide how each intercepted request is served.
//!
//! Same-origin `GET` requests are classified, in this order of precedence:
//!
//! | Class                      | Matches                                                   | Strategy               |
//! |----------------------------|-----------------------------------------------------------|------------------------|
//! | [`RouteClass::Document`]   | `Accept` names HTML/XHTML, `.html`/`.htm` path, or `/dir/` | network-first          |
//! | [`RouteClass::Asset`]      | path extension on the static asset allow-list             | cache-first            |
//! | [`RouteClass::Dynamic`]    | everything else                                           | stale-while-revalidate |
//!
//! Non-`GET` and cross-origin requests are never classified: they get
//! [`Route::PassThrough`] and go straight to the network.

use url::{Origin, Url};

use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::http::Request;

// Accept-header media types that mark a navigation to a document.
const DOCUMENT_MEDIA_TYPES: [&str; 2] = ["text/html", "application/xhtml+xml"];

/// The handling class of a cacheable request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteClass {
    /// Pages: freshest copy wanted, cache and offline page as fallback.
    Document,
    /// Static build assets: served from cache while fresh.
    Asset,
    /// Everything else: answered from cache, refreshed in the background.
    Dynamic,
}

impl RouteClass {
    /// Short lowercase label, used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Asset => "asset",
            Self::Dynamic => "dynamic",
        }
    }
}

/// The routing decision for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Forward to the network with no cache interaction.
    PassThrough,
    /// Serve through the strategy for this class.
    Cached(RouteClass),
}

/// Classifies requests against the serving origin.
///
/// # Examples
///
/// ```
/// use rescache::config::CacheConfig;
/// use rescache::http::Request;
/// use rescache::router::{Route, RouteClass, StrategyRouter};
///
/// let router = StrategyRouter::from_config(&CacheConfig::default()).unwrap();
///
/// let css = Request::get("http://localhost:8080/site.css").unwrap();
/// assert_eq!(router.route(&css), Route::Cached(RouteClass::Asset));
///
/// let cdn = Request::get("https://cdn.example.com/site.css").unwrap();
/// assert_eq!(router.route(&cdn), Route::PassThrough);
/// ```
#[derive(Debug, Clone)]
pub struct StrategyRouter {
    origin: Origin,
    asset_extensions: Vec<String>,
    document_extensions: Vec<String>,
}

impl StrategyRouter {
    /// Creates a router for `origin` with the given extension lists
    /// (without leading dots, matched case-insensitively).
    pub fn new(origin: &Url, asset_extensions: &[String], document_extensions: &[String]) -> Self {
        let lower = |exts: &[String]| -> Vec<String> {
            exts.iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect()
        };
        Self {
            origin: origin.origin(),
            asset_extensions: lower(asset_extensions),
            document_extensions: lower(document_extensions),
        }
    }

    /// Creates a router from the origin and extension lists in `config`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Config`] if the configured origin is invalid.
    pub fn from_config(config: &CacheConfig) -> Result<Self, CacheError> {
        Ok(Self::new(
            &config.origin_url()?,
            &config.asset_extensions,
            &config.document_extensions,
        ))
    }

    /// Returns `true` if `url` belongs to the serving origin.
    pub fn is_same_origin(&self, url: &Url) -> bool {
        url.origin() == self.origin
    }

    /// Decides whether `request` is cached at all, and if so under which class.
    pub fn route(&self, request: &Request) -> Route {
        if !request.method().is_cacheable() || !self.is_same_origin(request.url()) {
            return Route::PassThrough;
        }
        Route::Cached(self.classify(request))
    }

    /// Classifies `request` by declared accept type and path.
    ///
    /// Does not check method or origin; see [`route`](Self::route).
    pub fn classify(&self, request: &Request) -> RouteClass {
        let path = request.path();
        let extension = extension(path);
        let ext = extension.as_deref();

        let wants_document = request.accept().is_some_and(accepts_document);
        let document_path = path.ends_with('/')
            || ext.is_some_and(|ext| self.document_extensions.iter().any(|d| d == ext));

        if wants_document || document_path {
            RouteClass::Document
        } else if ext.is_some_and(|ext| self.asset_extensions.iter().any(|a| a == ext)) {
            RouteClass::Asset
        } else {
            RouteClass::Dynamic
        }
    }
}

// Returns the lowercased extension of the last path segment, if it has one.
fn extension(path: &str) -> Option<String> {
    let segment = path.rsplit('/').next().unwrap_or(path);
    let (stem, ext) = segment.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

fn accepts_document(accept: &str) -> bool {
    accept.split(',').any(|item| {
        let media = item.split(';').next().unwrap_or("").trim();
        DOCUMENT_MEDIA_TYPES
            .iter()
            .any(|d| media.eq_ignore_ascii_case(d))
    })
}

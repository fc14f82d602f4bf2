//! In-memory cache store.
//!
//! Namespaces are created on first write and live until deleted. Each one
//! keeps its entries in write order: replacing a key moves it to the newest
//! position, which is what the [`Trimmer`](super::Trimmer) evicts against.
//!
//! Entries are stored behind [`Arc`], so a reader either sees the old entry or
//! the new one, never a mix. There is no store-wide lock on the request path;
//! the outer [`RwLock`] is only taken for writing when a namespace is created
//! or deleted.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use url::Url;

use crate::http::{Headers, Method, Request, Response, StatusCode};

/// Canonical identity of a cacheable request: method plus full URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    method: Method,
    url: String,
}

impl RequestKey {
    /// Key for a `GET` of `url`. Fragments are not part of the identity.
    pub fn get(url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method: Method::Get,
            url: url.into(),
        }
    }

    /// Returns the key for `request`, or `None` when its method is not cacheable.
    pub fn for_request(request: &Request) -> Option<Self> {
        request
            .method()
            .is_cacheable()
            .then(|| Self::get(request.url()))
    }

    /// The request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The full request URL.
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

/// A stored response.
///
/// Immutable once written; a later write for the same key replaces it whole.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub status: u16,
    pub status_text: String,
    pub headers: Headers,
    pub body: Bytes,
    /// When the entry was written, if it was written with a timestamp.
    pub stored_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    /// Captures `response` as an entry stamped with `stored_at`.
    pub fn from_response(response: &Response, stored_at: Option<DateTime<Utc>>) -> Self {
        Self {
            status: response.status().as_u16(),
            status_text: response.status_text().to_owned(),
            headers: response.headers().clone(),
            body: response.content().clone(),
            stored_at,
        }
    }

    /// Rebuilds the response this entry was captured from.
    pub fn to_response(&self) -> Response {
        Response::from_parts(
            StatusCode::from_u16(self.status),
            self.status_text.clone(),
            self.headers.clone(),
            self.body.clone(),
        )
    }
}

#[derive(Debug, Default)]
struct Entries {
    by_key: HashMap<RequestKey, (u64, Arc<CacheEntry>)>,
    order: BTreeMap<u64, RequestKey>,
    next_seq: u64,
}

/// A named container of entries, keyed uniquely by [`RequestKey`].
#[derive(Debug)]
pub struct CacheNamespace {
    name: String,
    entries: Mutex<Entries>,
}

impl CacheNamespace {
    fn new(name: String) -> Self {
        Self {
            name,
            entries: Mutex::new(Entries::default()),
        }
    }

    /// The namespace name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the entry stored under `key`.
    pub fn get(&self, key: &RequestKey) -> Option<Arc<CacheEntry>> {
        self.entries
            .lock()
            .by_key
            .get(key)
            .map(|(_, entry)| Arc::clone(entry))
    }

    /// Stores `entry` under `key` as the newest entry, replacing any previous one.
    pub fn put(&self, key: RequestKey, entry: CacheEntry) {
        let mut entries = self.entries.lock();
        let seq = entries.next_seq;
        entries.next_seq += 1;
        if let Some((old_seq, _)) = entries.by_key.remove(&key) {
            entries.order.remove(&old_seq);
        }
        entries.order.insert(seq, key.clone());
        entries.by_key.insert(key, (seq, Arc::new(entry)));
    }

    /// Removes `key`. Returns `true` if an entry was removed.
    pub fn delete(&self, key: &RequestKey) -> bool {
        let mut entries = self.entries.lock();
        match entries.by_key.remove(key) {
            Some((seq, _)) => {
                entries.order.remove(&seq);
                true
            }
            None => false,
        }
    }

    /// Keys in write order, oldest first.
    pub fn keys(&self) -> Vec<RequestKey> {
        self.entries.lock().order.values().cloned().collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.lock().by_key.len()
    }

    /// Returns `true` if the namespace holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evicts the oldest entries until at most `max` remain, returning the evicted keys.
    pub fn evict_oldest(&self, max: usize) -> Vec<RequestKey> {
        let mut entries = self.entries.lock();
        let surplus = entries.by_key.len().saturating_sub(max);
        let mut evicted = Vec::with_capacity(surplus);
        for _ in 0..surplus {
            let Some((_, key)) = entries.order.pop_first() else {
                break;
            };
            entries.by_key.remove(&key);
            evicted.push(key);
        }
        evicted
    }
}

/// The set of named cache namespaces.
///
/// # Examples
///
/// ```
/// use rescache::cache::{CacheEntry, CacheStore, RequestKey};
/// use rescache::http::{Response, StatusCode};
///
/// let store = CacheStore::new();
/// let key = RequestKey::get(&"http://localhost/app.js".parse().unwrap());
/// let response = Response::new(StatusCode::OK).body("console.log(1)");
///
/// store.put("app-v1", key.clone(), CacheEntry::from_response(&response, None));
/// assert_eq!(store.get("app-v1", &key).unwrap().body, response.content());
///
/// assert!(store.delete_namespace("app-v1"));
/// assert!(!store.delete_namespace("app-v1"));
/// ```
#[derive(Debug, Default)]
pub struct CacheStore {
    namespaces: RwLock<Vec<Arc<CacheNamespace>>>,
}

impl CacheStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the namespace called `name`, creating it if needed.
    pub fn open(&self, name: &str) -> Arc<CacheNamespace> {
        if let Some(ns) = self.namespace(name) {
            return ns;
        }
        let mut namespaces = self.namespaces.write();
        if let Some(ns) = namespaces.iter().find(|ns| ns.name == name) {
            return Arc::clone(ns);
        }
        let ns = Arc::new(CacheNamespace::new(name.to_owned()));
        namespaces.push(Arc::clone(&ns));
        ns
    }

    /// Returns the namespace called `name` without creating it.
    pub fn namespace(&self, name: &str) -> Option<Arc<CacheNamespace>> {
        self.namespaces
            .read()
            .iter()
            .find(|ns| ns.name == name)
            .map(Arc::clone)
    }

    /// Returns `true` if a namespace called `name` exists.
    pub fn has(&self, name: &str) -> bool {
        self.namespace(name).is_some()
    }

    /// Names of every namespace, in creation order.
    pub fn names(&self) -> Vec<String> {
        self.namespaces
            .read()
            .iter()
            .map(|ns| ns.name.clone())
            .collect()
    }

    /// Deletes the namespace called `name` with all its entries.
    ///
    /// Deleting a namespace that does not exist is a no-op returning `false`.
    pub fn delete_namespace(&self, name: &str) -> bool {
        let mut namespaces = self.namespaces.write();
        let before = namespaces.len();
        namespaces.retain(|ns| ns.name != name);
        namespaces.len() < before
    }

    /// Looks up `key` in the namespace called `name`.
    pub fn get(&self, name: &str, key: &RequestKey) -> Option<Arc<CacheEntry>> {
        self.namespace(name)?.get(key)
    }

    /// Looks up `key` in every namespace, oldest namespace first.
    pub fn match_any(&self, key: &RequestKey) -> Option<Arc<CacheEntry>> {
        self.namespaces.read().iter().find_map(|ns| ns.get(key))
    }

    /// Writes `entry` under `key` into the namespace called `name`, creating the
    /// namespace if needed.
    ///
    /// The write happens while the namespace list is locked, so it cannot land
    /// in a namespace that is concurrently being deleted.
    pub fn put(&self, name: &str, key: RequestKey, entry: CacheEntry) {
        {
            let namespaces = self.namespaces.read();
            if let Some(ns) = namespaces.iter().find(|ns| ns.name == name) {
                ns.put(key, entry);
                return;
            }
        }
        let mut namespaces = self.namespaces.write();
        match namespaces.iter().find(|ns| ns.name == name) {
            Some(ns) => ns.put(key, entry),
            None => {
                let ns = Arc::new(CacheNamespace::new(name.to_owned()));
                ns.put(key, entry);
                namespaces.push(ns);
            }
        }
    }

    /// Removes `key` from the namespace called `name`.
    pub fn delete(&self, name: &str, key: &RequestKey) -> bool {
        self.namespace(name).is_some_and(|ns| ns.delete(key))
    }

    /// Keys of the namespace called `name` in write order; empty if it does not exist.
    pub fn keys(&self, name: &str) -> Vec<RequestKey> {
        self.namespace(name)
            .map(|ns| ns.keys())
            .unwrap_or_default()
    }
}

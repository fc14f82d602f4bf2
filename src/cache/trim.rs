//! Entry-count bound for runtime namespaces.

use tracing::debug;

use super::CacheStore;

/// Keeps a namespace at or below a maximum number of entries.
///
/// Only the surplus is removed, strictly oldest write first. Trimming a
/// namespace that does not exist, or one already within bounds, does nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trimmer {
    max_entries: usize,
}

impl Trimmer {
    pub fn new(max_entries: usize) -> Self {
        Self { max_entries }
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Trims `namespace` in `store`, returning how many entries were evicted.
    pub fn trim(&self, store: &CacheStore, namespace: &str) -> usize {
        let Some(ns) = store.namespace(namespace) else {
            return 0;
        };
        let evicted = ns.evict_oldest(self.max_entries);
        if !evicted.is_empty() {
            debug!(
                namespace,
                evicted = evicted.len(),
                max = self.max_entries,
                "trimmed namespace"
            );
        }
        evicted.len()
    }
}

#[cfg(test)]
mod tests {
    use url::Url;

    use super::*;
    use crate::cache::{CacheEntry, RequestKey};
    use crate::http::{Response, StatusCode};

    fn key(i: usize) -> RequestKey {
        RequestKey::get(&Url::parse(&format!("http://localhost/api/{i}")).unwrap())
    }

    fn fill(store: &CacheStore, n: usize) {
        let entry = CacheEntry::from_response(&Response::new(StatusCode::OK), None);
        for i in 0..n {
            store.put("runtime", key(i), entry.clone());
        }
    }

    #[test]
    fn keeps_most_recent_entries() {
        let store = CacheStore::new();
        fill(&store, 10);
        assert_eq!(Trimmer::new(4).trim(&store, "runtime"), 6);
        assert_eq!(store.keys("runtime"), (6..10).map(key).collect::<Vec<_>>());
    }

    #[test]
    fn within_bound_is_untouched() {
        let store = CacheStore::new();
        fill(&store, 3);
        assert_eq!(Trimmer::new(3).trim(&store, "runtime"), 0);
        assert_eq!(store.keys("runtime").len(), 3);
    }

    #[test]
    fn repeated_trim_is_idempotent() {
        let store = CacheStore::new();
        fill(&store, 5);
        let trimmer = Trimmer::new(2);
        trimmer.trim(&store, "runtime");
        assert_eq!(trimmer.trim(&store, "runtime"), 0);
        assert_eq!(store.keys("runtime").len(), 2);
    }

    #[test]
    fn missing_namespace_is_noop() {
        assert_eq!(Trimmer::new(1).trim(&CacheStore::new(), "gone"), 0);
    }
}

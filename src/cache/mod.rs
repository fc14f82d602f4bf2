//! Caching layer — versioned namespaces of request → response entries.
//!
//! - [`CacheStore`] — the set of named namespaces (open, get, put, delete,
//!   delete-namespace, enumerate keys).
//! - [`Freshness`] — decides whether a stored entry is still fresh.
//! - [`Trimmer`] — bounds a namespace to a maximum entry count, evicting the
//!   oldest writes first.

pub mod freshness;
pub mod store;
pub mod trim;

pub use freshness::Freshness;
pub use store::{CacheEntry, CacheNamespace, CacheStore, RequestKey};
pub use trim::Trimmer;

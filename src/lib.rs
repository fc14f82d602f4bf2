//! # rescache
//!
//! An async resource cache manager. Each request is routed to one of three
//! caching strategies, responses live in versioned cache namespaces, and a
//! small control protocol lets callers inspect or reset the cache.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use rescache::{CacheConfig, CacheManager, Request};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = Arc::new(CacheManager::with_http(CacheConfig::default())?);
//!     manager.start().await?;
//!
//!     let response = manager.handle(Request::get("http://localhost:8080/")?).await?;
//!     println!("{}", response.status());
//!
//!     manager.shutdown().await;
//!     Ok(())
//! }
//! ```

// ── Primitives ────────────────────────────────────────────────────────────────
pub mod config;
pub mod error;
pub mod http;

// ── Caching core ──────────────────────────────────────────────────────────────
pub mod cache;
pub mod lifecycle;
pub mod router;
pub mod strategy;

// ── Collaborators and plumbing ────────────────────────────────────────────────
pub mod background;
pub mod control;
pub mod events;
pub mod fetch;
pub mod manager;
pub mod server;

#[cfg(test)]
mod testing;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use cache::{CacheEntry, CacheStore, RequestKey};
pub use config::CacheConfig;
pub use control::{ControlCommand, ControlHandle, ControlReply};
pub use error::{CacheError, FetchError};
pub use events::ManagerEvent;
pub use fetch::{Fetcher, HttpFetcher};
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use lifecycle::{LifecycleState, VersionSet};
pub use manager::CacheManager;
pub use server::{Server, ServerError};

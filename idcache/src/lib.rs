//! Persistent bidirectional translation cache for hash-derived proxy IDs.
//!
//! Each configured entity type (e.g. `host`, `group`) owns a pair of maps:
//! `proxyID → (backendID → originalID)` and the reverse direction. The whole
//! tree is snapshotted as one JSON blob into an embedded redb file, restored
//! on startup, and maintained by two background tasks (TTL eviction and
//! periodic autosave).

pub mod cache;
pub mod config;
pub mod store;
mod workers;

pub use cache::{TranslationCache, TypeCache};
pub use config::CacheConfig;
pub use store::{CacheError, SnapshotStore};

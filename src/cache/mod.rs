//! Cache module for idempotent API reads
//!
//! This module provides an in-memory response cache keyed by request signature
//! with per-entry TTL (time-to-live) values. Expired entries are never served:
//! they are dropped lazily by the lookup that finds them. Entries can also be
//! invalidated explicitly by substring pattern, or wholesale on logout.

mod response;

pub use response::{cache_key, CacheEntry, ResponseCache};

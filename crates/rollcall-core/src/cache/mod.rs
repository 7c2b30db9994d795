//! Session-scoped response cache.
//!
//! This module provides:
//! - `TtlStore`: key/value entries with a per-entry time-to-live, kept in
//!   the shared session storage under a private key prefix
//! - `DepValue` and `derive_cache_key`: deterministic keys built from a
//!   producer label and its dependency list
//!
//! Entries are volatile: nothing outlives the storage instance.

pub mod key;
pub mod store;

pub use key::{derive_cache_key, serialize, serialize_list, DepValue};
pub use store::{CacheEntry, EntryInfo, KeyPattern, TtlStore, DEFAULT_KEY_PREFIX};

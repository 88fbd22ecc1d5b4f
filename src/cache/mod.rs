// src/cache/mod.rs

//! Content-addressed build artifact cache
//!
//! Cache keys are SHA-256 digests of the canonical JSON of every input that
//! can influence a build's output. Entries live under
//! `cache/<first-2-hex>/<key>/` with the artifact files plus a
//! `manifest.json` repeating the key inputs; readers compare the stored
//! manifest byte-for-byte before reuse and treat any mismatch as a miss.

mod keys;
mod store;

pub use keys::{cache_key, BuildCacheInput};
pub use store::{BuildCacheStore, CacheEntry};

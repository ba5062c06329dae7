//! Content-addressed artifact cache for tarmac.
//!
//! Three pieces: a deterministic input hasher, a cache-key deriver, and a
//! filesystem store of compressed directory archives keyed per job.

pub mod archive;
pub mod hasher;
pub mod key;
pub mod store;

pub use hasher::hash_inputs;
pub use key::{KEY_SCHEMA_VERSION, derive_key};
pub use store::{CacheStore, EntryMeta};

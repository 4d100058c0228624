//! # tidesync Cache
//!
//! Normalized record cache for tidesync.
//!
//! Query results arrive already decomposed into flat [`Record`]s,
//! addressed by a **composite key** derived from the path used to reach
//! them (for example `"QUERY_ROOT.posts.0"`). Nested objects are
//! replaced by [`FieldValue::Reference`] values pointing at other
//! records, so repeated merges of the same backend entity overwrite
//! rather than duplicate state.
//!
//! ## Key Invariants
//!
//! - `merge` is atomic and serialized against itself; loads never see a
//!   partial merge
//! - `merge` returns exactly the set of field-level keys whose stored
//!   value changed, so merging the same record set twice reports an
//!   empty change set the second time
//! - References round-trip distinctly from string scalars: a stored
//!   string that happens to look like a serialized reference is never
//!   misread as one
//! - A malformed persisted record fails its own decode without
//!   affecting unrelated records
//!
//! ## Example
//!
//! ```rust
//! use tidesync_cache::{FieldValue, MemoryCache, NormalizedCache, Record, RecordSet};
//!
//! let cache = MemoryCache::new();
//! let mut record = Record::new();
//! record.insert("title", FieldValue::from("hello"));
//! let mut set = RecordSet::new();
//! set.insert("QUERY_ROOT.post", record);
//!
//! let changed = cache.merge(set).unwrap();
//! assert!(changed.contains("QUERY_ROOT.post.title"));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cache;
mod error;
mod record;
mod value;

pub use cache::{MemoryCache, NormalizedCache, TableCache};
pub use error::{CacheError, CacheResult};
pub use record::{record_keys, CacheKey, ChangedKeys, Record, RecordSet};
pub use value::FieldValue;

//! # tidesync Store
//!
//! Durable key/value table abstraction for tidesync.
//!
//! The synchronization engine persists three independent kinds of state:
//! queued mutations, normalized cache records and per-session sync
//! metadata. All three go through the same [`KeyValueTable`] trait so
//! that each can be independently persisted, relocated, or kept
//! in-memory (in which case it is lost on restart).
//!
//! ## Design Principles
//!
//! - Tables are opaque byte stores keyed by UTF-8 strings
//! - `scan` returns entries in key order, so callers can encode queue
//!   position into keys
//! - Writes are durable before the call returns
//! - Tables must be `Send + Sync` for concurrent access
//!
//! ## Available Tables
//!
//! - [`MemoryTable`] - For testing and ephemeral storage
//! - [`FileTable`] - Append-only log with replay-on-open
//!
//! ## Example
//!
//! ```rust
//! use tidesync_store::{KeyValueTable, MemoryTable};
//!
//! let table = MemoryTable::new();
//! table.put("a", b"1").unwrap();
//! assert_eq!(table.get("a").unwrap(), Some(b"1".to_vec()));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod file;
mod memory;
mod table;

pub use error::{StoreError, StoreResult};
pub use file::FileTable;
pub use memory::MemoryTable;
pub use table::KeyValueTable;
